// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Execution counters for pipeline stages
//!
//! The placement daemon records one entry per pipeline stage, the worker
//! daemon one per job action, and the reconcilers one per integration
//! outcome.  Recording never affects control flow.

use schemars::JsonSchema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// Snapshot of the counters for one named stage
#[derive(Clone, Debug, Default, JsonSchema, PartialEq, Serialize)]
pub struct StageStats {
    /// number of times the stage ran to success
    pub successes: u64,
    /// number of times the stage reported an error
    pub errors: u64,
    /// total wall-clock time spent in the stage, in microseconds
    pub total_usec: u64,
    /// longest single execution, in microseconds
    pub max_usec: u64,
}

/// Shared registry of [`StageStats`], keyed by stage name
#[derive(Clone, Debug, Default)]
pub struct StatsRegistry {
    stages: Arc<Mutex<BTreeMap<String, StageStats>>>,
}

impl StatsRegistry {
    pub fn new() -> StatsRegistry {
        StatsRegistry::default()
    }

    /// Record one execution of `stage` that took `elapsed`.
    pub fn record(&self, stage: &str, elapsed: Duration, success: bool) {
        let usec = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let mut stages = self.stages.lock().unwrap();
        let stats = stages.entry(stage.to_string()).or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.errors += 1;
        }
        stats.total_usec = stats.total_usec.saturating_add(usec);
        stats.max_usec = stats.max_usec.max(usec);
    }

    /// Count an event that has no meaningful duration.
    pub fn increment(&self, stage: &str, success: bool) {
        self.record(stage, Duration::ZERO, success)
    }

    pub fn get(&self, stage: &str) -> Option<StageStats> {
        self.stages.lock().unwrap().get(stage).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StageStats> {
        self.stages.lock().unwrap().clone()
    }
}
