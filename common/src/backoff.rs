// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use serde::Deserialize;
use std::time::Duration;

pub use ::backoff::future::{retry, retry_notify};
pub use ::backoff::Error as BackoffError;
pub use ::backoff::{backoff::Backoff, ExponentialBackoff, Notify};

/// Configurable, capped delay between attempts
///
/// Used by the consume loops when the queue broker reports reservation
/// contention, and by callers that need to retry a CAS conflict.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    /// first delay, in milliseconds
    pub initial_ms: u64,
    /// no delay is ever longer than this, in milliseconds
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig { initial_ms: 5_000, max_ms: 30_000 }
    }
}

impl BackoffConfig {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms.max(self.initial_ms))
    }

    /// Returns a policy that retries forever, never waiting more than
    /// [`BackoffConfig::max()`] between attempts.
    pub fn policy(&self) -> ::backoff::ExponentialBackoff {
        policy_with_max(self.initial(), self.max())
    }
}

fn policy_with_max(
    initial_interval: Duration,
    max_interval: Duration,
) -> ::backoff::ExponentialBackoff {
    let current_interval = initial_interval;
    ::backoff::ExponentialBackoff {
        current_interval,
        initial_interval,
        multiplier: 2.0,
        max_interval,
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    }
}
