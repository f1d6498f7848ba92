// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tuning for the placement daemon
//!
//! Everything here has a default, so the config file is optional and may
//! name only the settings it changes:
//!
//! ```toml
//! candidates = [ "alive", "resources", "random" ]
//! retry_delay_secs = 10
//!
//! [queue]
//! ttr_secs = 120
//! ```

use camino::Utf8Path;
use camino::Utf8PathBuf;
use corral_common::backoff::BackoffConfig;
use corral_jobqueue::QueueConfig;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("parse \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    /// wait between reserves while the broker reports DEADLINE_SOON
    pub deadline_backoff: BackoffConfig,
    /// how long a job record survives its last update
    pub job_ttl_secs: u64,
    pub lock_ttl_secs: u64,
    /// timeout for individual KV requests
    pub kv_timeout_secs: u64,
    /// delay before a task that failed for a transient reason is retried
    pub retry_delay_secs: u64,
    /// candidate functions, applied in this order
    pub candidates: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue: QueueConfig::default(),
            deadline_backoff: BackoffConfig::default(),
            job_ttl_secs: corral_store::DEFAULT_JOB_TTL.as_secs(),
            lock_ttl_secs: 30,
            kv_timeout_secs: 10,
            retry_delay_secs: 5,
            candidates: crate::candidates::DEFAULT_ORDER
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        toml::from_str(&contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_secs(self.kv_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}
