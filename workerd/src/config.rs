// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tuning for the worker daemon

use camino::Utf8Path;
use camino::Utf8PathBuf;
use corral_common::backoff::BackoffConfig;
use corral_jobqueue::QueueConfig;
use serde::Deserialize;
use std::time::Duration;

/// Guest actions passed through to the agent unless configured otherwise
pub const DEFAULT_GUEST_ACTIONS: &[&str] =
    &["start", "stop", "shutdown", "reboot", "restart", "poweroff"];

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
    pub deadline_backoff: BackoffConfig,
    pub job_ttl_secs: u64,
    pub kv_timeout_secs: u64,
    /// port the hypervisor agents listen on
    pub agent_port: u16,
    pub agent_timeout_secs: u64,
    /// how long to wait before asking an agent about a job again
    pub poll_interval_secs: u64,
    pub guest_actions: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue: QueueConfig::default(),
            deadline_backoff: BackoffConfig::default(),
            job_ttl_secs: corral_store::DEFAULT_JOB_TTL.as_secs(),
            kv_timeout_secs: 10,
            agent_port: 8080,
            agent_timeout_secs: 30,
            poll_interval_secs: 5,
            guest_actions: DEFAULT_GUEST_ACTIONS
                .iter()
                .map(|action| action.to_string())
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

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_secs(self.kv_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
