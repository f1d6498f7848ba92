// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tuning shared by the reconciliation daemons

use camino::Utf8Path;
use camino::Utf8PathBuf;
use corral_common::backoff::BackoffConfig;
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
    pub kv_timeout_secs: u64,
    pub lock_ttl_secs: u64,
    /// delay between attempts to take the daemon's lock
    pub lock_backoff: BackoffConfig,
    /// delay between attempts to load the full state after a failure
    pub refetch_backoff: BackoffConfig,
    /// run after any generated file changed, e.g.
    /// `["systemctl", "restart", "isc-dhcp-server"]`; empty runs nothing
    pub reload_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            kv_timeout_secs: 10,
            lock_ttl_secs: 30,
            lock_backoff: BackoffConfig::default(),
            refetch_backoff: BackoffConfig { initial_ms: 500, max_ms: 30_000 },
            reload_command: Vec::new(),
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

    pub fn kv_timeout(&self) -> Duration {
        Duration::from_secs(self.kv_timeout_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}
