// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors reported by the key-value layer

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("compare failed on {key}: {reason}")]
    Conflict { key: String, reason: String },

    #[error("{key} is a directory")]
    IsDirectory { key: String },

    #[error("watch history before index {index} has been cleared")]
    IndexCleared { index: u64 },

    #[error("lock {key} is held by {holder:?}")]
    LockHeld { key: String, holder: String },

    #[error("lock {key} was lost")]
    LockLost { key: String },

    #[error("watcher has been closed")]
    WatcherClosed,

    #[error("prefix {prefix} is not being watched")]
    NotWatched { prefix: String },

    #[error("request to {url} failed")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },

    #[error("bad response from key-value store: {0}")]
    Protocol(String),

    /// any other error reported by the store itself
    #[error("key-value store error {code}: {message} ({cause})")]
    Store { code: u64, message: String, cause: String },
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Returns true if the changes the caller asked for are gone, so a
    /// watch can only be re-established from the store's current index.
    pub fn is_watch_restart(&self) -> bool {
        matches!(self, Error::IndexCleared { .. })
    }

    /// Returns true if the store could not be reached or the connection
    /// broke.  Trying again later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Request { .. })
    }
}
