// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the replicated key-value store holding all cluster state
//!
//! The store is hierarchical: keys look like filesystem paths
//! (`/corral/guests/<id>/metadata`), and a "directory" is any prefix that has
//! keys below it.  Every mutation is assigned a cluster-wide, strictly
//! increasing modification index.  That index doubles as the version token
//! used for optimistic concurrency: [`KvStore::compare_and_swap()`] succeeds
//! only if the key's current index matches the caller's.
//!
//! Implementations:
//!
//! * [`etcd::EtcdKv`]: an etcd v2 HTTP API client, used by the daemons
//! * [`sim::SimKv`]: an in-process store with the same semantics, used by
//!   the test suites
//!
//! Built on top of the trait:
//!
//! * [`watcher::Watcher`]: merges watches on several prefixes into one
//!   ordered event stream
//! * [`lock::Lock`]: a TTL-based distributed mutex

mod error;
pub mod etcd;
pub mod lock;
pub mod sim;
pub mod watcher;

pub use error::Error;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;

/// A leaf value read from the store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvValue {
    pub key: String,
    pub value: String,
    /// modification index of the key: its version token
    pub index: u64,
}

/// One immediate child of a directory, as returned by [`KvStore::list()`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvNode {
    pub key: String,
    /// `None` for directories
    pub value: Option<String>,
    pub dir: bool,
    pub index: u64,
}

impl KvNode {
    /// Returns the last path component of this node's key.
    pub fn name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// What happened to a key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    /// explicit deletion or TTL expiry
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        })
    }
}

/// One change observed through a watch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    /// new value for creates and updates; `None` for deletes
    pub value: Option<String>,
    /// modification index at which the store applied this change
    pub index: u64,
}

/// Stream of changes under a watched prefix, in store-apply order
pub type WatchStream = BoxStream<'static, Result<WatchEvent, Error>>;

/// Operations provided by the key-value store
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read a single leaf key.  Returns [`Error::NotFound`] if it does not
    /// exist.
    async fn get(&self, key: &str) -> Result<KvValue, Error>;

    /// Unconditionally write `value` at `key`, returning the new index.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error>;

    /// Write `value` at `key` only if `key` does not exist yet.  Returns
    /// [`Error::Conflict`] if it does.
    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error>;

    /// Write `value` at `key` only if the key's current modification index is
    /// `prev_index`.  Returns [`Error::Conflict`] on mismatch and
    /// [`Error::NotFound`] if the key is gone.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<u64, Error>;

    /// Remove `key`.  With `recursive`, everything below `key` goes too.
    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error>;

    /// Remove the leaf `key` only if its modification index is `prev_index`.
    async fn compare_and_delete(
        &self,
        key: &str,
        prev_index: u64,
    ) -> Result<(), Error>;

    /// List the immediate children of directory `prefix`.  Returns
    /// [`Error::NotFound`] if nothing exists below `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, Error>;

    /// Returns the index of the most recent mutation anywhere in the store.
    async fn head_index(&self) -> Result<u64, Error>;

    /// Watch for changes to any key at or below `prefix` that are applied
    /// after index `after_index` (0 means "from now on").
    ///
    /// The stream may end, or yield [`Error::IndexCleared`], when the store
    /// restarts the watch on its side; callers re-establish it from the last
    /// index they saw.
    async fn watch(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<WatchStream, Error>;
}

/// Returns `prefix` without a trailing '/'.
pub(crate) fn normalize_prefix(prefix: &str) -> &str {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

/// Returns true if `key` is `prefix` itself or lies below it.
pub(crate) fn key_under(key: &str, prefix: &str) -> bool {
    let prefix = normalize_prefix(prefix);
    if prefix == "/" {
        return true;
    }
    key == prefix
        || (key.starts_with(prefix)
            && key.as_bytes().get(prefix.len()) == Some(&b'/'))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_key_under() {
        assert!(key_under("/corral/guests/g1/metadata", "/corral/guests"));
        assert!(key_under("/corral/guests/g1/metadata", "/corral/guests/"));
        assert!(key_under("/corral/guests", "/corral/guests"));
        assert!(!key_under("/corral/guestsx/g1", "/corral/guests"));
        assert!(!key_under("/corral/hypervisors/h1", "/corral/guests"));
        assert!(key_under("/anything", "/"));
    }

    #[test]
    fn test_node_name() {
        let node = KvNode {
            key: "/corral/hypervisors/h1/guests/g1".to_string(),
            value: Some(String::new()),
            dir: false,
            index: 3,
        };
        assert_eq!(node.name(), "g1");
    }
}
