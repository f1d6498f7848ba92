// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated, in-process key-value store
//!
//! [`SimKv`] implements the full [`KvStore`] contract (modification indexes,
//! compare-and-swap, TTLs, directories, watches with history) in memory.  It
//! backs the test suites of every crate that talks to the store, and it can
//! stand in for etcd when running a daemon by hand.
//!
//! TTL expiry is lazy: expired keys are removed (and delete events emitted
//! for them) at the start of the next operation on the store.  Expiry uses
//! `tokio::time`, so tests can drive it with a paused clock.

use crate::key_under;
use crate::normalize_prefix;
use crate::Error;
use crate::EventKind;
use crate::KvNode;
use crate::KvStore;
use crate::KvValue;
use crate::WatchEvent;
use crate::WatchStream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Number of past events kept for watches that start in the past
pub const HISTORY_LEN: usize = 1000;

/// Capacity of the live event channel shared by all watch streams
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Entry {
    value: String,
    index: u64,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct Inner {
    /// index of the most recent mutation
    index: u64,
    entries: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    /// how the next watches opened are to break, oldest first
    interruptions: VecDeque<(usize, Option<Error>)>,
    /// `after_index` of every watch opened
    watches: Vec<u64>,
}

pub struct SimKv {
    inner: Mutex<Inner>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for SimKv {
    fn default() -> Self {
        SimKv::new()
    }
}

impl SimKv {
    pub fn new() -> SimKv {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        SimKv { inner: Mutex::new(Inner::default()), events }
    }

    /// Returns the index of the most recent mutation.
    pub fn current_index(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        inner.index
    }

    /// Makes the next watch opened pass on `events` events and then end, or
    /// fail with `error` if one is given.
    pub fn interrupt_next_watch(&self, events: usize, error: Option<Error>) {
        let mut inner = self.inner.lock().unwrap();
        inner.interruptions.push_back((events, error));
    }

    /// Returns the index each watch opened so far started after.
    pub fn watches_opened(&self) -> Vec<u64> {
        self.inner.lock().unwrap().watches.clone()
    }

    /// Removes any keys whose TTL has passed.
    pub fn expire_now(&self) {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
    }

    fn purge_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires.is_some_and(|at| at <= now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            inner.entries.remove(&key);
            self.record(inner, key, EventKind::Delete, None);
        }
    }

    /// Assigns the next index to a change and publishes it.
    fn record(
        &self,
        inner: &mut Inner,
        key: String,
        kind: EventKind,
        value: Option<String>,
    ) -> u64 {
        inner.index += 1;
        let event = WatchEvent { key, kind, value, index: inner.index };
        if inner.history.len() == HISTORY_LEN {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        // Nobody may be watching; that's fine.
        let _ = self.events.send(event);
        inner.index
    }

    fn write(
        &self,
        inner: &mut Inner,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        if has_children(inner, key) {
            return Err(Error::IsDirectory { key: key.to_string() });
        }
        let kind = if inner.entries.contains_key(key) {
            EventKind::Update
        } else {
            EventKind::Create
        };
        let index =
            self.record(inner, key.to_string(), kind, Some(value.to_string()));
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                index,
                expires: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(index)
    }
}

fn has_children(inner: &Inner, key: &str) -> bool {
    let dir = format!("{}/", normalize_prefix(key));
    inner
        .entries
        .range(dir.clone()..)
        .next()
        .is_some_and(|(k, _)| k.starts_with(&dir))
}

#[async_trait]
impl KvStore for SimKv {
    async fn get(&self, key: &str) -> Result<KvValue, Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        match inner.entries.get(key) {
            Some(entry) => Ok(KvValue {
                key: key.to_string(),
                value: entry.value.clone(),
                index: entry.index,
            }),
            None if has_children(&inner, key) => {
                Err(Error::IsDirectory { key: key.to_string() })
            }
            None => Err(Error::NotFound { key: key.to_string() }),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        self.write(&mut inner, key, value, ttl)
    }

    async fn create(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        if inner.entries.contains_key(key) || has_children(&inner, key) {
            return Err(Error::Conflict {
                key: key.to_string(),
                reason: String::from("key already exists"),
            });
        }
        self.write(&mut inner, key, value, ttl)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        prev_index: u64,
    ) -> Result<u64, Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let current = match inner.entries.get(key) {
            Some(entry) => entry.index,
            None => return Err(Error::NotFound { key: key.to_string() }),
        };
        if current != prev_index {
            return Err(Error::Conflict {
                key: key.to_string(),
                reason: format!(
                    "expected index {}, found {}",
                    prev_index, current
                ),
            });
        }
        self.write(&mut inner, key, value, ttl)
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);

        let mut doomed = Vec::new();
        if inner.entries.contains_key(key) {
            doomed.push(key.to_string());
        }
        if has_children(&inner, key) {
            if !recursive {
                return Err(Error::IsDirectory { key: key.to_string() });
            }
            doomed.extend(
                inner
                    .entries
                    .keys()
                    .filter(|k| k.as_str() != key && key_under(k, key))
                    .cloned(),
            );
        }
        if doomed.is_empty() {
            return Err(Error::NotFound { key: key.to_string() });
        }

        for key in doomed {
            inner.entries.remove(&key);
            self.record(&mut inner, key, EventKind::Delete, None);
        }
        Ok(())
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        prev_index: u64,
    ) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);
        let current = match inner.entries.get(key) {
            Some(entry) => entry.index,
            None => return Err(Error::NotFound { key: key.to_string() }),
        };
        if current != prev_index {
            return Err(Error::Conflict {
                key: key.to_string(),
                reason: format!(
                    "expected index {}, found {}",
                    prev_index, current
                ),
            });
        }
        inner.entries.remove(key);
        self.record(&mut inner, key.to_string(), EventKind::Delete, None);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvNode>, Error> {
        let mut inner = self.inner.lock().unwrap();
        self.purge_expired(&mut inner);

        let prefix = normalize_prefix(prefix);
        let dir = if prefix == "/" {
            String::from("/")
        } else {
            format!("{}/", prefix)
        };
        let mut children: BTreeMap<String, KvNode> = BTreeMap::new();
        for (key, entry) in inner.entries.range(dir.clone()..) {
            let Some(rest) = key.strip_prefix(&dir) else {
                break;
            };
            let (name, is_leaf) = match rest.split_once('/') {
                Some((name, _)) => (name, false),
                None => (rest, true),
            };
            let child_key = format!("{}{}", dir, name);
            let node = children.entry(child_key.clone()).or_insert(KvNode {
                key: child_key,
                value: None,
                dir: !is_leaf,
                index: 0,
            });
            if is_leaf {
                node.value = Some(entry.value.clone());
                node.index = entry.index;
            } else {
                node.dir = true;
                node.index = node.index.max(entry.index);
            }
        }

        if children.is_empty() {
            return Err(Error::NotFound { key: prefix.to_string() });
        }
        Ok(children.into_values().collect())
    }

    async fn head_index(&self) -> Result<u64, Error> {
        Ok(self.current_index())
    }

    async fn watch(
        &self,
        prefix: &str,
        after_index: u64,
    ) -> Result<WatchStream, Error> {
        let prefix = normalize_prefix(prefix).to_string();

        // Subscribe and snapshot the history under the same lock so that the
        // replayed and live portions of the stream neither overlap nor leave
        // a gap.
        let (replay, receiver, start_index, interruption) = {
            let mut inner = self.inner.lock().unwrap();
            self.purge_expired(&mut inner);
            inner.watches.push(after_index);
            let receiver = self.events.subscribe();

            let (replay, start_index) = if after_index == 0 {
                (Vec::new(), inner.index)
            } else {
                let oldest = inner
                    .history
                    .front()
                    .map(|e| e.index)
                    .unwrap_or(inner.index + 1);
                if after_index < inner.index && after_index + 1 < oldest {
                    return Err(Error::IndexCleared { index: after_index });
                }
                let replay: Vec<WatchEvent> = inner
                    .history
                    .iter()
                    .filter(|e| e.index > after_index)
                    .filter(|e| key_under(&e.key, &prefix))
                    .cloned()
                    .collect();
                (replay, after_index.max(inner.index))
            };
            let interruption = inner.interruptions.pop_front();
            (replay, receiver, start_index, interruption)
        };

        let live_prefix = prefix.clone();
        let live = BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let prefix = live_prefix.clone();
                async move {
                    match item {
                        Ok(event)
                            if event.index > start_index
                                && key_under(&event.key, &prefix) =>
                        {
                            Some(Ok(event))
                        }
                        Ok(_) => None,
                        Err(BroadcastStreamRecvError::Lagged(_)) => Some(
                            Err(Error::IndexCleared { index: start_index }),
                        ),
                    }
                }
            })
            // A lagged receiver has lost events; the stream ends after
            // reporting that so the caller re-establishes the watch.
            .scan(false, |failed, item| {
                let out = if *failed {
                    None
                } else {
                    *failed = item.is_err();
                    Some(item)
                };
                futures::future::ready(out)
            });

        let stream =
            futures::stream::iter(replay.into_iter().map(Ok)).chain(live);
        Ok(match interruption {
            Some((events, end)) => stream
                .take(events)
                .chain(futures::stream::iter(end.map(Err)))
                .boxed(),
            None => stream.boxed(),
        })
    }
}
