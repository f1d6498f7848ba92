// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Merge watches on several key prefixes into one stream of events
//!
//! Each watched prefix gets its own tokio task that follows the store's watch
//! stream and forwards events into a shared channel.  Consumers call
//! [`Watcher::next()`] and then [`Watcher::event()`]:
//!
//! ```ignore
//! let watcher = Watcher::new(&log, kv);
//! watcher.add("/corral/guests").await?;
//! while watcher.next().await {
//!     let event = watcher.event().unwrap();
//!     ...
//! }
//! if let Some(error) = watcher.err() { ... }
//! ```
//!
//! Events for one prefix arrive in the order the store applied them.  There
//! is no ordering guarantee between different prefixes.

use crate::normalize_prefix;
use crate::Error;
use crate::KvStore;
use crate::WatchEvent;
use crate::WatchStream;
use corral_common::backoff::Backoff;
use corral_common::backoff::BackoffConfig;
use futures::StreamExt;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 256;

/// Delay between attempts to reach the store after a watch broke
const RESTART_BACKOFF: BackoffConfig =
    BackoffConfig { initial_ms: 250, max_ms: 10_000 };

type Item = Result<WatchEvent, Arc<Error>>;

struct State {
    closed: bool,
    prefixes: BTreeMap<String, JoinHandle<()>>,
    /// event returned by the last successful `next()`
    event: Option<WatchEvent>,
    /// error that ended the stream, if any
    err: Option<Arc<Error>>,
}

pub struct Watcher {
    log: Logger,
    kv: Arc<dyn KvStore>,
    state: Mutex<State>,
    tx: mpsc::Sender<Item>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Item>>,
    closed_tx: watch::Sender<bool>,
    /// set when some prefix lost events because the store's history was
    /// cleared
    resync: Arc<AtomicBool>,
}

impl Watcher {
    pub fn new(log: &Logger, kv: Arc<dyn KvStore>) -> Watcher {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (closed_tx, _) = watch::channel(false);
        Watcher {
            log: log.new(o!("component" => "Watcher")),
            kv,
            state: Mutex::new(State {
                closed: false,
                prefixes: BTreeMap::new(),
                event: None,
                err: None,
            }),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            closed_tx,
            resync: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Begin watching `prefix`.  Changes applied after this returns are
    /// delivered.  Adding a prefix that is already watched does nothing.
    pub async fn add(&self, prefix: &str) -> Result<(), Error> {
        let prefix = normalize_prefix(prefix).to_string();
        {
            let state = self.state.lock().unwrap();
            if state.closed {
                return Err(Error::WatcherClosed);
            }
            if state.prefixes.contains_key(&prefix) {
                return Ok(());
            }
        }

        // Establish the store-side watch before returning so that callers can
        // rely on seeing every change they make afterwards.
        let (stream, index) = open(&*self.kv, &prefix, 0).await?;

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::WatcherClosed);
        }
        if state.prefixes.contains_key(&prefix) {
            return Ok(());
        }
        info!(self.log, "watching prefix"; "prefix" => &prefix);
        let task = tokio::spawn(follow_prefix(
            self.log.new(o!("prefix" => prefix.clone())),
            Arc::clone(&self.kv),
            prefix.clone(),
            stream,
            index,
            self.tx.clone(),
            Arc::clone(&self.resync),
        ));
        state.prefixes.insert(prefix, task);
        Ok(())
    }

    /// Stop watching `prefix`.  Events for it that were already queued may
    /// still be returned by `next()`.
    pub fn remove(&self, prefix: &str) -> Result<(), Error> {
        let prefix = normalize_prefix(prefix);
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(Error::WatcherClosed);
        }
        let task = state
            .prefixes
            .remove(prefix)
            .ok_or_else(|| Error::NotWatched { prefix: prefix.to_string() })?;
        task.abort();
        info!(self.log, "stopped watching prefix"; "prefix" => prefix);
        Ok(())
    }

    /// Wait for the next event.  Returns false once the watcher is closed or
    /// has failed; in the latter case [`Watcher::err()`] describes why.  A
    /// watcher that failed keeps returning false.
    pub async fn next(&self) -> bool {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow_and_update() {
            return false;
        }
        if self.state.lock().unwrap().err.is_some() {
            return false;
        }

        let item = {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                item = rx.recv() => item,
                _ = closed_rx.changed() => None,
            }
        };

        let mut state = self.state.lock().unwrap();
        match item {
            Some(Ok(event)) if !state.closed && state.err.is_none() => {
                state.event = Some(event);
                true
            }
            Some(Err(error)) => {
                state.event = None;
                state.err.get_or_insert(error);
                false
            }
            _ => {
                state.event = None;
                false
            }
        }
    }

    /// Returns the event produced by the last call to `next()` that returned
    /// true.
    pub fn event(&self) -> Option<WatchEvent> {
        self.state.lock().unwrap().event.clone()
    }

    /// Returns the error that made `next()` return false, if any.
    pub fn err(&self) -> Option<Arc<Error>> {
        self.state.lock().unwrap().err.clone()
    }

    /// Returns true, once, after some events were lost because the store no
    /// longer had them.  Consumers that mirror the watched state should
    /// reload it.
    pub fn take_resync(&self) -> bool {
        self.resync.swap(false, Ordering::SeqCst)
    }

    /// Returns the prefixes currently being watched.
    pub fn prefixes(&self) -> Vec<String> {
        self.state.lock().unwrap().prefixes.keys().cloned().collect()
    }

    /// Stop all watches and wake up any pending `next()`.  Closing twice is
    /// harmless.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return;
        }
        state.closed = true;
        for (_, task) in std::mem::take(&mut state.prefixes) {
            task.abort();
        }
        self.closed_tx.send_replace(true);
        info!(self.log, "watcher closed");
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let state =
            self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in state.prefixes.values() {
            task.abort();
        }
    }
}

/// Opens a watch on `prefix` for changes after `after_index`, or after the
/// store's current index if that is 0.  Returns the stream and the index it
/// starts after.
async fn open(
    kv: &dyn KvStore,
    prefix: &str,
    after_index: u64,
) -> Result<(WatchStream, u64), Error> {
    let index = match after_index {
        0 => kv.head_index().await?,
        index => index,
    };
    Ok((kv.watch(prefix, index).await?, index))
}

/// Forwards events from the watch on `prefix` until the channel is closed or
/// the store reports an error that a new watch would not fix.
///
/// A watch that ends or loses its connection is opened again after the last
/// forwarded event.  One whose history is gone is opened again from the
/// store's current index and the resync flag is raised.
async fn follow_prefix(
    log: Logger,
    kv: Arc<dyn KvStore>,
    prefix: String,
    mut stream: WatchStream,
    mut last_index: u64,
    tx: mpsc::Sender<Item>,
    resync: Arc<AtomicBool>,
) {
    let mut policy = RESTART_BACKOFF.policy();
    loop {
        let mut failure = loop {
            match stream.next().await {
                Some(Ok(event)) => {
                    last_index = event.index;
                    policy.reset();
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Some(Err(error)) => break Some(error),
                None => break None,
            }
        };

        stream = loop {
            match failure.take() {
                None => (),
                Some(error) if error.is_watch_restart() => {
                    warn!(log, "watch history lost, resuming from now";
                        "last_index" => last_index,
                        "error" => %error,
                    );
                    resync.store(true, Ordering::SeqCst);
                    last_index = 0;
                }
                Some(error) if error.is_transient() => {
                    let delay = policy
                        .next_backoff()
                        .unwrap_or_else(|| RESTART_BACKOFF.max());
                    warn!(log, "watch interrupted";
                        "last_index" => last_index,
                        "error" => %error,
                        "retry_after" => ?delay,
                    );
                    tokio::time::sleep(delay).await;
                }
                Some(error) => {
                    warn!(log, "watch failed"; "error" => %error);
                    let _ = tx.send(Err(Arc::new(error))).await;
                    return;
                }
            }

            debug!(log, "re-establishing watch"; "last_index" => last_index);
            match open(&*kv, &prefix, last_index).await {
                Ok((stream, index)) => {
                    last_index = index;
                    break stream;
                }
                Err(error) => failure = Some(error),
            }
        };
    }
}
