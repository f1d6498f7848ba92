// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TTL-based distributed mutex
//!
//! A lock is a single key whose value names the holder.  It is created with a
//! TTL so that a crashed holder's lock eventually expires, and the holder
//! keeps it alive by rewriting it (compare-and-swap on its own index) well
//! before the TTL runs out.  A holder that cannot refresh must assume the
//! lock is gone.

use crate::Error;
use crate::KvStore;
use corral_common::backoff::retry_notify;
use corral_common::backoff::BackoffError;
use corral_common::backoff::ExponentialBackoff;
use slog::{debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A held lock
pub struct Lock {
    log: Logger,
    kv: Arc<dyn KvStore>,
    key: String,
    holder: String,
    ttl: Duration,
    /// modification index of our last write to `key`
    index: u64,
}

impl Lock {
    /// Try once to take the lock at `key` on behalf of `holder`.  Returns
    /// [`Error::LockHeld`] if somebody else has it.
    pub async fn acquire(
        log: &Logger,
        kv: Arc<dyn KvStore>,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Lock, Error> {
        let log = log.new(o!(
            "component" => "Lock",
            "key" => key.to_string(),
            "holder" => holder.to_string(),
        ));
        let index = match kv.create(key, holder, Some(ttl)).await {
            Ok(index) => index,
            Err(error) if error.is_conflict() => {
                let current = match kv.get(key).await {
                    Ok(value) => value.value,
                    // it expired in the meantime; the caller can try again
                    Err(error) if error.is_not_found() => String::new(),
                    Err(error) => return Err(error),
                };
                return Err(Error::LockHeld {
                    key: key.to_string(),
                    holder: current,
                });
            }
            Err(error) => return Err(error),
        };
        info!(log, "acquired lock"; "index" => index);
        Ok(Lock {
            log,
            kv,
            key: key.to_string(),
            holder: holder.to_string(),
            ttl,
            index,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Extend the lock's TTL.  Fails with [`Error::LockLost`] if the key has
    /// expired or been overwritten since our last write.
    pub async fn refresh(&mut self) -> Result<(), Error> {
        let result = self
            .kv
            .compare_and_swap(
                &self.key,
                &self.holder,
                Some(self.ttl),
                self.index,
            )
            .await;
        match result {
            Ok(index) => {
                debug!(self.log, "refreshed lock"; "index" => index);
                self.index = index;
                Ok(())
            }
            Err(error) if error.is_not_found() || error.is_conflict() => {
                Err(Error::LockLost { key: self.key.clone() })
            }
            Err(error) => Err(error),
        }
    }

    /// Give up the lock.  Fails with [`Error::LockLost`] if it was no longer
    /// ours.
    pub async fn release(self) -> Result<(), Error> {
        match self.kv.compare_and_delete(&self.key, self.index).await {
            Ok(()) => {
                info!(self.log, "released lock");
                Ok(())
            }
            Err(error) if error.is_not_found() || error.is_conflict() => {
                Err(Error::LockLost { key: self.key })
            }
            Err(error) => Err(error),
        }
    }
}

/// Wait for the lock at `key`, retrying according to `policy` while somebody
/// else holds it or the store cannot be reached.
pub async fn acquire_with_retry(
    log: &Logger,
    kv: Arc<dyn KvStore>,
    key: &str,
    holder: &str,
    ttl: Duration,
    policy: ExponentialBackoff,
) -> Result<Lock, Error> {
    let attempt = || async {
        Lock::acquire(log, kv.clone(), key, holder, ttl).await.map_err(
            |error| match error {
                Error::LockHeld { .. } | Error::Request { .. } => {
                    BackoffError::transient(error)
                }
                error => BackoffError::permanent(error),
            },
        )
    };
    let notify = |error: Error, delay: Duration| {
        info!(log, "waiting for lock";
            "key" => key,
            "error" => %error,
            "retry_in" => ?delay,
        );
    };
    retry_notify(policy, attempt, notify).await
}

/// Handle on a background task that keeps a [`Lock`] refreshed
pub struct LockKeeper {
    key: String,
    lost_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<Option<Lock>>,
}

/// Refresh `lock` every third of its TTL until [`LockKeeper::release()`] is
/// called.  Any refresh failure is treated as losing the lock and reported
/// through [`LockKeeper::lost()`].
pub fn spawn_refresher(lock: Lock) -> LockKeeper {
    let (lost_tx, lost_rx) = watch::channel(false);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let key = lock.key.clone();
    let interval = lock.ttl / 3;

    let task = tokio::spawn(async move {
        let mut lock = lock;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return Some(lock),
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(error) = lock.refresh().await {
                warn!(lock.log, "failed to refresh lock"; "error" => %error);
                lost_tx.send_replace(true);
                return None;
            }
        }
    });

    LockKeeper { key, lost_rx, stop_tx, task }
}

impl LockKeeper {
    /// Returns a receiver whose value becomes true when the lock is lost.
    pub fn lost(&self) -> watch::Receiver<bool> {
        self.lost_rx.clone()
    }

    pub fn is_lost(&self) -> bool {
        *self.lost_rx.borrow()
    }

    /// Stop refreshing and release the lock.
    pub async fn release(self) -> Result<(), Error> {
        self.stop_tx.send_replace(true);
        match self.task.await {
            Ok(Some(lock)) => lock.release().await,
            _ => Err(Error::LockLost { key: self.key }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimKv;
    use assert_matches::assert_matches;
    use corral_common::backoff::BackoffConfig;
    use corral_test_utils::dev::test_setup_log;

    const KEY: &str = "/corral/placerd/lock";

    #[tokio::test]
    async fn test_acquire_release() {
        let logctx = test_setup_log("test_acquire_release");
        let log = &logctx.log;
        let kv: Arc<dyn KvStore> = Arc::new(SimKv::new());
        let ttl = Duration::from_secs(30);

        let mut lock = Lock::acquire(log, kv.clone(), KEY, "a", ttl)
            .await
            .unwrap();
        assert_matches!(
            Lock::acquire(log, kv.clone(), KEY, "b", ttl).await.map(|_| ()),
            Err(Error::LockHeld { holder, .. }) if holder == "a"
        );
        lock.refresh().await.unwrap();
        lock.release().await.unwrap();

        let lock =
            Lock::acquire(log, kv.clone(), KEY, "b", ttl).await.unwrap();
        assert_eq!(lock.holder(), "b");

        // Somebody else overwrote the key: refresh and release both notice.
        let mut lock = lock;
        kv.set(KEY, "c", None).await.unwrap();
        assert_matches!(lock.refresh().await, Err(Error::LockLost { .. }));
        assert_matches!(lock.release().await, Err(Error::LockLost { .. }));
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresher() {
        let logctx = test_setup_log("test_refresher");
        let log = &logctx.log;
        let sim = Arc::new(SimKv::new());
        let kv: Arc<dyn KvStore> = sim.clone();
        let ttl = Duration::from_secs(3);

        let lock = Lock::acquire(log, kv.clone(), KEY, "a", ttl).await.unwrap();
        let keeper = spawn_refresher(lock);

        // Without the refresher the key would have expired long ago.
        tokio::time::sleep(Duration::from_secs(20)).await;
        sim.expire_now();
        assert!(!keeper.is_lost());
        assert_matches!(
            Lock::acquire(log, kv.clone(), KEY, "b", ttl).await.map(|_| ()),
            Err(Error::LockHeld { .. })
        );
        keeper.release().await.unwrap();
        assert_matches!(kv.get(KEY).await, Err(Error::NotFound { .. }));

        // A waiter gets the lock once the holder's key expires.
        let lock = Lock::acquire(log, kv.clone(), KEY, "a", ttl).await.unwrap();
        let policy = BackoffConfig { initial_ms: 500, max_ms: 1000 }.policy();
        let waiter = {
            let log = log.clone();
            let kv = kv.clone();
            tokio::spawn(async move {
                acquire_with_retry(&log, kv, KEY, "b", ttl, policy).await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        drop(lock);
        tokio::time::sleep(Duration::from_secs(5)).await;
        sim.expire_now();
        let lock = waiter.await.unwrap().unwrap();
        assert_eq!(lock.holder(), "b");
        lock.release().await.unwrap();

        // Now lose the lock out from under the refresher.
        let lock = Lock::acquire(log, kv.clone(), KEY, "a", ttl).await.unwrap();
        let keeper = spawn_refresher(lock);
        let mut lost = keeper.lost();
        kv.delete(KEY, false).await.unwrap();
        lost.changed().await.unwrap();
        assert!(*lost.borrow());
        assert!(keeper.is_lost());
        assert_matches!(keeper.release().await, Err(Error::LockLost { .. }));
        logctx.cleanup_successful();
    }
}
