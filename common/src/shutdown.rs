// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Graceful shutdown
//!
//! Each daemon runs one consume loop.  The loop never abandons a task or
//! event it has started: it checks [`Shutdown::is_requested()`] only between
//! units of work, and waits for work with [`Shutdown::requested()`] in a
//! `select!` only while nothing is in flight.  Once the loop returns, the
//! daemon releases its external resources (watcher, lock) and exits.

use futures::StreamExt;
use libc::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use slog::{info, warn, Logger};
use tokio::sync::watch;

/// Handle used to request shutdown
#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Requests shutdown as soon as `condition` becomes true.
    ///
    /// Used to stop a daemon's exclusive work once its lock is lost.
    pub fn trigger_when(
        &self,
        log: &Logger,
        reason: &'static str,
        mut condition: watch::Receiver<bool>,
    ) {
        let trigger = self.clone();
        let log = log.clone();
        tokio::spawn(async move {
            if condition.wait_for(|c| *c).await.is_ok() {
                warn!(log, "shutting down"; "reason" => reason);
                trigger.trigger();
            }
        });
    }
}

/// Handle used by a consume loop to learn that shutdown was requested
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Returns a linked trigger/receiver pair with shutdown not yet requested.
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes once shutdown has been requested.
    ///
    /// If every trigger has been dropped without requesting shutdown, this
    /// never completes.
    pub async fn requested(&mut self) {
        if self.rx.wait_for(|requested| *requested).await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

/// Starts a tokio task that requests shutdown on SIGINT or SIGTERM.
pub fn shutdown_on_signals(
    log: &Logger,
) -> Result<(ShutdownTrigger, Shutdown), anyhow::Error> {
    let (trigger, shutdown) = Shutdown::new();
    let signal_trigger = trigger.clone();
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let log = log.clone();
    tokio::spawn(async move {
        match signals.next().await {
            Some(signal) => {
                info!(log, "caught signal, shutting down"; "signal" => signal);
                signal_trigger.trigger();
            }
            None => {
                warn!(log, "signal stream ended unexpectedly");
            }
        }
    });
    Ok((trigger, shutdown))
}
