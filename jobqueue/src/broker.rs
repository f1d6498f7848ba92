// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the work-queue broker

use async_trait::async_trait;
use std::time::Duration;

/// A reserved message
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Message {
    pub id: u64,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Nothing became ready within the reserve timeout.
    #[error("timed out waiting for a message")]
    TimedOut,

    /// A message reserved by this client is about to exceed its
    /// time-to-run.
    #[error("a reserved message is close to its deadline")]
    DeadlineSoon,

    #[error("message {id} not found")]
    NotFound { id: u64 },

    /// The broker refused the command (out of memory, draining, etc.).
    #[error("broker error: {0}")]
    Server(String),

    #[error("unexpected broker response: {0:?}")]
    Protocol(String),

    #[error("broker connection failed")]
    Io(#[from] std::io::Error),
}

/// Operations provided by the broker
///
/// Messages become ready after `delay`, are handed out in priority order
/// (lower first) by `reserve`, and go back to ready if not deleted or
/// released within their time-to-run.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn put(
        &self,
        tube: &str,
        body: &str,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64, BrokerError>;

    async fn reserve(
        &self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Message, BrokerError>;

    async fn delete(&self, id: u64) -> Result<(), BrokerError>;

    async fn release(
        &self,
        id: u64,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError>;
}
