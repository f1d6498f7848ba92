// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-process broker with beanstalkd semantics, for tests
//!
//! All timing uses `tokio::time`, so tests can pause the clock and step
//! through delays and time-to-run expiry.

use crate::broker::Broker;
use crate::broker::BrokerError;
use crate::broker::Message;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A reserved message whose deadline is this close makes `reserve` report
/// [`BrokerError::DeadlineSoon`].
const SAFETY_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum State {
    /// eligible for delivery from the given time on
    Ready { at: Instant },
    Reserved { deadline: Instant },
}

#[derive(Debug)]
struct SimMessage {
    tube: String,
    body: String,
    priority: u32,
    ttr: Duration,
    state: State,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    messages: BTreeMap<u64, SimMessage>,
}

impl Inner {
    /// Puts reservations that outlived their time-to-run back in the queue.
    fn expire(&mut self, now: Instant) {
        for message in self.messages.values_mut() {
            if let State::Reserved { deadline } = message.state {
                if deadline <= now {
                    message.state = State::Ready { at: deadline };
                }
            }
        }
    }
}

pub struct SimBroker {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl Default for SimBroker {
    fn default() -> Self {
        SimBroker::new()
    }
}

impl SimBroker {
    pub fn new() -> SimBroker {
        SimBroker {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
        }
    }

    /// Returns the messages in `tube` that are not reserved, including
    /// delayed ones, in id order.
    pub fn pending(&self, tube: &str) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire(Instant::now());
        inner
            .messages
            .iter()
            .filter(|(_, m)| {
                m.tube == tube && matches!(m.state, State::Ready { .. })
            })
            .map(|(id, m)| Message { id: *id, body: m.body.clone() })
            .collect()
    }

    /// Returns the number of messages currently reserved.
    pub fn reserved(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.expire(Instant::now());
        inner
            .messages
            .values()
            .filter(|m| matches!(m.state, State::Reserved { .. }))
            .count()
    }

    /// Tries to reserve a message from `tube`.  On `Ok(None)`, returns the
    /// time at which something may change.
    fn try_reserve(
        &self,
        tube: &str,
        now: Instant,
    ) -> Result<Result<Message, Option<Instant>>, BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire(now);

        let mut wake: Option<Instant> = None;
        let mut best: Option<(u32, u64)> = None;
        for (id, message) in &inner.messages {
            match message.state {
                State::Reserved { deadline } => {
                    if deadline <= now + SAFETY_MARGIN {
                        return Err(BrokerError::DeadlineSoon);
                    }
                    let soon = deadline - SAFETY_MARGIN;
                    wake = Some(wake.map_or(soon, |w| w.min(soon)));
                }
                State::Ready { at } if message.tube == tube => {
                    if at <= now {
                        let key = (message.priority, *id);
                        if best.map_or(true, |b| key < b) {
                            best = Some(key);
                        }
                    } else {
                        wake = Some(wake.map_or(at, |w| w.min(at)));
                    }
                }
                State::Ready { .. } => (),
            }
        }

        let Some((_, id)) = best else {
            return Ok(Err(wake));
        };
        let Some(message) = inner.messages.get_mut(&id) else {
            return Ok(Err(wake));
        };
        message.state = State::Reserved { deadline: now + message.ttr };
        Ok(Ok(Message { id, body: message.body.clone() }))
    }
}

#[async_trait]
impl Broker for SimBroker {
    async fn put(
        &self,
        tube: &str,
        body: &str,
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<u64, BrokerError> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.messages.insert(
                id,
                SimMessage {
                    tube: tube.to_string(),
                    body: body.to_string(),
                    priority,
                    ttr: ttr.max(Duration::from_secs(1)),
                    state: State::Ready { at: Instant::now() + delay },
                },
            );
            id
        };
        self.changed.notify_waiters();
        Ok(id)
    }

    async fn reserve(
        &self,
        tube: &str,
        timeout: Duration,
    ) -> Result<Message, BrokerError> {
        let end = Instant::now() + timeout;
        loop {
            // Register interest before looking so that a concurrent put
            // cannot slip in unnoticed.
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let wake = match self.try_reserve(tube, now)? {
                Ok(message) => return Ok(message),
                Err(wake) => wake,
            };
            if now >= end {
                return Err(BrokerError::TimedOut);
            }
            let until = wake.map_or(end, |w| w.min(end));
            tokio::select! {
                _ = changed => (),
                _ = tokio::time::sleep_until(until) => (),
            }
        }
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.expire(Instant::now());
        match inner.messages.get(&id) {
            // beanstalkd only lets the reserving client delete a reserved
            // message, but anyone may delete a ready one.
            Some(_) => {
                inner.messages.remove(&id);
                Ok(())
            }
            None => Err(BrokerError::NotFound { id }),
        }
    }

    async fn release(
        &self,
        id: u64,
        priority: u32,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        {
            let mut inner = self.inner.lock().unwrap();
            let now = Instant::now();
            inner.expire(now);
            match inner.messages.get_mut(&id) {
                Some(message)
                    if matches!(message.state, State::Reserved { .. }) =>
                {
                    message.priority = priority;
                    message.state = State::Ready { at: now + delay };
                }
                _ => return Err(BrokerError::NotFound { id }),
            }
        }
        self.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    const TTR: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_priority_and_delay() {
        let broker = SimBroker::new();
        let zero = Duration::ZERO;
        let a = broker.put("work", "a", 100, zero, TTR).await.unwrap();
        let b = broker.put("work", "b", 10, zero, TTR).await.unwrap();
        let c = broker
            .put("work", "c", 0, Duration::from_secs(3), TTR)
            .await
            .unwrap();
        broker.put("create", "x", 0, zero, TTR).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(broker.reserve("work", timeout).await.unwrap().id, b);
        assert_eq!(broker.reserve("work", timeout).await.unwrap().id, a);
        // c only becomes ready after its delay
        let start = Instant::now();
        let message =
            broker.reserve("work", Duration::from_secs(5)).await.unwrap();
        assert_eq!(message.id, c);
        assert_eq!(Instant::now() - start, Duration::from_secs(3));
        assert_eq!(broker.pending("create").len(), 1);
        assert_eq!(broker.reserved(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttr_expiry() {
        let broker = SimBroker::new();
        let id = broker.put("work", "a", 0, Duration::ZERO, TTR).await.unwrap();
        let first = broker.reserve("work", Duration::ZERO).await.unwrap();
        assert_eq!(first.id, id);

        // While we hold it nothing else is ready.
        assert_matches!(
            broker.reserve("work", Duration::from_secs(2)).await,
            Err(BrokerError::TimedOut)
        );
        // Close to the deadline the broker warns us.
        tokio::time::advance(Duration::from_secs(7)).await;
        assert_matches!(
            broker.reserve("work", Duration::from_secs(5)).await,
            Err(BrokerError::DeadlineSoon)
        );
        // Past it, the message is handed out again.
        tokio::time::advance(Duration::from_secs(2)).await;
        let again = broker.reserve("work", Duration::ZERO).await.unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_and_delete() {
        let broker = SimBroker::new();
        let id = broker.put("work", "a", 0, Duration::ZERO, TTR).await.unwrap();
        assert_matches!(
            broker.release(id, 0, Duration::ZERO).await,
            Err(BrokerError::NotFound { .. })
        );
        broker.reserve("work", Duration::ZERO).await.unwrap();
        broker.release(id, 0, Duration::from_secs(5)).await.unwrap();
        assert_eq!(broker.pending("work").len(), 1);
        assert_matches!(
            broker.reserve("work", Duration::from_secs(1)).await,
            Err(BrokerError::TimedOut)
        );
        let message =
            broker.reserve("work", Duration::from_secs(10)).await.unwrap();
        assert_eq!(message.id, id);
        broker.delete(id).await.unwrap();
        assert_matches!(
            broker.delete(id).await,
            Err(BrokerError::NotFound { .. })
        );
        assert!(broker.pending("work").is_empty());
    }

    #[tokio::test]
    async fn test_put_wakes_reserve() {
        let broker = std::sync::Arc::new(SimBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker.reserve("create", Duration::from_secs(30)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.put("create", "j", 0, Duration::ZERO, TTR).await.unwrap();
        let message = waiter.await.unwrap().unwrap();
        assert_eq!(message.body, "j");
    }
}
