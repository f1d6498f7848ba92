// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Job queue: hand off jobs between daemons
//!
//! A queue message carries nothing but a job ID.  Everything about the job
//! lives in the [`Job`] record in the store, so messages can be redelivered,
//! released or dropped without losing state.  Placement requests go to the
//! "create" tube; everything else goes to the "work" tube.
//!
//! A consumer reserves a message with [`JobQueue::next_create_task()`] or
//! [`JobQueue::next_work_task()`], which also load the job and its guest into
//! a [`Task`].  The consumer must then either delete the task (it's done with
//! it, one way or another) or release it (try again later).  A consumer that
//! crashes simply loses its reservation; the broker hands the message out
//! again once its time-to-run has passed.

pub mod beanstalk;
pub mod broker;
pub mod sim;

pub use broker::Broker;
pub use broker::BrokerError;
pub use broker::Message;

use corral_store::actions;
use corral_store::Guest;
use corral_store::Job;
use corral_store::Store;
use serde::Deserialize;
use slog::{debug, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub const CREATE_TUBE: &str = "create";
pub const WORK_TUBE: &str = "work";

/// Queue tuning
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// how long a consumer may hold a message before it is redelivered
    pub ttr_secs: u64,
    /// how long one reserve waits for a message
    pub reserve_timeout_secs: u64,
    /// delay applied by [`Task::release()`]
    pub release_delay_secs: u64,
    pub priority: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            ttr_secs: 60,
            reserve_timeout_secs: 5,
            release_delay_secs: 0,
            priority: 1024,
        }
    }
}

impl QueueConfig {
    pub fn ttr(&self) -> Duration {
        Duration::from_secs(self.ttr_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }

    pub fn release_delay(&self) -> Duration {
        Duration::from_secs(self.release_delay_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No message arrived in time.  Callers just try again.
    #[error("no task available")]
    Timeout,

    /// A reservation this consumer holds is about to expire.  Callers should
    /// back off before reserving again.
    #[error("a reserved task is close to its deadline")]
    DeadlineSoon,

    /// The message refers to a job or guest that does not exist (or cannot
    /// be decoded).  It should be deleted.
    #[error("message {message_id} is unusable: {reason}")]
    Poisoned { message_id: u64, reason: String },

    /// Loading the job or guest failed for some other reason.  The message
    /// is still reserved and should be released.
    #[error("failed to load task for message {message_id}")]
    Load {
        message_id: u64,
        #[source]
        source: corral_store::Error,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl Error {
    /// Returns the broker message this error is about, if it is still
    /// reserved by the caller.
    pub fn message_id(&self) -> Option<u64> {
        match self {
            Error::Poisoned { message_id, .. }
            | Error::Load { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// What a consumer should do after [`JobQueue::recover()`]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recovery {
    /// reserve again right away
    Retry,
    /// wait before reserving again
    BackOff,
}

/// Producer and consumer side of the job queue
#[derive(Clone)]
pub struct JobQueue {
    log: Logger,
    broker: Arc<dyn Broker>,
    store: Store,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(
        log: &Logger,
        broker: Arc<dyn Broker>,
        store: Store,
        config: QueueConfig,
    ) -> JobQueue {
        JobQueue {
            log: log.new(o!("component" => "JobQueue")),
            broker,
            store,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Returns the tube that jobs with `action` are queued on.
    pub fn tube_for(action: &str) -> &'static str {
        if action == actions::SELECT_HYPERVISOR {
            CREATE_TUBE
        } else {
            WORK_TUBE
        }
    }

    /// Queue `job` for whichever daemon handles its action.  Returns the
    /// broker's message ID.
    pub async fn add_task(&self, job: &Job) -> Result<u64, Error> {
        let tube = Self::tube_for(&job.action);
        let id = self
            .broker
            .put(
                tube,
                &job.id.to_string(),
                self.config.priority,
                Duration::ZERO,
                self.config.ttr(),
            )
            .await?;
        debug!(self.log, "queued job";
            "job_id" => %job.id,
            "action" => &job.action,
            "tube" => tube,
            "task_id" => id,
        );
        Ok(id)
    }

    /// Reserve the next placement request.
    pub async fn next_create_task(&self) -> Result<Task, Error> {
        self.next_task(CREATE_TUBE).await
    }

    /// Reserve the next job for the worker.
    pub async fn next_work_task(&self) -> Result<Task, Error> {
        self.next_task(WORK_TUBE).await
    }

    async fn next_task(&self, tube: &'static str) -> Result<Task, Error> {
        let message = self
            .broker
            .reserve(tube, self.config.reserve_timeout())
            .await
            .map_err(|error| match error {
                BrokerError::TimedOut => Error::Timeout,
                BrokerError::DeadlineSoon => Error::DeadlineSoon,
                error => Error::Broker(error),
            })?;
        let message_id = message.id;

        let job_id: Uuid = message.body.trim().parse().map_err(|_| {
            Error::Poisoned {
                message_id,
                reason: format!("bad job ID {:?}", message.body),
            }
        })?;
        let load_error = |source: corral_store::Error| {
            if source.is_not_found()
                || matches!(source, corral_store::Error::Decode { .. })
            {
                Error::Poisoned { message_id, reason: source.to_string() }
            } else {
                Error::Load { message_id, source }
            }
        };
        let job: Job = self.store.fetch(&job_id).await.map_err(load_error)?;
        let guest: Guest =
            self.store.fetch(&job.guest).await.map_err(load_error)?;

        debug!(self.log, "reserved task";
            "task_id" => message_id,
            "job_id" => %job.id,
            "action" => &job.action,
            "status" => %job.status,
            "guest_id" => %guest.id,
        );
        Ok(Task { id: message_id, job, guest, tube, queue: self.clone() })
    }

    /// Dispose of a failed reserve.  Poisoned messages are deleted and
    /// messages that could not be loaded are released.  Broker failures are
    /// returned to the caller.
    pub async fn recover(&self, error: Error) -> Result<Recovery, Error> {
        match error {
            Error::Timeout => Ok(Recovery::Retry),
            Error::DeadlineSoon => {
                debug!(self.log, "reservation deadline approaching");
                Ok(Recovery::BackOff)
            }
            Error::Poisoned { message_id, reason } => {
                warn!(self.log, "deleting unusable task";
                    "task_id" => message_id,
                    "reason" => reason,
                );
                self.delete_message(message_id).await?;
                Ok(Recovery::Retry)
            }
            Error::Load { message_id, source } => {
                warn!(self.log, "failed to load task; releasing it";
                    "task_id" => message_id,
                    "error" => %source,
                );
                self.release_message(message_id).await?;
                Ok(Recovery::BackOff)
            }
            error @ Error::Broker(_) => Err(error),
        }
    }

    /// Delete a message that did not turn into a task.
    pub async fn delete_message(&self, id: u64) -> Result<(), Error> {
        self.broker.delete(id).await?;
        Ok(())
    }

    /// Release a message that did not turn into a task.
    pub async fn release_message(&self, id: u64) -> Result<(), Error> {
        self.broker
            .release(id, self.config.priority, self.config.release_delay())
            .await?;
        Ok(())
    }
}

/// A reserved queue message together with the job and guest it refers to
pub struct Task {
    id: u64,
    pub job: Job,
    pub guest: Guest,
    tube: &'static str,
    queue: JobQueue,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("job", &self.job)
            .field("guest", &self.guest)
            .field("tube", &self.tube)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Broker message ID
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tube(&self) -> &'static str {
        self.tube
    }

    /// Return the message to the queue after the configured release delay.
    pub async fn release(&self) -> Result<(), Error> {
        self.release_with_delay(self.queue.config.release_delay()).await
    }

    pub async fn release_with_delay(
        &self,
        delay: Duration,
    ) -> Result<(), Error> {
        self.queue
            .broker
            .release(self.id, self.queue.config.priority, delay)
            .await?;
        debug!(self.queue.log, "released task";
            "task_id" => self.id,
            "job_id" => %self.job.id,
            "delay_secs" => delay.as_secs(),
        );
        Ok(())
    }

    /// Remove the message for good.
    pub async fn delete(&self) -> Result<(), Error> {
        self.queue.broker.delete(self.id).await?;
        debug!(self.queue.log, "deleted task";
            "task_id" => self.id,
            "job_id" => %self.job.id,
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimBroker;
    use assert_matches::assert_matches;
    use corral_kv::sim::SimKv;
    use corral_store::JobStatus;
    use corral_test_utils::dev::test_setup_log;

    struct Harness {
        store: Store,
        broker: Arc<SimBroker>,
        queue: JobQueue,
    }

    fn harness(log: &Logger) -> Harness {
        let store = Store::new(
            log,
            Arc::new(SimKv::new()),
            "/corral",
            corral_store::DEFAULT_JOB_TTL,
        );
        let broker = Arc::new(SimBroker::new());
        let config = QueueConfig { ttr_secs: 10, ..Default::default() };
        let queue = JobQueue::new(log, broker.clone(), store.clone(), config);
        Harness { store, broker, queue }
    }

    async fn guest(store: &Store) -> Guest {
        let mut guest = Guest::new(Uuid::new_v4());
        store.save(&mut guest).await.unwrap();
        guest
    }

    #[tokio::test(start_paused = true)]
    async fn test_routing() {
        let logctx = test_setup_log("test_routing");
        let h = harness(&logctx.log);
        let guest = guest(&h.store).await;

        let place = h
            .store
            .job_create(actions::SELECT_HYPERVISOR, guest.id)
            .await
            .unwrap();
        let reboot = h.store.job_create("reboot", guest.id).await.unwrap();
        h.queue.add_task(&place).await.unwrap();
        h.queue.add_task(&reboot).await.unwrap();

        let create = h.broker.pending(CREATE_TUBE);
        let work = h.broker.pending(WORK_TUBE);
        assert_eq!(create.len(), 1);
        assert_eq!(create[0].body, place.id.to_string());
        assert_eq!(work.len(), 1);
        assert_eq!(work[0].body, reboot.id.to_string());

        let task = h.queue.next_create_task().await.unwrap();
        assert_eq!(task.job, place);
        assert_eq!(task.guest, guest);
        assert_eq!(task.tube(), CREATE_TUBE);
        task.delete().await.unwrap();

        let task = h.queue.next_work_task().await.unwrap();
        assert_eq!(task.job.action, "reboot");
        task.release().await.unwrap();
        let task = h.queue.next_work_task().await.unwrap();
        assert_eq!(task.job.id, reboot.id);
        task.delete().await.unwrap();

        assert_matches!(
            h.queue.next_work_task().await.map(|_| ()),
            Err(Error::Timeout)
        );
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_poisoned_tasks() {
        let logctx = test_setup_log("test_poisoned_tasks");
        let h = harness(&logctx.log);

        // a job whose record never made it to the store
        let ghost = Job::new("reboot", Uuid::new_v4());
        h.queue.add_task(&ghost).await.unwrap();
        let error = h.queue.next_work_task().await.err().unwrap();
        assert_matches!(error, Error::Poisoned { .. });
        h.queue.delete_message(error.message_id().unwrap()).await.unwrap();

        // a job whose guest is gone
        let job = h.store.job_create("reboot", Uuid::new_v4()).await.unwrap();
        h.queue.add_task(&job).await.unwrap();
        let error = h.queue.next_work_task().await.err().unwrap();
        assert_matches!(error, Error::Poisoned { .. });
        h.queue.delete_message(error.message_id().unwrap()).await.unwrap();

        // garbage, disposed of the way the daemons do it
        let ttr = h.queue.config().ttr();
        h.broker
            .put(WORK_TUBE, "not-a-uuid", 0, Duration::ZERO, ttr)
            .await
            .unwrap();
        let error = h.queue.next_work_task().await.err().unwrap();
        assert_matches!(error, Error::Poisoned { .. });
        assert_eq!(h.queue.recover(error).await.unwrap(), Recovery::Retry);
        assert_matches!(
            h.queue.recover(Error::Timeout).await,
            Ok(Recovery::Retry)
        );
        assert_matches!(
            h.queue.recover(Error::DeadlineSoon).await,
            Ok(Recovery::BackOff)
        );

        assert!(h.broker.pending(WORK_TUBE).is_empty());
        assert_eq!(h.broker.reserved(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_after_crash() {
        let logctx = test_setup_log("test_redelivery_after_crash");
        let h = harness(&logctx.log);
        let guest = guest(&h.store).await;
        let job = h.store.job_create("reboot", guest.id).await.unwrap();
        h.queue.add_task(&job).await.unwrap();

        // The consumer reserves the task and then goes away without
        // releasing or deleting it.
        let task = h.queue.next_work_task().await.unwrap();
        let first_id = task.id();
        drop(task);

        // Until the time-to-run passes, nothing is delivered.
        let mut redelivered = None;
        for _ in 0..10 {
            match h.queue.next_work_task().await {
                Ok(task) => {
                    redelivered = Some(task);
                    break;
                }
                Err(Error::Timeout) => continue,
                Err(Error::DeadlineSoon) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(error) => panic!("unexpected error: {:#}", error),
            }
        }
        let task = redelivered.expect("task was not redelivered");
        assert_eq!(task.id(), first_id);
        assert_eq!(task.job.id, job.id);
        assert_eq!(task.job.status, JobStatus::New);
        logctx.cleanup_successful();
    }
}
