// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The placement pipeline
//!
//! Each task from the "create" tube runs through these stages in order:
//!
//! 1. check-job-status: the job must be a new "select-hypervisor" job
//! 2. check-guest-status: the guest must not be placed yet
//! 3. select-hypervisor: run the candidate functions and place the guest on
//!    the winner
//! 4. change-job-action: the job becomes a new "fetch" job
//! 5. add-job-to-worker: queue the job on the "work" tube
//! 6. delete-task: drop the "create" message
//!
//! A stage either rejects the request, in which case the error is recorded on
//! the job and the task deleted, or fails transiently, in which case the task
//! is released and tried again later.

use crate::candidates::CandidateFunction;
use crate::candidates::PlacementContext;
use crate::Config;
use anyhow::anyhow;
use anyhow::Context;
use corral_common::backoff::Backoff;
use corral_common::backoff::BackoffConfig;
use corral_common::shutdown::Shutdown;
use corral_common::stats::StatsRegistry;
use corral_jobqueue::JobQueue;
use corral_jobqueue::Recovery;
use corral_jobqueue::Task;
use corral_store::actions;
use corral_store::Flavor;
use corral_store::Hypervisor;
use corral_store::JobStatus;
use corral_store::Store;
use slog::{debug, error, info, o, warn, Logger};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Names under which stage execution is recorded
pub mod stages {
    pub const CHECK_JOB_STATUS: &str = "check-job-status";
    pub const CHECK_GUEST_STATUS: &str = "check-guest-status";
    pub const SELECT_HYPERVISOR: &str = "select-hypervisor";
    pub const CHANGE_JOB_ACTION: &str = "change-job-action";
    pub const ADD_JOB_TO_WORKER: &str = "add-job-to-worker";
    pub const DELETE_TASK: &str = "delete-task";
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The request cannot succeed.  The error is recorded on the job and the
    /// task is deleted.
    #[error("{0}")]
    Reject(String),

    /// The task refers to a job that has already finished.  The task is
    /// deleted and the job left alone.
    #[error("{0}")]
    Stale(String),

    /// Something went wrong that may not go wrong next time.  The task is
    /// released.
    #[error("{0:#}")]
    Retry(anyhow::Error),
}

fn retry<E>(context: &'static str) -> impl FnOnce(E) -> StageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |error| StageError::Retry(anyhow!(error).context(context))
}

struct StageFailure {
    stage: &'static str,
    error: StageError,
}

/// How far a task still has to go
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Progress {
    /// the guest has yet to be placed
    Place,
    /// the guest was placed by an earlier delivery of this task that did not
    /// get to forward the job
    Forward,
}

/// How a task left the pipeline
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Placed { hypervisor: Uuid },
    Forwarded,
    Rejected,
    Dropped,
    Released,
}

pub struct Placer {
    log: Logger,
    store: Store,
    queue: JobQueue,
    candidates: Vec<Box<dyn CandidateFunction>>,
    stats: StatsRegistry,
    retry_delay: Duration,
    deadline_backoff: BackoffConfig,
}

impl Placer {
    pub fn new(
        log: &Logger,
        store: Store,
        queue: JobQueue,
        candidates: Vec<Box<dyn CandidateFunction>>,
        stats: StatsRegistry,
        config: &Config,
    ) -> Placer {
        Placer {
            log: log.new(o!("component" => "Placer")),
            store,
            queue,
            candidates,
            stats,
            retry_delay: config.retry_delay(),
            deadline_backoff: config.deadline_backoff.clone(),
        }
    }

    /// Consume placement requests until shutdown is requested.  Returns an
    /// error only if the broker fails.
    pub async fn run(
        &self,
        mut shutdown: Shutdown,
    ) -> Result<(), anyhow::Error> {
        let mut backoff = self.deadline_backoff.policy();
        info!(self.log, "waiting for placement requests");
        loop {
            if shutdown.is_requested() {
                break;
            }
            let next = tokio::select! {
                _ = shutdown.requested() => break,
                next = self.queue.next_create_task() => next,
            };
            let error = match next {
                Ok(task) => {
                    backoff.reset();
                    self.process(task).await?;
                    continue;
                }
                Err(error) => error,
            };
            match self.queue.recover(error).await.context("reserving task")? {
                Recovery::Retry => (),
                Recovery::BackOff => {
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.deadline_backoff.max());
                    debug!(self.log, "backing off"; "delay" => ?delay);
                    tokio::select! {
                        _ = shutdown.requested() => break,
                        _ = tokio::time::sleep(delay) => (),
                    }
                }
            }
        }
        info!(self.log, "placement loop stopped");
        Ok(())
    }

    /// Run one task through the pipeline and delete or release it.  Fails
    /// only if the broker does.
    pub async fn process(
        &self,
        mut task: Task,
    ) -> Result<Outcome, anyhow::Error> {
        let log = self.log.new(o!(
            "task_id" => task.id(),
            "job_id" => task.job.id.to_string(),
            "guest_id" => task.guest.id.to_string(),
            "action" => task.job.action.clone(),
        ));

        let failure = match self.pipeline(&log, &mut task).await {
            Ok(outcome) => return Ok(outcome),
            Err(failure) => failure,
        };
        let stage = failure.stage;
        match failure.error {
            StageError::Reject(message) => {
                warn!(log, "rejecting placement request";
                    "stage" => stage,
                    "error" => &message,
                );
                self.record_error(&log, &mut task, message).await;
                task.delete().await.context("deleting rejected task")?;
                Ok(Outcome::Rejected)
            }
            StageError::Stale(message) => {
                info!(log, "dropping task";
                    "stage" => stage,
                    "reason" => message,
                );
                task.delete().await.context("deleting stale task")?;
                Ok(Outcome::Dropped)
            }
            StageError::Retry(error) => {
                warn!(log, "placement failed; will retry";
                    "stage" => stage,
                    "error" => format!("{:#}", error),
                );
                task.release_with_delay(self.retry_delay)
                    .await
                    .context("releasing task")?;
                Ok(Outcome::Released)
            }
        }
    }

    async fn pipeline(
        &self,
        log: &Logger,
        task: &mut Task,
    ) -> Result<Outcome, StageFailure> {
        use stages::*;

        let progress = self
            .stage(CHECK_JOB_STATUS, self.check_job_status(task))
            .await?;
        let mut outcome = Outcome::Forwarded;
        if progress == Progress::Place {
            self.stage(CHECK_GUEST_STATUS, self.check_guest_status(task))
                .await?;
            let hypervisor = self
                .stage(SELECT_HYPERVISOR, self.select_hypervisor(log, task))
                .await?;
            self.stage(CHANGE_JOB_ACTION, self.change_job_action(task))
                .await?;
            outcome = Outcome::Placed { hypervisor };
        } else {
            info!(log, "placement was already committed; forwarding job");
        }
        self.stage(ADD_JOB_TO_WORKER, self.add_job_to_worker(task)).await?;
        self.stage(DELETE_TASK, self.delete_task(task)).await?;
        Ok(outcome)
    }

    /// Runs one stage, recording its execution time and outcome.
    async fn stage<T, F>(
        &self,
        stage: &'static str,
        f: F,
    ) -> Result<T, StageFailure>
    where
        F: Future<Output = Result<T, StageError>>,
    {
        let start = Instant::now();
        let result = f.await;
        self.stats.record(stage, start.elapsed(), result.is_ok());
        result.map_err(|error| StageFailure { stage, error })
    }

    async fn check_job_status(
        &self,
        task: &Task,
    ) -> Result<Progress, StageError> {
        let job = &task.job;
        if job.status == JobStatus::New {
            if job.action == actions::SELECT_HYPERVISOR {
                return Ok(Progress::Place);
            }
            let placed = task.guest.hypervisor_id.is_some();
            if job.action == actions::FETCH && placed {
                return Ok(Progress::Forward);
            }
        }
        let message = format!(
            "job is {:?} in state {}, expected {:?} in state {}",
            job.action,
            job.status,
            actions::SELECT_HYPERVISOR,
            JobStatus::New,
        );
        if job.status.is_terminal() {
            Err(StageError::Stale(message))
        } else {
            Err(StageError::Reject(message))
        }
    }

    async fn check_guest_status(&self, task: &Task) -> Result<(), StageError> {
        match task.guest.hypervisor_id {
            None => Ok(()),
            Some(hypervisor) => Err(StageError::Reject(format!(
                "guest is already placed on hypervisor {}",
                hypervisor
            ))),
        }
    }

    async fn select_hypervisor(
        &self,
        log: &Logger,
        task: &mut Task,
    ) -> Result<Uuid, StageError> {
        let flavor_id = task.guest.flavor_id;
        let flavor: Flavor = match self.store.fetch(&flavor_id).await {
            Ok(flavor) => flavor,
            Err(error) if error.is_not_found() => {
                return Err(StageError::Reject(format!(
                    "flavor {} not found",
                    flavor_id
                )));
            }
            Err(error) => return Err(retry("loading flavor")(error)),
        };

        let mut candidates: Vec<Hypervisor> = self
            .store
            .fetch_all()
            .await
            .map_err(retry("listing hypervisors"))?;
        if candidates.is_empty() {
            return Err(StageError::Reject(String::from(
                "no candidates: the cluster has no hypervisors",
            )));
        }

        let ctx = PlacementContext {
            store: &self.store,
            guest: &task.guest,
            flavor: &flavor,
        };
        for function in &self.candidates {
            let before = candidates.len();
            candidates = function
                .apply(&ctx, candidates)
                .await
                .map_err(retry("running candidate function"))?;
            debug!(log, "applied candidate function";
                "function" => function.name(),
                "before" => before,
                "after" => candidates.len(),
            );
            if candidates.is_empty() {
                return Err(StageError::Reject(format!(
                    "no candidates left after {:?}",
                    function.name()
                )));
            }
        }
        let Some(chosen) = candidates.first().map(|hv| hv.id) else {
            return Err(StageError::Reject(String::from("no candidates")));
        };

        match self.store.hypervisor_add_guest(chosen, &mut task.guest).await {
            Ok(_) => Ok(chosen),
            Err(error @ corral_store::Error::AlreadyPlaced { .. }) => {
                Err(StageError::Reject(error.to_string()))
            }
            // Lost a race for the guest or the hypervisor's resources.  On
            // the next delivery the candidates will reflect what happened.
            Err(error) => Err(retry("placing guest")(error)),
        }
    }

    async fn change_job_action(
        &self,
        task: &mut Task,
    ) -> Result<(), StageError> {
        task.job.action = actions::FETCH.to_string();
        self.store
            .job_save(&mut task.job)
            .await
            .map_err(retry("saving job"))
    }

    async fn add_job_to_worker(&self, task: &Task) -> Result<(), StageError> {
        self.queue
            .add_task(&task.job)
            .await
            .map(|_| ())
            .map_err(retry("queueing job for the worker"))
    }

    async fn delete_task(&self, task: &Task) -> Result<(), StageError> {
        task.delete().await.map_err(retry("deleting task"))
    }

    /// Marks the task's job failed, unless it has already finished.
    async fn record_error(
        &self,
        log: &Logger,
        task: &mut Task,
        message: String,
    ) {
        if task.job.status.is_terminal() {
            debug!(log, "job already finished; not recording error";
                "status" => %task.job.status);
            return;
        }
        task.job.set_error(message);
        if let Err(error) = self.store.job_save(&mut task.job).await {
            error!(log, "failed to record job error"; "error" => %error);
        }
    }
}
