// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The execution state machine
//!
//! What happens to a task depends on the status of its job:
//!
//! * `new`: start the operation on the guest's hypervisor agent, remember
//!   the agent's job ID and move to `working`
//! * `working`: ask the agent how its job is doing.  While it is still
//!   running the task is released and comes back after the poll interval.
//!   When it failed the job fails.  When it succeeded the job is `done`,
//!   except that a finished "fetch" turns into a new "create" job which is
//!   started right away, in the same delivery.
//! * `done`: clean up after "delete" jobs and drop the task
//! * `error`: drop the task
//!
//! Every transition is saved before the next step runs, so a worker that
//! crashes leaves a job that the next delivery of the task picks up where
//! this one left off.

use crate::Config;
use anyhow::anyhow;
use anyhow::Context;
use corral_agent_client::AgentResolver;
use corral_agent_client::GuestAgent;
use corral_agent_client::RemoteJobStatus;
use corral_common::backoff::Backoff;
use corral_common::backoff::BackoffConfig;
use corral_common::shutdown::Shutdown;
use corral_common::stats::StatsRegistry;
use corral_jobqueue::JobQueue;
use corral_jobqueue::Recovery;
use corral_jobqueue::Task;
use corral_store::actions;
use corral_store::Hypervisor;
use corral_store::JobStatus;
use corral_store::Store;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
enum StepError {
    /// The job cannot succeed.
    #[error("{0}")]
    Terminal(String),

    /// Try the same step again later.
    #[error("{0:#}")]
    Transient(anyhow::Error),
}

impl From<corral_agent_client::Error> for StepError {
    fn from(error: corral_agent_client::Error) -> Self {
        if error.is_transient() {
            StepError::Transient(anyhow!(error))
        } else {
            StepError::Terminal(error.to_string())
        }
    }
}

fn transient<E>(context: &'static str) -> impl FnOnce(E) -> StepError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |error| StepError::Transient(anyhow!(error).context(context))
}

/// Result of one step of the state machine
enum Step {
    /// run the next step now
    Continue,
    /// the agent is still busy
    Wait,
    /// nothing more to do
    Finished,
}

/// How a task left the worker
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// The task was deleted; the job is in the given (terminal) state.
    Finished(JobStatus),
    /// The task was released and will come back.
    Released,
}

pub struct Worker {
    log: Logger,
    store: Store,
    queue: JobQueue,
    agents: Arc<dyn AgentResolver>,
    stats: StatsRegistry,
    guest_actions: BTreeSet<String>,
    poll_interval: Duration,
    deadline_backoff: BackoffConfig,
}

impl Worker {
    pub fn new(
        log: &Logger,
        store: Store,
        queue: JobQueue,
        agents: Arc<dyn AgentResolver>,
        stats: StatsRegistry,
        config: &Config,
    ) -> Worker {
        Worker {
            log: log.new(o!("component" => "Worker")),
            store,
            queue,
            agents,
            stats,
            guest_actions: config.guest_actions.iter().cloned().collect(),
            poll_interval: config.poll_interval(),
            deadline_backoff: config.deadline_backoff.clone(),
        }
    }

    /// Consume work until shutdown is requested.  Returns an error only if
    /// the broker fails.
    pub async fn run(
        &self,
        mut shutdown: Shutdown,
    ) -> Result<(), anyhow::Error> {
        let mut backoff = self.deadline_backoff.policy();
        info!(self.log, "waiting for work");
        while !shutdown.is_requested() {
            let next = tokio::select! {
                _ = shutdown.requested() => break,
                next = self.queue.next_work_task() => next,
            };
            match next {
                Ok(task) => {
                    backoff.reset();
                    self.process(task).await?;
                }
                Err(error) => {
                    let recovery = self
                        .queue
                        .recover(error)
                        .await
                        .context("reserving task")?;
                    if recovery == Recovery::BackOff {
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
        }
        info!(self.log, "work loop stopped");
        Ok(())
    }

    /// Drive `task`'s job as far as it will go right now, then delete or
    /// release the task.  Fails only if the broker does.
    pub async fn process(
        &self,
        mut task: Task,
    ) -> Result<Outcome, anyhow::Error> {
        let log = self.log.new(o!(
            "task_id" => task.id(),
            "job_id" => task.job.id.to_string(),
            "guest_id" => task.guest.id.to_string(),
        ));

        loop {
            let action = task.job.action.clone();
            let status = task.job.status;
            let start = Instant::now();
            let result = self.step(&log, &mut task).await;
            self.stats.record(&action, start.elapsed(), result.is_ok());

            match result {
                Ok(Step::Continue) => continue,
                Ok(Step::Wait) => {
                    debug!(log, "agent job still running";
                        "action" => &action,
                        "remote" => &task.job.remote,
                    );
                    return self.release(&task).await;
                }
                Ok(Step::Finished) => {
                    task.delete().await.context("deleting task")?;
                    return Ok(Outcome::Finished(task.job.status));
                }
                Err(StepError::Transient(error)) => {
                    warn!(log, "job step failed; will retry";
                        "action" => &action,
                        "status" => %status,
                        "error" => format!("{:#}", error),
                    );
                    return self.release(&task).await;
                }
                Err(StepError::Terminal(message)) => {
                    warn!(log, "job failed";
                        "action" => &action,
                        "status" => %status,
                        "error" => &message,
                    );
                    task.job.set_error(message);
                    if let Err(error) = self.store.job_save(&mut task.job).await
                    {
                        // The task comes back and the failure is found again.
                        error!(log, "failed to record job error";
                            "error" => %error);
                        return self.release(&task).await;
                    }
                    task.delete().await.context("deleting task")?;
                    return Ok(Outcome::Finished(JobStatus::Error));
                }
            }
        }
    }

    async fn release(&self, task: &Task) -> Result<Outcome, anyhow::Error> {
        task.release_with_delay(self.poll_interval)
            .await
            .context("releasing task")?;
        Ok(Outcome::Released)
    }

    async fn step(
        &self,
        log: &Logger,
        task: &mut Task,
    ) -> Result<Step, StepError> {
        match task.job.status {
            JobStatus::Error => Ok(Step::Finished),
            JobStatus::Done => {
                if task.job.action == actions::DELETE {
                    self.cleanup_deleted(log, task).await?;
                }
                Ok(Step::Finished)
            }
            JobStatus::New => self.start(log, task).await,
            JobStatus::Working => self.poll(log, task).await,
        }
    }

    async fn agent(
        &self,
        task: &Task,
    ) -> Result<Arc<dyn GuestAgent>, StepError> {
        let Some(hypervisor_id) = task.guest.hypervisor_id else {
            return Err(StepError::Terminal(String::from(
                "guest is not placed on a hypervisor",
            )));
        };
        let hypervisor: Hypervisor =
            match self.store.fetch(&hypervisor_id).await {
                Ok(hypervisor) => hypervisor,
                Err(error) if error.is_not_found() => {
                    return Err(StepError::Terminal(format!(
                        "hypervisor {} not found",
                        hypervisor_id
                    )));
                }
                Err(error) => {
                    return Err(transient("loading hypervisor")(error));
                }
            };
        Ok(self.agents.agent_for(&hypervisor)?)
    }

    /// Starts the job's operation on the agent.
    async fn start(
        &self,
        log: &Logger,
        task: &mut Task,
    ) -> Result<Step, StepError> {
        let action = task.job.action.as_str();
        let known = matches!(
            action,
            actions::FETCH | actions::CREATE | actions::DELETE
        ) || self.guest_actions.contains(action);
        if !known {
            return Err(StepError::Terminal(format!(
                "unsupported action {:?}",
                action
            )));
        }

        let agent = self.agent(task).await?;
        let guest = &task.guest;
        let remote = match action {
            actions::FETCH => agent.fetch_image(guest).await?,
            actions::CREATE => agent.create_guest(guest).await?,
            actions::DELETE => agent.delete_guest(guest).await?,
            action => agent.guest_action(guest, action).await?,
        };

        task.job.set_working(&remote);
        self.store
            .job_save(&mut task.job)
            .await
            .map_err(transient("saving job"))?;
        info!(log, "started agent job";
            "action" => &task.job.action,
            "remote" => &remote,
        );
        Ok(Step::Continue)
    }

    /// Checks on the agent's job.
    async fn poll(
        &self,
        log: &Logger,
        task: &mut Task,
    ) -> Result<Step, StepError> {
        if task.job.remote.is_empty() {
            return Err(StepError::Terminal(String::from(
                "job is working but has no agent job ID",
            )));
        }
        let agent = self.agent(task).await?;
        let remote = agent.job_status(&task.guest, &task.job.remote).await?;

        match remote.status {
            RemoteJobStatus::Pending => Ok(Step::Wait),
            RemoteJobStatus::Errored => Err(StepError::Terminal(
                remote.message.unwrap_or_else(|| {
                    format!("agent job {} failed", task.job.remote)
                }),
            )),
            RemoteJobStatus::Complete if task.job.action == actions::FETCH => {
                task.job.chain_to_create();
                self.store
                    .job_save(&mut task.job)
                    .await
                    .map_err(transient("saving job"))?;
                info!(log, "image fetched; creating guest");
                Ok(Step::Continue)
            }
            RemoteJobStatus::Complete => {
                task.job.set_done();
                self.store
                    .job_save(&mut task.job)
                    .await
                    .map_err(transient("saving job"))?;
                info!(log, "job done"; "action" => &task.job.action);
                Ok(Step::Continue)
            }
        }
    }

    /// Removes what is left of a guest its hypervisor has deleted.
    async fn cleanup_deleted(
        &self,
        log: &Logger,
        task: &Task,
    ) -> Result<(), StepError> {
        self.store
            .guest_destroy(&task.guest)
            .await
            .map_err(transient("destroying guest"))?;
        info!(log, "removed deleted guest");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use corral_agent_client::RemoteJob;
    use corral_jobqueue::sim::SimBroker;
    use corral_jobqueue::QueueConfig;
    use corral_jobqueue::WORK_TUBE;
    use corral_kv::sim::SimKv;
    use corral_store::Flavor;
    use corral_store::Guest;
    use corral_store::Job;
    use corral_store::Metadata;
    use corral_store::Resources;
    use corral_test_utils::dev::test_setup_log;
    use std::collections::BTreeMap;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Agent double: each operation either starts a job with a predictable
    /// ID or fails with the configured HTTP status.
    #[derive(Default)]
    struct FakeAgent {
        /// action -> status to fail it with
        failures: Mutex<BTreeMap<String, u16>>,
        /// agent job ID -> status reported for it
        jobs: Mutex<BTreeMap<String, RemoteJobStatus>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeAgent {
        fn fail(&self, action: &str, status: u16) {
            self.failures.lock().unwrap().insert(action.to_string(), status);
        }

        fn report(&self, job: &str, status: RemoteJobStatus) {
            self.jobs.lock().unwrap().insert(job.to_string(), status);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn start(
            &self,
            action: &str,
        ) -> Result<String, corral_agent_client::Error> {
            self.calls.lock().unwrap().push(action.to_string());
            let url = format!("http://agent/{}", action);
            match self.failures.lock().unwrap().get(action) {
                Some(&status) if (502..=504).contains(&status) => {
                    Err(corral_agent_client::Error::Unavailable { url, status })
                }
                Some(&status) => Err(corral_agent_client::Error::Rejected {
                    url,
                    status,
                    message: String::from("no"),
                }),
                None => Ok(format!("{}-job", action)),
            }
        }
    }

    #[async_trait]
    impl GuestAgent for FakeAgent {
        async fn fetch_image(
            &self,
            _guest: &Guest,
        ) -> Result<String, corral_agent_client::Error> {
            self.start("fetch")
        }

        async fn create_guest(
            &self,
            _guest: &Guest,
        ) -> Result<String, corral_agent_client::Error> {
            self.start("create")
        }

        async fn delete_guest(
            &self,
            _guest: &Guest,
        ) -> Result<String, corral_agent_client::Error> {
            self.start("delete")
        }

        async fn guest_action(
            &self,
            _guest: &Guest,
            action: &str,
        ) -> Result<String, corral_agent_client::Error> {
            self.start(action)
        }

        async fn job_status(
            &self,
            _guest: &Guest,
            job: &str,
        ) -> Result<RemoteJob, corral_agent_client::Error> {
            self.calls.lock().unwrap().push(format!("status {}", job));
            let status = self
                .jobs
                .lock()
                .unwrap()
                .get(job)
                .copied()
                .unwrap_or(RemoteJobStatus::Pending);
            let message = (status == RemoteJobStatus::Errored)
                .then(|| String::from("disk full"));
            Ok(RemoteJob { status, message })
        }
    }

    struct FakeResolver(Arc<FakeAgent>);

    impl AgentResolver for FakeResolver {
        fn agent_for(
            &self,
            _hypervisor: &Hypervisor,
        ) -> Result<Arc<dyn GuestAgent>, corral_agent_client::Error> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        store: Store,
        broker: Arc<SimBroker>,
        queue: JobQueue,
        agent: Arc<FakeAgent>,
        worker: Worker,
        guest: Guest,
    }

    const POLL: Duration = Duration::from_secs(5);

    /// Sets up a store with one hypervisor holding one guest.
    async fn harness(log: &Logger) -> Harness {
        let store = Store::new(
            log,
            Arc::new(SimKv::new()),
            "/corral",
            corral_store::DEFAULT_JOB_TTL,
        );
        let broker = Arc::new(SimBroker::new());
        let queue = JobQueue::new(
            log,
            broker.clone(),
            store.clone(),
            QueueConfig {
                ttr_secs: 30,
                reserve_timeout_secs: 1,
                ..Default::default()
            },
        );
        let agent = Arc::new(FakeAgent::default());
        let config = Config::default();
        let worker = Worker::new(
            log,
            store.clone(),
            queue.clone(),
            Arc::new(FakeResolver(agent.clone())),
            StatsRegistry::new(),
            &config,
        );

        let resources = Resources { memory: 65536, disk: 500, cpu: 32 };
        let mut hv = Hypervisor {
            id: Uuid::new_v4(),
            ip: Ipv4Addr::new(10, 0, 0, 10),
            mac: String::from("52:54:00:00:00:10"),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            total_resources: resources,
            available_resources: resources,
            metadata: Metadata::new(),
            version: 0,
        };
        store.save(&mut hv).await.unwrap();
        let mut flavor = Flavor {
            id: Uuid::new_v4(),
            name: String::from("small"),
            resources: Resources { memory: 1024, disk: 10, cpu: 4 },
            metadata: Metadata::new(),
            version: 0,
        };
        store.save(&mut flavor).await.unwrap();
        let mut guest = Guest::new(flavor.id);
        store.save(&mut guest).await.unwrap();
        store.hypervisor_add_guest(hv.id, &mut guest).await.unwrap();

        Harness { store, broker, queue, agent, worker, guest }
    }

    impl Harness {
        /// Saves and queues a job for the guest.
        async fn queue_job(
            &self,
            action: &str,
            status: JobStatus,
            remote: &str,
        ) -> Job {
            let mut job = Job::new(action, self.guest.id);
            job.status = status;
            job.remote = remote.to_string();
            self.store.job_save(&mut job).await.unwrap();
            self.queue.add_task(&job).await.unwrap();
            job
        }

        async fn work_next(&self) -> Outcome {
            let task = self.queue.next_work_task().await.unwrap();
            self.worker.process(task).await.unwrap()
        }

        async fn job(&self, job: &Job) -> Job {
            self.store.fetch(&job.id).await.unwrap()
        }
    }

    /// A fetch that completes is chained into a create within the same
    /// delivery.  Here the agent cannot take the create yet, so the job is
    /// left as a new "create" job and the task released.
    #[tokio::test(start_paused = true)]
    async fn test_fetch_chains_to_create() {
        let logctx = test_setup_log("test_fetch_chains_to_create");
        let h = harness(&logctx.log).await;
        h.agent.report("fetch-job", RemoteJobStatus::Complete);
        h.agent.fail("create", 503);
        let job = h.queue_job(actions::FETCH, JobStatus::New, "").await;

        assert_eq!(h.work_next().await, Outcome::Released);
        assert_eq!(
            h.agent.calls(),
            vec!["fetch", "status fetch-job", "create"]
        );
        let job = h.job(&job).await;
        assert_eq!(job.action, actions::CREATE);
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.remote, "");
        assert_eq!(job.error, None);

        // one message, released rather than re-queued
        let pending = h.broker.pending(WORK_TUBE);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body, job.id.to_string());
        logctx.cleanup_successful();
    }

    /// With a healthy agent the same delivery goes on to start the create.
    #[tokio::test(start_paused = true)]
    async fn test_fetch_then_create() {
        let logctx = test_setup_log("test_fetch_then_create");
        let h = harness(&logctx.log).await;
        h.agent.report("fetch-job", RemoteJobStatus::Complete);
        let job = h.queue_job(actions::FETCH, JobStatus::New, "").await;

        assert_eq!(h.work_next().await, Outcome::Released);
        let saved = h.job(&job).await;
        assert_eq!(saved.action, actions::CREATE);
        assert_eq!(saved.status, JobStatus::Working);
        assert_eq!(saved.remote, "create-job");

        // Redelivering the same job does not repeat the fetch.
        tokio::time::sleep(POLL).await;
        h.agent.report("create-job", RemoteJobStatus::Complete);
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Done));
        assert_eq!(
            h.agent.calls(),
            vec![
                "fetch",
                "status fetch-job",
                "create",
                "status create-job",
                "status create-job",
            ]
        );
        let saved = h.job(&job).await;
        assert_eq!(saved.status, JobStatus::Done);
        assert!(saved.finished_at.is_some());
        assert!(h.broker.pending(WORK_TUBE).is_empty());
        assert_eq!(h.broker.reserved(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_completes() {
        let logctx = test_setup_log("test_delete_completes");
        let h = harness(&logctx.log).await;
        h.agent.report("x", RemoteJobStatus::Complete);
        let hv = h.guest.hypervisor_id.unwrap();
        let job = h.queue_job(actions::DELETE, JobStatus::Working, "x").await;

        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Done));
        assert_eq!(h.agent.calls(), vec!["status x"]);
        assert!(h
            .store
            .fetch::<Guest>(&h.guest.id)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(h.store.hypervisor_guests(hv).await.unwrap().is_empty());
        let hv: Hypervisor = h.store.fetch(&hv).await.unwrap();
        assert_eq!(hv.available_resources, hv.total_resources);
        assert_eq!(h.job(&job).await.status, JobStatus::Done);
        assert!(h.broker.pending(WORK_TUBE).is_empty());
        assert_eq!(h.broker.reserved(), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test(start_paused = true)]
    async fn test_agent_failures() {
        let logctx = test_setup_log("test_agent_failures");
        let h = harness(&logctx.log).await;

        // The agent's job fails.
        h.agent.report("reboot-job", RemoteJobStatus::Errored);
        let reboot = h.queue_job("reboot", JobStatus::New, "").await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Error));
        let saved = h.job(&reboot).await;
        assert_eq!(saved.error.as_deref(), Some("disk full"));

        // The agent refuses the request outright.
        h.agent.fail("stop", 409);
        let stop = h.queue_job("stop", JobStatus::New, "").await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Error));
        assert_matches!(h.job(&stop).await.error, Some(message)
            if message.contains("409"));

        // Nobody knows how to do this.
        let dance = h.queue_job("dance", JobStatus::New, "").await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Error));
        assert_matches!(h.job(&dance).await.error, Some(message)
            if message.contains("unsupported action"));

        // Terminal jobs are just dropped.
        let done = h.queue_job("start", JobStatus::Done, "s").await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Done));
        assert_eq!(h.job(&done).await.status, JobStatus::Done);

        assert!(!h.agent.calls().iter().any(|call| call == "dance"));
        assert!(h.broker.pending(WORK_TUBE).is_empty());
        logctx.cleanup_successful();
    }

    /// An unreachable agent leaves the job alone and retries after the poll
    /// interval.
    #[tokio::test(start_paused = true)]
    async fn test_transient_agent_error() {
        let logctx = test_setup_log("test_transient_agent_error");
        let h = harness(&logctx.log).await;
        h.agent.fail("start", 502);
        let job = h.queue_job("start", JobStatus::New, "").await;

        assert_eq!(h.work_next().await, Outcome::Released);
        let saved = h.job(&job).await;
        assert_eq!(saved.status, JobStatus::New);
        assert_eq!(saved.error, None);

        // not before the poll interval
        assert_matches!(
            h.queue.next_work_task().await,
            Err(corral_jobqueue::Error::Timeout)
        );
        h.agent.failures.lock().unwrap().clear();
        h.agent.report("start-job", RemoteJobStatus::Complete);
        tokio::time::sleep(POLL).await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Done));
        logctx.cleanup_successful();
    }

    /// A worker that dies in the middle of a job: the redelivered task picks
    /// up from the saved status instead of starting over.
    #[tokio::test(start_paused = true)]
    async fn test_redelivery_resumes() {
        let logctx = test_setup_log("test_redelivery_resumes");
        let h = harness(&logctx.log).await;
        let job = h.queue_job("restart", JobStatus::New, "").await;

        let task = h.queue.next_work_task().await.unwrap();
        let mut saved = task.job.clone();
        saved.set_working("restart-job");
        h.store.job_save(&mut saved).await.unwrap();
        drop(task);

        h.agent.report("restart-job", RemoteJobStatus::Complete);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.work_next().await, Outcome::Finished(JobStatus::Done));
        assert_eq!(h.agent.calls(), vec!["status restart-job"]);
        assert_eq!(h.job(&job).await.status, JobStatus::Done);
        logctx.cleanup_successful();
    }
}
