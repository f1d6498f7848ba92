// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driving an [`Integrator`] from watch events

use crate::artifact;
use crate::artifact::ArtifactWriter;
use crate::mirror::IntegrationError;
use crate::Config;
use anyhow::anyhow;
use anyhow::Context;
use async_trait::async_trait;
use corral_common::backoff::Backoff;
use corral_common::backoff::BackoffConfig;
use corral_common::shutdown::Shutdown;
use corral_common::stats::StatsRegistry;
use corral_kv::watcher::Watcher;
use corral_kv::WatchEvent;
use corral_store::Store;
use slog::{debug, info, o, warn, Logger};
use std::collections::BTreeMap;
use std::time::Instant;

/// What to do after an event was found to contradict the mirror
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OnInconsistency {
    /// load everything again
    Refetch,
    /// drop the event and carry on
    Skip,
}

/// Contents for one generated file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rendered {
    pub name: &'static str,
    pub contents: String,
}

/// Keeps derived configuration in line with part of the cluster state
#[async_trait]
pub trait Integrator: Send {
    fn name(&self) -> &'static str;

    /// key prefixes whose changes may affect the output
    fn prefixes(&self, store: &Store) -> Vec<String>;

    fn on_inconsistency(&self) -> OnInconsistency;

    /// Replaces everything held with a fresh load from `store`.
    async fn fetch_all(
        &mut self,
        store: &Store,
    ) -> Result<(), corral_store::Error>;

    /// Applies one change.  Returns true if the output needs to be
    /// generated again.
    fn integrate_event(
        &mut self,
        event: &WatchEvent,
    ) -> Result<bool, IntegrationError>;

    fn render(&self) -> Vec<Rendered>;
}

/// What became of one watch event
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// no effect on the output
    Ignored,
    /// the output was generated again but came out the same
    Unchanged,
    /// at least one file was replaced
    Regenerated,
    /// the event contradicted the mirror, which was then loaded again
    Refetched,
    /// the event contradicted the mirror and was dropped
    Skipped,
    /// the event could not be understood
    Rejected,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Ignored => "ignored",
            Outcome::Unchanged => "unchanged",
            Outcome::Regenerated => "regenerated",
            Outcome::Refetched => "refetched",
            Outcome::Skipped => "skipped",
            Outcome::Rejected => "rejected",
        }
    }
}

pub struct Reconciler<I> {
    log: Logger,
    store: Store,
    watcher: Watcher,
    integrator: I,
    artifacts: BTreeMap<&'static str, ArtifactWriter>,
    reload_command: Vec<String>,
    refetch_backoff: BackoffConfig,
    stats: StatsRegistry,
    /// a previous generation failed to write, so write on the next event
    /// even if nothing changed
    dirty: bool,
}

impl<I: Integrator> Reconciler<I> {
    /// `artifacts` pairs each name the integrator renders with the file it
    /// goes to.
    pub fn new(
        log: &Logger,
        store: Store,
        integrator: I,
        artifacts: Vec<(&'static str, ArtifactWriter)>,
        stats: StatsRegistry,
        config: &Config,
    ) -> Reconciler<I> {
        let log = log.new(o!("component" => integrator.name()));
        let watcher = Watcher::new(&log, store.kv().clone());
        Reconciler {
            log,
            store,
            watcher,
            integrator,
            artifacts: artifacts.into_iter().collect(),
            reload_command: config.reload_command.clone(),
            refetch_backoff: config.refetch_backoff.clone(),
            stats,
            dirty: false,
        }
    }

    pub fn integrator(&self) -> &I {
        &self.integrator
    }

    /// Starts watching, loads the full state and writes the output once.
    ///
    /// Watches are set up before the load so that no change falls between
    /// the two.  Changes made while the load runs are then seen twice; the
    /// mirror drops the repeats.
    pub async fn start(&mut self) -> Result<(), anyhow::Error> {
        for prefix in self.integrator.prefixes(&self.store) {
            self.watcher
                .add(&prefix)
                .await
                .with_context(|| format!("watching {}", prefix))?;
        }
        self.refetch().await?;
        self.regenerate().await;
        Ok(())
    }

    /// Waits for the next event and integrates it.  Returns `None` once the
    /// watcher has been closed.
    pub async fn step(&mut self) -> Result<Option<Outcome>, anyhow::Error> {
        if !self.watcher.next().await {
            return match self.watcher.err() {
                Some(error) => Err(anyhow!(error).context("watch failed")),
                None => Ok(None),
            };
        }
        let Some(event) = self.watcher.event() else {
            return Ok(None);
        };
        self.handle_event(&event).await.map(Some)
    }

    pub async fn handle_event(
        &mut self,
        event: &WatchEvent,
    ) -> Result<Outcome, anyhow::Error> {
        if self.watcher.take_resync() {
            info!(self.log, "watch history was lost, reloading");
            self.refetch().await?;
            self.dirty = true;
        }

        let outcome = match self.integrator.integrate_event(event) {
            Ok(false) if !self.dirty => Outcome::Ignored,
            Ok(_) => self.regenerate().await,
            Err(error) if error.is_inconsistency() => {
                warn!(self.log, "rejected event";
                    "key" => &event.key,
                    "kind" => %event.kind,
                    "error" => %error);
                match self.integrator.on_inconsistency() {
                    OnInconsistency::Refetch => {
                        self.refetch().await?;
                        self.regenerate().await;
                        Outcome::Refetched
                    }
                    OnInconsistency::Skip => Outcome::Skipped,
                }
            }
            Err(error) => {
                warn!(self.log, "rejected event";
                    "key" => &event.key,
                    "error" => %error);
                Outcome::Rejected
            }
        };
        debug!(self.log, "integrated event";
            "key" => &event.key,
            "index" => event.index,
            "outcome" => outcome.label());
        self.stats.increment(outcome.label(), outcome != Outcome::Rejected);
        Ok(outcome)
    }

    /// Integrates events until shutdown is requested or the watch fails.
    pub async fn run(
        mut self,
        mut shutdown: Shutdown,
    ) -> Result<(), anyhow::Error> {
        let result = tokio::select! {
            _ = shutdown.requested() => Ok(()),
            result = self.start() => result,
        };
        if let Err(error) = result {
            self.watcher.close();
            return Err(error);
        }

        let result = loop {
            if shutdown.is_requested() {
                break Ok(());
            }
            tokio::select! {
                _ = shutdown.requested() => break Ok(()),
                outcome = self.step() => match outcome {
                    Ok(Some(_)) => continue,
                    Ok(None) => break Ok(()),
                    Err(error) => break Err(error),
                },
            }
        };
        info!(self.log, "stopping");
        self.watcher.close();
        result
    }

    /// Loads everything, retrying while the store is unreachable.  A body
    /// that cannot be decoded is not retried.
    async fn refetch(&mut self) -> Result<(), anyhow::Error> {
        let start = Instant::now();
        let mut policy = self.refetch_backoff.policy();
        let result = loop {
            match self.integrator.fetch_all(&self.store).await {
                Ok(()) => break Ok(()),
                Err(error @ corral_store::Error::Kv(_)) => {
                    let delay = policy
                        .next_backoff()
                        .unwrap_or_else(|| self.refetch_backoff.max());
                    warn!(self.log, "failed to load state";
                        "error" => %error, "retry_after" => ?delay);
                    tokio::time::sleep(delay).await;
                }
                Err(error) => break Err(error),
            }
        };
        self.stats.record("fetch_all", start.elapsed(), result.is_ok());
        result.context("loading state")
    }

    /// Renders and writes every file.  Failures leave the reconciler dirty
    /// so that the next event tries again.
    async fn regenerate(&mut self) -> Outcome {
        let start = Instant::now();
        let mut changed = false;
        let mut failed = false;
        for rendered in self.integrator.render() {
            let Some(writer) = self.artifacts.get_mut(rendered.name) else {
                warn!(self.log, "no file configured for output";
                    "artifact" => rendered.name);
                continue;
            };
            match writer.write(&rendered.contents) {
                Ok(wrote) => changed |= wrote,
                Err(error) => {
                    warn!(self.log, "failed to write output";
                        "artifact" => rendered.name,
                        "error" => %error);
                    failed = true;
                }
            }
        }
        self.dirty = failed;
        self.stats.record("regenerate", start.elapsed(), !failed);
        if changed {
            artifact::reload(&self.log, &self.reload_command).await;
            Outcome::Regenerated
        } else {
            Outcome::Unchanged
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dhcp;
    use crate::dhcp::DhcpIntegrator;
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use corral_kv::sim::SimKv;
    use corral_store::testing::*;
    use corral_test_utils::dev::test_setup_log;
    use std::os::unix::fs::MetadataExt;
    use std::sync::Arc;
    use std::time::Duration;

    /// A DHCP reconciler that writes only the hypervisor reservations
    fn dhcp_reconciler(
        log: &Logger,
        store: &Store,
        path: &Utf8Path,
        stats: &StatsRegistry,
        config: &Config,
    ) -> Reconciler<DhcpIntegrator> {
        Reconciler::new(
            log,
            store.clone(),
            DhcpIntegrator::new(store.root()),
            vec![(
                dhcp::HYPERVISORS,
                ArtifactWriter::new(log, dhcp::HYPERVISORS, path),
            )],
            stats.clone(),
            config,
        )
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let logctx = test_setup_log("test_run_until_shutdown");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("hypervisors.conf");
        let store = store(&logctx.log);
        let stats = StatsRegistry::new();
        let reconciler = dhcp_reconciler(
            &logctx.log,
            &store,
            &path,
            &stats,
            &Config::default(),
        );
        let (trigger, shutdown) = Shutdown::new();
        let task = tokio::spawn(reconciler.run(shutdown));

        // The first write happens during startup, before any event.
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut hv = hypervisor(8, 8192);
        store.save(&mut hv).await.unwrap();
        while stats.get("regenerated").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let hosts = std::fs::read_to_string(&path).unwrap();
        assert!(hosts.contains(&hv.id.to_string()));

        trigger.trigger();
        task.await.unwrap().unwrap();
        assert_eq!(stats.get("fetch_all").unwrap().successes, 1);
        // No file was configured for the guest reservations.
        assert_eq!(stats.get("regenerate").unwrap().errors, 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_unchanged_output_not_reloaded() {
        let logctx = test_setup_log("test_unchanged_output_not_reloaded");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("hypervisors.conf");
        let marker = dir.path().join("reloaded");
        let config = Config {
            reload_command: vec![String::from("touch"), marker.to_string()],
            ..Config::default()
        };
        let store = store(&logctx.log);
        let stats = StatsRegistry::new();
        let mut reconciler =
            dhcp_reconciler(&logctx.log, &store, &path, &stats, &config);

        reconciler.start().await.unwrap();
        assert!(marker.exists());
        std::fs::remove_file(&marker).unwrap();
        let inode = std::fs::metadata(&path).unwrap().ino();

        // Subnets do not show up in the hypervisor reservations.
        store.save(&mut subnet()).await.unwrap();
        assert_eq!(reconciler.step().await.unwrap(), Some(Outcome::Unchanged));
        assert!(!marker.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().ino(), inode);

        let mut hv = hypervisor(8, 8192);
        store.save(&mut hv).await.unwrap();
        assert_eq!(
            reconciler.step().await.unwrap(),
            Some(Outcome::Regenerated)
        );
        assert!(marker.exists());
        let hosts = std::fs::read_to_string(&path).unwrap();
        assert!(hosts.contains(&hv.id.to_string()));

        reconciler.watcher.close();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_lost_history_reloads() {
        let logctx = test_setup_log("test_lost_history_reloads");
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("hypervisors.conf");
        let kv = Arc::new(SimKv::new());
        // The first watch breaks off before passing anything on.
        kv.interrupt_next_watch(
            0,
            Some(corral_kv::Error::IndexCleared { index: 1 }),
        );
        let store = Store::new(
            &logctx.log,
            kv.clone(),
            "/corral",
            corral_store::DEFAULT_JOB_TTL,
        );
        let stats = StatsRegistry::new();
        let mut reconciler = dhcp_reconciler(
            &logctx.log,
            &store,
            &path,
            &stats,
            &Config::default(),
        );

        reconciler.start().await.unwrap();
        let prefixes = reconciler.watcher.prefixes().len();
        while kv.watches_opened().len() <= prefixes {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.get("fetch_all").unwrap().successes, 1);

        // The next event finds the flag raised and loads everything again.
        let mut hv = hypervisor(8, 8192);
        store.save(&mut hv).await.unwrap();
        assert_eq!(
            reconciler.step().await.unwrap(),
            Some(Outcome::Regenerated)
        );
        assert_eq!(stats.get("fetch_all").unwrap().successes, 2);
        let hosts = std::fs::read_to_string(&path).unwrap();
        assert!(hosts.contains(&hv.id.to_string()));

        // Once only
        let mut other = hypervisor(4, 4096);
        store.save(&mut other).await.unwrap();
        assert_eq!(
            reconciler.step().await.unwrap(),
            Some(Outcome::Regenerated)
        );
        assert_eq!(stats.get("fetch_all").unwrap().successes, 2);

        reconciler.watcher.close();
        logctx.cleanup_successful();
    }
}
