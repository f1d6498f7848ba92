// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for the placement daemon

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use corral_common::cmd::fatal;
use corral_common::cmd::CmdError;
use corral_common::metrics::start_metrics_server;
use corral_common::parse_log_level;
use corral_common::shutdown::shutdown_on_signals;
use corral_common::stats::StatsRegistry;
use corral_jobqueue::beanstalk::Beanstalk;
use corral_jobqueue::JobQueue;
use corral_kv::etcd::EtcdKv;
use corral_kv::lock;
use corral_kv::KvStore;
use corral_placerd::candidates;
use corral_placerd::candidates::CandidateFunction;
use corral_placerd::Config;
use corral_placerd::Placer;
use corral_store::Store;
use dropshot::ConfigLoggingLevel;
use slog::info;
use std::sync::Arc;
use uuid::Uuid;

/// Place new guests on hypervisors
#[derive(Debug, Parser)]
#[clap(name = "corral-placerd")]
struct Args {
    /// etcd endpoint holding the cluster state
    #[clap(long, default_value = "http://127.0.0.1:2379", action)]
    kv_address: String,

    /// beanstalkd address
    #[clap(long, default_value = "127.0.0.1:11300", action)]
    queue_address: String,

    /// port for the metrics endpoint (0 disables it)
    #[clap(long, default_value_t = 0, action)]
    metrics_port: u16,

    #[clap(long, default_value = "info", value_parser = parse_log_level)]
    log_level: ConfigLoggingLevel,

    /// key prefix of the cluster state
    #[clap(long, default_value = corral_common::DEFAULT_KEY_ROOT, action)]
    root: String,

    /// TOML file with tuning settings
    #[clap(long, action)]
    config_file: Option<Utf8PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();
    let config = match &args.config_file {
        Some(path) => Config::from_file(path)
            .map_err(|error| CmdError::Failure(anyhow!(error)))?,
        None => Config::default(),
    };
    let candidates = candidates::from_names(&config.candidates)
        .map_err(|error| CmdError::Usage(error.to_string()))?;
    run(args, config, candidates).await.map_err(CmdError::Failure)
}

async fn run(
    args: Args,
    config: Config,
    candidates: Vec<Box<dyn CandidateFunction>>,
) -> Result<(), anyhow::Error> {
    let log = corral_common::stderr_logger("corral-placerd", args.log_level)?;
    info!(log, "starting"; "config" => ?config);
    let (trigger, shutdown) = shutdown_on_signals(&log)?;

    let kv: Arc<dyn KvStore> = Arc::new(
        EtcdKv::new(&log, &args.kv_address, config.kv_timeout())
            .context("creating KV client")?,
    );
    let store = Store::new(&log, kv.clone(), &args.root, config.job_ttl());
    let broker = Beanstalk::connect(&log, &args.queue_address)
        .await
        .with_context(|| {
            format!("connecting to queue broker at {}", args.queue_address)
        })?;
    let queue = JobQueue::new(
        &log,
        Arc::new(broker),
        store.clone(),
        config.queue.clone(),
    );

    let lock_key = corral_placerd::lock_key(&args.root);
    let holder = format!("corral-placerd-{}", Uuid::new_v4());
    let mut waiting = shutdown.clone();
    let lock = tokio::select! {
        _ = waiting.requested() => {
            info!(log, "shutdown requested while waiting for lock");
            return Ok(());
        }
        lock = lock::acquire_with_retry(
            &log,
            kv.clone(),
            &lock_key,
            &holder,
            config.lock_ttl(),
            config.deadline_backoff.policy(),
        ) => lock.with_context(|| format!("acquiring lock {}", lock_key))?,
    };
    let keeper = lock::spawn_refresher(lock);
    trigger.trigger_when(&log, "lock lost", keeper.lost());

    let stats = StatsRegistry::new();
    let _metrics = start_metrics_server(
        &log,
        "corral-placerd",
        args.metrics_port,
        stats.clone(),
    )?;

    let placer = Placer::new(&log, store, queue, candidates, stats, &config);
    let result = placer.run(shutdown).await;

    keeper.release().await.context("releasing lock")?;
    result?;
    info!(log, "exiting");
    Ok(())
}
