// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for the worker daemon

use anyhow::anyhow;
use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use corral_agent_client::HttpAgentResolver;
use corral_common::cmd::fatal;
use corral_common::cmd::CmdError;
use corral_common::metrics::start_metrics_server;
use corral_common::parse_log_level;
use corral_common::shutdown::shutdown_on_signals;
use corral_common::stats::StatsRegistry;
use corral_jobqueue::beanstalk::Beanstalk;
use corral_jobqueue::JobQueue;
use corral_kv::etcd::EtcdKv;
use corral_store::Store;
use corral_workerd::Config;
use corral_workerd::Worker;
use dropshot::ConfigLoggingLevel;
use slog::info;
use std::sync::Arc;

/// Carry out guest jobs on the hypervisor agents
#[derive(Debug, Parser)]
#[clap(name = "corral-workerd")]
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
    run(args, config).await.map_err(CmdError::Failure)
}

async fn run(args: Args, config: Config) -> Result<(), anyhow::Error> {
    let log = corral_common::stderr_logger("corral-workerd", args.log_level)?;
    info!(log, "starting"; "config" => ?config);
    let (_trigger, shutdown) = shutdown_on_signals(&log)?;

    let kv = EtcdKv::new(&log, &args.kv_address, config.kv_timeout())
        .context("creating KV client")?;
    let store = Store::new(&log, Arc::new(kv), &args.root, config.job_ttl());
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
    let agents = HttpAgentResolver::new(
        &log,
        config.agent_port,
        config.agent_timeout(),
    )
    .context("creating agent client")?;

    let stats = StatsRegistry::new();
    let _metrics = start_metrics_server(
        &log,
        "corral-workerd",
        args.metrics_port,
        stats.clone(),
    )?;

    let worker =
        Worker::new(&log, store, queue, Arc::new(agents), stats, &config);
    worker.run(shutdown).await?;
    info!(log, "exiting");
    Ok(())
}
