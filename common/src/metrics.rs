// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP endpoint exposing a daemon's [`StatsRegistry`]

use crate::stats::StageStats;
use crate::stats::StatsRegistry;
use dropshot::endpoint;
use dropshot::ApiDescription;
use dropshot::ConfigDropshot;
use dropshot::HttpError;
use dropshot::HttpResponseOk;
use dropshot::RequestContext;
use dropshot::ServerBuilder;
use schemars::JsonSchema;
use serde::Serialize;
use slog::{info, o, Logger};
use std::collections::BTreeMap;
use std::net::{Ipv6Addr, SocketAddr};

/// Server-side state for the metrics endpoint
pub struct MetricsContext {
    daemon: String,
    stats: StatsRegistry,
}

/// Body of `GET /metrics`
#[derive(Debug, JsonSchema, Serialize)]
pub struct MetricsView {
    pub daemon: String,
    pub stages: BTreeMap<String, StageStats>,
}

type MetricsApiDescription = ApiDescription<MetricsContext>;

/// Returns a description of the metrics API
pub fn api() -> MetricsApiDescription {
    fn register_endpoints(
        api: &mut MetricsApiDescription,
    ) -> Result<(), String> {
        api.register(metrics_get).map_err(|e| e.to_string())?;
        Ok(())
    }

    let mut api = MetricsApiDescription::new();
    if let Err(err) = register_endpoints(&mut api) {
        panic!("failed to register entrypoints: {}", err);
    }
    api
}

/// Fetch the per-stage counters of this daemon
#[endpoint {
    method = GET,
    path = "/metrics",
}]
async fn metrics_get(
    rqctx: RequestContext<MetricsContext>,
) -> Result<HttpResponseOk<MetricsView>, HttpError> {
    let ctx = rqctx.context();
    Ok(HttpResponseOk(MetricsView {
        daemon: ctx.daemon.clone(),
        stages: ctx.stats.snapshot(),
    }))
}

/// Starts the metrics server on `port`, or does nothing if `port` is 0.
pub fn start_metrics_server(
    log: &Logger,
    daemon: &str,
    port: u16,
    stats: StatsRegistry,
) -> Result<Option<dropshot::HttpServer<MetricsContext>>, anyhow::Error> {
    if port == 0 {
        info!(log, "metrics endpoint disabled");
        return Ok(None);
    }

    let bind_address = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    let server = ServerBuilder::new(
        api(),
        MetricsContext { daemon: daemon.to_string(), stats },
        log.new(o!("component" => "metrics")),
    )
    .config(ConfigDropshot { bind_address, ..Default::default() })
    .start()
    .map_err(|error| anyhow::anyhow!("starting metrics server: {}", error))?;

    info!(log, "serving metrics"; "address" => %server.local_addr());
    Ok(Some(server))
}
