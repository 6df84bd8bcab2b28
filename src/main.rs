//! Process entry point: parse configuration, wire the catalog client, cache,
//! transport and proxy context together, bind listeners, and drive the
//! lifecycle supervisor to completion.
//!
//! Exit codes: `0` clean shutdown, `1` fatal bind failure, `2` fatal
//! configuration error.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use catalog_router::cache::ResolutionCache;
use catalog_router::catalog::CatalogClient;
use catalog_router::config::RouterConfig;
use catalog_router::health::HealthStatus;
use catalog_router::lifecycle::{self, Lifecycle};
use catalog_router::proxy::ProxyContext;
use catalog_router::transport::Transport;
use tracing::{error, info};

const EXIT_BIND_FAILURE: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    catalog_router::tracing::init_tracing();

    let config = match RouterConfig::parse() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "fatal error, exiting");
            ExitCode::from(EXIT_BIND_FAILURE)
        }
    }
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    let proxy_listener = lifecycle::bind(config.bind_http)
        .await
        .with_context(|| format!("failed to bind proxy listener on {}", config.bind_http))?;

    let catalog = CatalogClient::new(&config.consul, config.dial_timeout);
    let cache = ResolutionCache::new(catalog, config.cache_timeout);
    let transport = Transport::new(&config);
    let ctx = Arc::new(ProxyContext::new(
        config.domain.clone(),
        config.prefer.clone(),
        cache,
        transport,
        config.enable_compression,
    ));

    let health = HealthStatus::new();
    let supervisor = Lifecycle::new(health.clone());

    let mut side_tasks = Vec::new();

    if let Some(addr) = config.bind_health_check {
        let listener = lifecycle::bind(addr)
            .await
            .with_context(|| format!("failed to bind health listener on {addr}"))?;
        let health = health.clone();
        let shutdown = supervisor.shutdown_token();
        side_tasks.push(tokio::spawn(async move {
            if let Err(err) = catalog_router::health::serve(listener, health, shutdown).await {
                error!(error = %err, "health endpoint exited with error");
            }
        }));
    }

    #[cfg(feature = "pprof")]
    if let Some(addr) = config.bind_pprof {
        let shutdown = supervisor.shutdown_token();
        side_tasks.push(tokio::spawn(async move {
            if let Err(err) = catalog_router::pprof::serve(addr, shutdown).await {
                error!(error = %err, "pprof endpoint exited with error");
            }
        }));
    }
    #[cfg(not(feature = "pprof"))]
    if config.bind_pprof.is_some() {
        tracing::warn!("--bind-pprof was set but this binary was built without the `pprof` feature");
    }

    info!(
        bind_http = %config.bind_http,
        domain = %config.domain,
        consul = %config.consul,
        "starting catalog-router"
    );

    tokio::spawn(lifecycle::watch_for_shutdown(supervisor.clone()));

    lifecycle::run(
        proxy_listener,
        ctx,
        supervisor,
        config.shutdown_timeout,
        config.max_header_bytes,
    )
    .await
    .context("proxy accept loop exited with an error")?;

    for task in side_tasks {
        let _ = task.await;
    }

    Ok(())
}
