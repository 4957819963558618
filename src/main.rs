//! Main entry point for the zipstreamer HTTP service.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use zipstreamer::{
    AppState, Cli, LinkCache, RetryingFetcher, S3ObjectSource, TracingReporter, ZipStreamer,
    build_info, create_router, spawn_link_sweeper,
};

/// How often expired download links are dropped in the background.
const LINK_SWEEP_PERIOD: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Several TLS stacks end up linked in; pin one for the whole process.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let listen_addr = cli.listen_addr()?;

    let mut fetcher = RetryingFetcher::new(cli.retry_policy(), cli.fetch_timeout())
        .context("failed to build HTTP client")?;
    if let Some(marker) = cli.object_store_marker() {
        tracing::info!(marker, "object store retrieval enabled");
        fetcher = fetcher.with_object_source(Arc::new(S3ObjectSource::new(marker)));
    }

    let fetch_attempts = fetcher.policy().max_attempts;
    let streamer = ZipStreamer::new(fetcher)
        .with_reporter(Arc::new(TracingReporter))
        .with_compression(cli.compression);

    let state = Arc::new(AppState::new(
        streamer,
        LinkCache::new(cli.link_ttl()),
        cli.server_config(),
    ));
    let sweeper = spawn_link_sweeper(Arc::clone(&state), LINK_SWEEP_PERIOD);

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(
        %listen_addr,
        revision = build_info::revision(),
        compression = %cli.compression,
        fetch_attempts,
        link_ttl_secs = cli.link_ttl_secs,
        "zipstreamer listening"
    );

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    sweeper.abort();
    tracing::info!("zipstreamer stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
