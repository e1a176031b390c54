use crate::config::GatewayConfig;
use crate::server::{self, GatewayState};
use crate::telemetry::Metrics;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Interval of the response-cache expiry sweep.
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(30);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: String,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → build → sync → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration and the dispatch core. Any error here aborts startup.
    let config = GatewayConfig::load(&args.config_path)?;
    let drain_timeout = Duration::from_secs(config.server.drain_timeout_secs);
    let poll_interval = Duration::from_secs(config.consul.poll_interval_secs);
    let metrics = Metrics::install()?;

    // `shutdown` stops accepting and ends background loops; `abort` cancels
    // requests still in flight once draining is over.
    let shutdown = CancellationToken::new();
    let abort = CancellationToken::new();
    let state = GatewayState::new(config, metrics, &abort)?;

    // Phase 2: first registry round before traffic, so discovered routes do
    // not start out empty.
    if let Some(sync) = &state.registry_sync {
        let updated = sync.sync_once().await;
        tracing::info!(
            "discovery: initial sync completed, updated={}, services={}",
            updated,
            sync.service_count()
        );
    }

    // Phase 3: background loops.
    state.limiter.start_gc(shutdown.clone());
    state.cache_store.start_purge(CACHE_PURGE_INTERVAL, shutdown.clone());
    if let Some(sync) = &state.registry_sync {
        let sync = sync.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            // the first round already ran above
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.cancelled() => return,
            }
            if let Err(e) = sync.start(poll_interval, shutdown).await {
                tracing::error!("discovery: sync task failed, error={}", e);
            }
        });
    }

    // Phase 4: admin and proxy servers.
    let admin_listener = TcpListener::bind(&args.admin_listen)
        .await
        .with_context(|| format!("binding admin listener {}", args.admin_listen))?;
    start_admin_server(admin_listener, &state, &shutdown);

    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding proxy listener {}", args.listen))?;
    tracing::info!("server: starting gateway, listen={}", args.listen);

    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(listener, state, shutdown, drain_timeout).await }
    });

    // Phase 5: block until signal, then drain.
    wait_for_shutdown(&shutdown).await;

    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy failed, error={}", e),
        Err(e) => tracing::error!("server: proxy task error, error={}", e),
    }
    abort.cancel();

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    // the writer must outlive every task that logs
    std::mem::forget(guard);
}

fn start_admin_server(listener: TcpListener, state: &GatewayState, shutdown: &CancellationToken) {
    let state = state.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(listener, state, shutdown).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("server: SIGTERM handler not installed, error={}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
