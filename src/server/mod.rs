mod admin;
pub mod bootstrap;
mod state;

pub use admin::handle_admin;
pub use state::GatewayState;

use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::convert::Infallible;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Serve the proxy on `listener` until `shutdown` fires.
///
/// On shutdown the listener stops accepting, open connections are asked to
/// finish their current request, and the server waits up to `drain_timeout`
/// for them before returning.
pub async fn run_proxy_server(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
    drain_timeout: Duration,
) -> Result<()> {
    info!("server: proxy listening, addr={}", listener.local_addr()?);

    // metrics gauges are write-only, so keep our own count for draining
    let active_conns = Arc::new(AtomicI64::new(0));

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown.cancelled() => {
                info!("server: proxy: stop accepting new connections, draining");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: proxy: accept failed, error={}", e);
                continue;
            }
        };

        metrics::gauge!("gateway_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let pipeline = Arc::clone(&state.pipeline);
        let active_conns = Arc::clone(&active_conns);
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let req = req.map(|body| body.boxed());
                    Ok::<_, Infallible>(pipeline.dispatch(req, peer_addr).await)
                }
            });

            let mut builder = auto::Builder::new(TokioExecutor::new());
            builder.http1().keep_alive(true);
            let conn = builder.serve_connection_with_upgrades(io, svc);
            tokio::pin!(conn);

            let result = tokio::select! {
                r = conn.as_mut() => r,
                _ = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.as_mut().await
                }
            };
            if let Err(e) = result {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: proxy: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("gateway_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: proxy: waiting for active connections, active={}", active);
        let drain = async {
            while active_conns.load(Ordering::Relaxed) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(drain_timeout, drain).await {
            Ok(_) => info!("server: proxy: all connections drained"),
            Err(_) => info!(
                "server: proxy: drain timeout, timeout_secs={}, remaining={}",
                drain_timeout.as_secs(),
                active_conns.load(Ordering::Relaxed)
            ),
        }
    }

    Ok(())
}

/// Serve health, readiness, metrics and route listings until `shutdown` fires.
pub async fn run_admin_server(
    listener: TcpListener,
    state: GatewayState,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("server: admin listening, addr={}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            result = listener.accept() => result?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let resp = handle_admin(req, &state);
                async move { Ok::<_, Infallible>(resp) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
