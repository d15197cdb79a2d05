use std::time::{Duration, Instant};

use axum::extract::Request;
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use eyre::WrapErr;
use observability::{ensure_request_id, Metrics, RequestId};
use oci::OciType;
use repo::Registry;
use terraform::TerraformType;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::load_configs;

/// In-flight requests get this long to finish after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(30);

pub async fn run(config_glob: &str) -> eyre::Result<()> {
    let config = load_configs(config_glob)
        .wrap_err("failed to load repository configurations")?;
    eyre::ensure!(
        !config.server.listeners.is_empty(),
        "no listeners configured"
    );

    let metrics = Metrics::new();
    let registry = Registry::new(metrics.clone());
    registry
        .must_register("docker|container", OciType::new(metrics.clone()))
        .await;
    registry
        .must_register("terraform|tofu|tofo", TerraformType::new(metrics.clone()))
        .await;

    let root = config
        .storage
        .build()
        .await
        .wrap_err("failed to connect to storage root")?;
    let router = registry
        .initialize(&root)
        .await
        .wrap_err("failed to initialize repository types")?;

    for repo_config in &config.repositories {
        registry.new_repository(repo_config).await.wrap_err_with(|| {
            format!("failed to create repository instance for {}", repo_config.name)
        })?;
    }

    let metrics_handle = metrics.clone();
    let app = router
        .route(
            "/metrics",
            get(move || {
                let metrics = metrics_handle.clone();
                async move {
                    (
                        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                        metrics.encode_text(),
                    )
                }
            }),
        )
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn(ensure_request_id))
        .layer(CatchPanicLayer::new());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut servers = Vec::new();
    for listener in &config.server.listeners {
        let tcp = TcpListener::bind(&listener.address)
            .await
            .wrap_err_with(|| format!("failed to bind {}", listener.address))?;
        tracing::info!(address = %listener.address, "listening");
        let app = app.clone();
        let mut shutdown = shutdown_rx.clone();
        servers.push(tokio::spawn(async move {
            axum::serve(tcp, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                })
                .await
        }));
    }

    shutdown_signal().await;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_DRAIN, futures::future::join_all(servers)).await {
        Ok(results) => {
            for result in results {
                result.wrap_err("server task panicked")?.wrap_err("serve")?;
            }
        }
        Err(_) => {
            tracing::warn!("drain window elapsed before all requests completed");
        }
    }
    Ok(())
}

/// Structured completion log for every request, joined on the request ID.
async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let req_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let duration = started.elapsed().as_secs_f64();
    match status / 100 {
        1 | 2 => {
            tracing::info!(req_id = %req_id, method = %method, url = %uri, status, duration, "request completed")
        }
        3 => {
            tracing::info!(req_id = %req_id, method = %method, url = %uri, status, duration, "request redirected")
        }
        4 => {
            tracing::warn!(req_id = %req_id, method = %method, url = %uri, status, duration, "client error")
        }
        5 => {
            tracing::error!(req_id = %req_id, method = %method, url = %uri, status, duration, "server error")
        }
        _ => {
            tracing::error!(req_id = %req_id, method = %method, url = %uri, status, duration, "unexpected status")
        }
    }
    response
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
