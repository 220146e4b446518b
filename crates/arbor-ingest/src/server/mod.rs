//! HTTP surface: stage functions, queue operations and maintenance.

mod cors;
mod error;
mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, Request};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::pipeline::Pipeline;
use crate::queue::QueueCoordinator;
use crate::reconciler::OrphanReconciler;

pub use cors::build_cors_layer;
pub use error::ApiError;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub reconciler: Arc<OrphanReconciler>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, reconciler: Arc<OrphanReconciler>) -> Self {
        Self {
            pipeline,
            reconciler,
        }
    }

    fn coordinator(&self) -> &QueueCoordinator {
        self.pipeline.coordinator()
    }
}

pub fn build_api_router(state: AppState, config: &ServerConfig) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = request
                .extensions()
                .get::<MatchedPath>()
                .map(|p| p.as_str().to_string())
                .unwrap_or_else(|| request.uri().path().to_string());
            tracing::info_span!("http.request", method = %request.method(), path = %path)
        })
        .on_response(|response: &Response, latency: Duration, span: &tracing::Span| {
            let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
            tracing::debug!(parent: span, status = response.status().as_u16(), latency_ms, "request handled");
        })
        .on_failure(|error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
            let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
            tracing::error!(parent: span, latency_ms, error = %error, "request failed");
        });

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/functions/ocr-extract", post(handlers::ocr_extract))
        .route("/functions/translate-chunk", post(handlers::translate_chunk))
        .route("/functions/extract-structured", post(handlers::extract_structured))
        .route("/queue/batches", post(handlers::create_batch))
        .route("/queue/batches/{id}", get(handlers::get_batch))
        .route("/queue/batches/{id}/stats", get(handlers::batch_stats))
        .route("/queue/batches/{id}/retry-errors", post(handlers::retry_errors))
        .route("/queue/batches/{id}/force-restart", post(handlers::force_restart))
        .route("/queue/batches/{id}/restart", post(handlers::restart_batch))
        .route("/queue/stats", get(handlers::global_stats))
        .route("/queue/pages/{id}/retry", post(handlers::retry_page))
        .route("/queue/pages/{id}/pause", post(handlers::pause_page))
        .route("/queue/pages/{id}/resume", post(handlers::resume_page))
        .route("/queue/pages/{id}/reprocess", post(handlers::reprocess_page))
        .route("/queue/process-next", post(handlers::process_next))
        .route("/maintenance/orphans", get(handlers::list_orphans))
        .route("/maintenance/orphans/cleanup", post(handlers::cleanup_orphans))
        .with_state(state)
        .layer(cors::build_cors_layer(config))
        .layer(middleware::from_fn(cors::preflight_no_content))
        .layer(trace_layer)
}

/// Serves until Ctrl+C or SIGTERM, then drains for at most ten seconds.
pub async fn serve(config: &ServerConfig, state: AppState) -> Result<(), ServerError> {
    let listen_addr = parse_listen_addr(&config.listen_addr)?;
    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "arbor-ingest server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);
    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_api_router(state, config);

    let mut server_future = Box::pin(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_future)
            .await
    });

    let mut drain_timeout = Box::pin(drain_timeout_future(shutdown_rx.clone()));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {}
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        let event = wait_for_shutdown().await;
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
