//! chatline - conversational message delivery engine
//!
//! Per-conversation outgoing queues drained by single-flight processors,
//! with streamed responses assembled into observable transcripts.

mod api;
mod assembler;
mod backend;
mod config;
mod error;
mod queue;
mod runtime;
mod state_machine;
mod transcript;
mod transport;

use api::{create_router, AppState};
use backend::{Backend, HttpBackend, SimulatedBackend, SocketBackend};
use config::{BackendKind, EngineConfig};
use runtime::RuntimeManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::TransportConnection;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chatline=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = EngineConfig::from_env();

    // The socket transport outlives the router so it can be closed on exit
    let mut transport = None;
    let backend: Arc<dyn Backend> = match &config.backend {
        BackendKind::Simulated => {
            tracing::warn!("No live backend configured, answering with the simulated responder");
            Arc::new(SimulatedBackend::new(config.chunking))
        }
        BackendKind::Http { url } => {
            tracing::info!(url = %url, "Using HTTP backend");
            Arc::new(HttpBackend::new(url, config.chunking)?)
        }
        BackendKind::Socket { url } => {
            tracing::info!(url = %url, "Using socket backend");
            let connection = TransportConnection::new(url.clone(), config.reconnect);
            connection.connect();
            transport = Some(Arc::clone(&connection));
            Arc::new(SocketBackend::spawn(connection))
        }
    };

    let state = AppState::new(RuntimeManager::new(backend, config.runtime));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("chatline server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(transport) = transport {
        transport.shutdown();
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
