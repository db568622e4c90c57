use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::events;
use super::gateway::{HardwareGateway, HttpGateway};
use super::orchestrator::{Dispatcher, DispatcherConfig};
use super::simulator::SimulatedConveyor;
use super::store::{CarrierStore, StoreHandle};
use crate::dispatch::models::CheckpointId;

/// Which conveyor the server drives.
#[derive(Debug, Clone)]
pub enum GatewayMode {
    Http {
        base_url: String,
        request_timeout: Duration,
    },
    Simulated {
        checkpoints: Vec<CheckpointId>,
    },
}

/// Configuration for the dispatcher server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dwell_time: Duration,
    pub cors: bool,
    pub gateway: GatewayMode,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5001,
            db_path: PathBuf::from(".conveyor/carriers.db"),
            dwell_time: Duration::from_secs(20),
            cors: false,
            gateway: GatewayMode::Http {
                base_url: "http://localhost:5000/api/v1/conveyor/".to_string(),
                request_timeout: Duration::from_secs(5),
            },
            dispatcher: DispatcherConfig::default(),
        }
    }
}

/// Build the full application router: API routes plus the event socket.
pub fn build_router(state: Arc<AppState>) -> Router {
    let events_tx = state.events_tx.clone();

    api::api_router()
        .route(
            "/ws",
            get(move |ws_upgrade| events::ws_handler_with_sender(ws_upgrade, events_tx)),
        )
        .with_state(state)
}

/// Wire gateway, store and dispatcher together into shared state.
pub async fn build_state(config: &ServerConfig) -> Result<Arc<AppState>> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let store = CarrierStore::open(&config.db_path).context("Failed to open carrier store")?;
    store
        .set_dwell_time(config.dwell_time)
        .context("Failed to record dwell time")?;
    let store = StoreHandle::new(store);

    let (gateway, simulator): (Arc<dyn HardwareGateway>, Option<Arc<SimulatedConveyor>>) =
        match &config.gateway {
            GatewayMode::Http {
                base_url,
                request_timeout,
            } => {
                let http = HttpGateway::new(base_url.clone(), *request_timeout)?;
                info!(base_url = http.base_url(), ?request_timeout, "driving conveyor over HTTP");
                let gateway: Arc<dyn HardwareGateway> = Arc::new(http);
                (gateway, None)
            }
            GatewayMode::Simulated { checkpoints } => {
                warn!(?checkpoints, "driving a simulated conveyor");
                let sim = Arc::new(SimulatedConveyor::new(checkpoints.clone()));
                let gateway: Arc<dyn HardwareGateway> = sim.clone();
                (gateway, Some(sim))
            }
        };

    let dispatcher = Dispatcher::new(gateway, store, config.dispatcher.clone())
        .await
        .context("Failed to initialise dispatcher")?;
    let (events_tx, _rx) = broadcast::channel::<String>(256);

    Ok(Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        events_tx,
        simulator,
    }))
}

/// Start the dispatcher server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config).await?;
    let topology = state.dispatcher.topology();
    info!(
        ring = ?topology.checkpoints(),
        intake = state.dispatcher.config().intake_checkpoint,
        unload = state.dispatcher.config().unload_checkpoint,
        "dispatcher ready"
    );

    let mut app = build_router(state);
    if config.cors {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(%local_addr, "conveyor dispatcher listening");
    println!("Conveyor dispatcher running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C, shutting down");
    }
    println!("\nShutting down...");
}
