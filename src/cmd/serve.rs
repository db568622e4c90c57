//! `conveyor-dispatch serve`: run the dispatcher HTTP server.

use anyhow::Result;

use conveyor_dispatch::config::ConveyorToml;
use conveyor_dispatch::dispatch::server::{GatewayMode, ServerConfig, start_server};

pub async fn cmd_serve(
    config: &ConveyorToml,
    port: Option<u16>,
    host: Option<String>,
    simulate: bool,
    dev: bool,
) -> Result<()> {
    for warning in config.validate() {
        tracing::warn!(%warning, "configuration warning");
    }

    let gateway = if simulate {
        GatewayMode::Simulated {
            checkpoints: config.simulator.checkpoints.clone(),
        }
    } else {
        GatewayMode::Http {
            base_url: config.gateway.url.clone(),
            request_timeout: config.request_timeout(),
        }
    };

    // --dev binds all interfaces unless --host is given.
    let host = match host {
        Some(host) => host,
        None if dev => "0.0.0.0".to_string(),
        None => config.server.host.clone(),
    };

    start_server(ServerConfig {
        host,
        port: port.unwrap_or(config.server.port),
        db_path: config.storage.db_path.clone(),
        dwell_time: config.dwell_time(),
        cors: config.server.cors || dev,
        gateway,
        dispatcher: config.dispatcher_config(),
    })
    .await
}
