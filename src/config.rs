//! Configuration for the conveyor dispatcher.
//!
//! Settings are read from `conveyor.toml`, then environment variables, then
//! CLI flags (each layer overriding the previous). Every field has a default,
//! so a missing file or a partial one is fine.
//!
//! # Configuration File Format
//!
//! ```toml
//! [gateway]
//! url = "http://localhost:5000/api/v1/conveyor/"
//! request_timeout_ms = 5000
//!
//! [dispatcher]
//! intake_checkpoint = 1
//! unload_checkpoint = 4
//! poll_interval_ms = 100
//! sensor_timeout_secs = 60
//! intake_timeout_secs = 600
//!
//! [storage]
//! db_path = ".conveyor/carriers.db"
//! dwell_time_secs = 20.0
//!
//! [server]
//! host = "127.0.0.1"
//! port = 5001
//! cors = false
//!
//! [simulator]
//! checkpoints = [1, 2, 3, 4]
//!
//! [logging]
//! format = "pretty"
//! filter = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::dispatch::models::CheckpointId;
use crate::dispatch::orchestrator::DispatcherConfig;
use crate::telemetry::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "conveyor.toml";

pub const ENV_GATEWAY_URL: &str = "CONVEYOR_GATEWAY_URL";
pub const ENV_DB_PATH: &str = "CONVEYOR_DB_PATH";

/// Remote conveyor controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_gateway_url() -> String {
    "http://localhost:5000/api/v1/conveyor/".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_intake_checkpoint")]
    pub intake_checkpoint: CheckpointId,
    #[serde(default = "default_unload_checkpoint")]
    pub unload_checkpoint: CheckpointId,
    /// Sensor polling interval
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for any sensor wait inside a move
    #[serde(default = "default_sensor_timeout_secs")]
    pub sensor_timeout_secs: u64,
    /// Deadline for storage to deliver a carrier on intake
    #[serde(default = "default_intake_timeout_secs")]
    pub intake_timeout_secs: u64,
}

fn default_intake_checkpoint() -> CheckpointId {
    1
}

fn default_unload_checkpoint() -> CheckpointId {
    4
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_sensor_timeout_secs() -> u64 {
    60
}

fn default_intake_timeout_secs() -> u64 {
    600
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            intake_checkpoint: default_intake_checkpoint(),
            unload_checkpoint: default_unload_checkpoint(),
            poll_interval_ms: default_poll_interval_ms(),
            sensor_timeout_secs: default_sensor_timeout_secs(),
            intake_timeout_secs: default_intake_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Time storage needs to lift a carrier off the unload checkpoint
    #[serde(default = "default_dwell_time_secs")]
    pub dwell_time_secs: f64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".conveyor/carriers.db")
}

fn default_dwell_time_secs() -> f64 {
    20.0
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            dwell_time_secs: default_dwell_time_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5001
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors: false,
        }
    }
}

/// Simulated conveyor used by `serve --simulate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSection {
    #[serde(default = "default_sim_checkpoints")]
    pub checkpoints: Vec<CheckpointId>,
}

fn default_sim_checkpoints() -> Vec<CheckpointId> {
    vec![1, 2, 3, 4]
}

impl Default for SimulatorSection {
    fn default() -> Self {
        Self {
            checkpoints: default_sim_checkpoints(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

/// Parsed `conveyor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConveyorToml {
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub simulator: SimulatorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl ConveyorToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conveyor.toml")
    }

    /// Load from `path`, or fall back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conveyor.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `CONVEYOR_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var(ENV_GATEWAY_URL).ok(),
            std::env::var(ENV_DB_PATH).ok(),
        );
    }

    fn apply_overrides(&mut self, gateway_url: Option<String>, db_path: Option<String>) {
        if let Some(url) = gateway_url.filter(|u| !u.is_empty()) {
            self.gateway.url = url;
        }
        if let Some(path) = db_path.filter(|p| !p.is_empty()) {
            self.storage.db_path = PathBuf::from(path);
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.request_timeout_ms)
    }

    /// Dwell time, clamped to zero when the file holds a negative or
    /// non-finite value (`validate` reports those).
    pub fn dwell_time(&self) -> Duration {
        Duration::try_from_secs_f64(self.storage.dwell_time_secs).unwrap_or(Duration::ZERO)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            intake_checkpoint: self.dispatcher.intake_checkpoint,
            unload_checkpoint: self.dispatcher.unload_checkpoint,
            poll_interval: Duration::from_millis(self.dispatcher.poll_interval_ms),
            sensor_timeout: Duration::from_secs(self.dispatcher.sensor_timeout_secs),
            intake_timeout: Duration::from_secs(self.dispatcher.intake_timeout_secs),
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.dispatcher.poll_interval_ms == 0 {
            warnings.push("poll_interval_ms is 0: sensor waits will spin".to_string());
        }
        if self.dispatcher.sensor_timeout_secs == 0 {
            warnings.push("sensor_timeout_secs is 0: every sensor wait fails at once".to_string());
        }
        if !self.storage.dwell_time_secs.is_finite() || self.storage.dwell_time_secs < 0.0 {
            warnings.push(format!(
                "dwell_time_secs {} is invalid: must be a non-negative number",
                self.storage.dwell_time_secs
            ));
        }
        if self.dispatcher.intake_checkpoint == self.dispatcher.unload_checkpoint {
            warnings.push(format!(
                "intake and unload share checkpoint {}",
                self.dispatcher.intake_checkpoint
            ));
        }
        if self.simulator.checkpoints.is_empty() {
            warnings.push("simulator.checkpoints is empty".to_string());
        } else {
            for (name, id) in [
                ("intake_checkpoint", self.dispatcher.intake_checkpoint),
                ("unload_checkpoint", self.dispatcher.unload_checkpoint),
            ] {
                if !self.simulator.checkpoints.contains(&id) {
                    warnings.push(format!(
                        "{} {} is not in simulator.checkpoints {:?}",
                        name, id, self.simulator.checkpoints
                    ));
                }
            }
        }
        if !self.gateway.url.starts_with("http://") && !self.gateway.url.starts_with("https://") {
            warnings.push(format!(
                "gateway.url '{}' is not an http(s) URL",
                self.gateway.url
            ));
        }

        warnings
    }
}
