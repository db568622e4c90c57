//! `conveyor-dispatch config`: view, validate and create conveyor.toml.

use std::path::Path;

use anyhow::Result;

use conveyor_dispatch::config::{ConveyorToml, ENV_DB_PATH, ENV_GATEWAY_URL};

use crate::ConfigCommands;

fn print_config(toml: &ConveyorToml) {
    println!("[gateway]");
    println!("  url = \"{}\"", toml.gateway.url);
    println!("  request_timeout_ms = {}", toml.gateway.request_timeout_ms);
    println!();
    println!("[dispatcher]");
    println!("  intake_checkpoint = {}", toml.dispatcher.intake_checkpoint);
    println!("  unload_checkpoint = {}", toml.dispatcher.unload_checkpoint);
    println!("  poll_interval_ms = {}", toml.dispatcher.poll_interval_ms);
    println!("  sensor_timeout_secs = {}", toml.dispatcher.sensor_timeout_secs);
    println!("  intake_timeout_secs = {}", toml.dispatcher.intake_timeout_secs);
    println!();
    println!("[storage]");
    println!("  db_path = \"{}\"", toml.storage.db_path.display());
    println!("  dwell_time_secs = {}", toml.storage.dwell_time_secs);
    println!();
    println!("[server]");
    println!("  host = \"{}\"", toml.server.host);
    println!("  port = {}", toml.server.port);
    println!("  cors = {}", toml.server.cors);
    println!();
    println!("[simulator]");
    println!("  checkpoints = {:?}", toml.simulator.checkpoints);
    println!();
    println!("[logging]");
    println!("  format = \"{}\"", toml.logging.format);
    println!("  filter = \"{}\"", toml.logging.filter);
    println!();
}

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conveyor Configuration");
            println!("======================");
            println!();

            let mut toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConveyorToml::load(config_path)?
            } else {
                println!("No config file at {}, using defaults.", config_path.display());
                ConveyorToml::default()
            };
            println!();

            let overridden: Vec<&str> = [ENV_GATEWAY_URL, ENV_DB_PATH]
                .into_iter()
                .filter(|var| std::env::var(var).is_ok_and(|v| !v.is_empty()))
                .collect();
            toml.apply_env();
            print_config(&toml);

            if !overridden.is_empty() {
                println!("Environment overrides applied: {}", overridden.join(", "));
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ConveyorToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            ConveyorToml::default().save(config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [gateway] url of the conveyor controller");
            println!("  - [dispatcher] intake/unload checkpoints and sensor timeouts");
            println!("  - [storage] database path and dwell time");
            println!();
        }
    }

    Ok(())
}
