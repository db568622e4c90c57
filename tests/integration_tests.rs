//! Integration tests for the conveyor-dispatch CLI
//!
//! These run the built binary against throwaway directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a conveyor-dispatch Command rooted in `dir`
fn conveyor(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conveyor-dispatch");
    cmd.current_dir(dir.path())
        .env_remove("CONVEYOR_GATEWAY_URL")
        .env_remove("CONVEYOR_DB_PATH")
        .env_remove("CONVEYOR_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = temp_dir();
        conveyor(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        let dir = temp_dir();
        conveyor(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_serve_help_lists_simulate() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--simulate"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = temp_dir();
        conveyor(&dir).arg("teleport").assert().failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_writes_defaults() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        let content = fs::read_to_string(dir.path().join("conveyor.toml")).unwrap();
        assert!(content.contains("[gateway]"));
        assert!(content.contains("[dispatcher]"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = temp_dir();
        fs::write(dir.path().join("conveyor.toml"), "[server]\nport = 6000\n").unwrap();

        conveyor(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("conveyor.toml")).unwrap();
        assert!(content.contains("6000"));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("intake_checkpoint = 1"));
    }

    #[test]
    fn test_config_show_reads_custom_path() {
        let dir = temp_dir();
        let path = dir.path().join("plant").join("line-a.toml");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "[dispatcher]\nunload_checkpoint = 7\n").unwrap();

        conveyor(&dir)
            .args(["config", "show", "--config"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("unload_checkpoint = 7"));
    }

    #[test]
    fn test_config_show_applies_env_override() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["config", "show"])
            .env("CONVEYOR_GATEWAY_URL", "http://plc.local:9000/api/")
            .assert()
            .success()
            .stdout(predicate::str::contains("http://plc.local:9000/api/"))
            .stdout(predicate::str::contains("CONVEYOR_GATEWAY_URL"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("conveyor.toml"),
            "[dispatcher]\nintake_checkpoint = 2\nunload_checkpoint = 2\npoll_interval_ms = 0\n",
        )
        .unwrap();

        conveyor(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"));
    }

    #[test]
    fn test_config_validate_clean_file() {
        let dir = temp_dir();
        conveyor(&dir).args(["config", "init"]).assert().success();
        conveyor(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = temp_dir();
        fs::write(dir.path().join("conveyor.toml"), "[dispatcher\n").unwrap();

        conveyor(&dir).args(["config", "validate"]).assert().failure();
    }
}

// =============================================================================
// Store Command Tests
// =============================================================================

mod store_commands {
    use super::*;

    #[test]
    fn test_init_creates_database() {
        let dir = temp_dir();
        let db = dir.path().join("data").join("carriers.db");

        conveyor(&dir)
            .arg("init")
            .arg("--db-path")
            .arg(&db)
            .assert()
            .success()
            .stdout(predicate::str::contains("Carrier store initialized"));

        assert!(db.exists());
    }

    #[test]
    fn test_init_uses_configured_dwell_time() {
        let dir = temp_dir();
        fs::write(
            dir.path().join("conveyor.toml"),
            "[storage]\ndb_path = \"line.db\"\ndwell_time_secs = 3.5\n",
        )
        .unwrap();

        conveyor(&dir)
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("dwell time: 3.5s"));

        assert!(dir.path().join("line.db").exists());
    }

    #[test]
    fn test_status_without_store_fails() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["status", "--db-path", "missing.db"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("conveyor-dispatch init"));
    }

    #[test]
    fn test_status_on_fresh_store() {
        let dir = temp_dir();
        conveyor(&dir)
            .args(["init", "--db-path", "carriers.db"])
            .assert()
            .success();

        conveyor(&dir)
            .args(["status", "--db-path", "carriers.db"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Conveyor Status"))
            .stdout(predicate::str::contains("No checkpoints registered"))
            .stdout(predicate::str::contains("No carriers on the conveyor"));
    }
}
