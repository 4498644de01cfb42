//! # fle
//!
//! FLE server binary: loads settings, starts the HTTP/WebSocket server, and
//! shuts down gracefully on ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fle_rpc::Router;
use fle_server::FleServer;
use fle_session::{SessionManager, SessionOptions};
use fle_settings::{Environment, FleSettings, RejectedOverride, apply_overrides, load_settings_reporting};
use tracing::{info, warn};

/// FLE WebSocket JSON-RPC server.
#[derive(Parser, Debug)]
#[command(name = "fle", about = "FLE WebSocket JSON-RPC server")]
struct Cli {
    /// JSON settings file. Missing files fall back to defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (overrides settings).
    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    port: Option<u16>,

    /// Minimum log level (overrides settings).
    #[arg(long, value_parser = ["debug", "info", "warn", "error"])]
    log_level: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    /// Settings from the file and environment, with CLI values on top.
    ///
    /// Rejected env values come back alongside so they can be logged once
    /// the subscriber is installed.
    fn settings(&self) -> Result<(FleSettings, Vec<RejectedOverride>)> {
        let (mut settings, mut rejected) = load_settings_reporting(self.config.as_deref())
            .context("Failed to load settings")?;
        rejected.extend(self.apply(&mut settings));
        settings.validate().context("Invalid settings")?;
        Ok((settings, rejected))
    }

    fn apply(&self, settings: &mut FleSettings) -> Vec<RejectedOverride> {
        apply_overrides(settings, |name| match name {
            "FLE_HOST" => self.host.clone(),
            "FLE_PORT" => self.port.map(|port| port.to_string()),
            "FLE_LOG_LEVEL" => self.log_level.clone(),
            "FLE_LOG_JSON" => self.json_logs.then(|| "true".to_string()),
            _ => None,
        })
    }
}

fn session_options(settings: &FleSettings) -> SessionOptions {
    SessionOptions {
        max_retries: settings.session.max_retries,
        timeout: settings.session.timeout(),
        ..SessionOptions::default()
    }
}

fn json_logs(settings: &FleSettings) -> bool {
    settings.logging.json || settings.environment == Environment::Production
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, rejected) = cli.settings()?;

    fle_core::logging::init_subscriber(settings.logging.level.as_str(), json_logs(&settings));
    for rejected in &rejected {
        warn!(key = %rejected.key, value = %rejected.value, expected = rejected.expected, "invalid override, ignoring");
    }

    let metrics = fle_server::metrics::install_recorder()
        .context("Failed to install metrics recorder")?;

    let sessions = Arc::new(SessionManager::with_cleanup_interval(
        session_options(&settings),
        settings.session.cleanup_interval(),
    ));

    let address = settings.address();
    let server = FleServer::new(settings, Router::new(), sessions, metrics)
        .context("Failed to build server")?;
    let addr = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!(%addr, methods = ?server.rpc_router().methods(), "fle server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("ctrl-c received");

    let _ = server.shutdown_gracefully().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fle_settings::LogLevel;
    use std::time::Duration;

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["fle"]);
        assert!(cli.config.is_none());
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.log_level.is_none());
        assert!(!cli.json_logs);
    }

    #[test]
    fn cli_all_flags() {
        let cli = Cli::parse_from([
            "fle",
            "--config",
            "/tmp/fle.json",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--log-level",
            "debug",
            "--json-logs",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/fle.json")));
        assert_eq!(cli.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(cli.port, Some(9000));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(cli.json_logs);
    }

    #[test]
    fn cli_rejects_port_zero() {
        assert!(Cli::try_parse_from(["fle", "--port", "0"]).is_err());
    }

    #[test]
    fn cli_rejects_unknown_log_level() {
        assert!(Cli::try_parse_from(["fle", "--log-level", "trace"]).is_err());
    }

    #[test]
    fn cli_values_override_settings() {
        let cli = Cli::parse_from([
            "fle",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
            "--log-level",
            "warn",
            "--json-logs",
        ]);
        let mut settings = FleSettings::default();
        assert!(cli.apply(&mut settings).is_empty());
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level, LogLevel::Warn);
        assert!(settings.logging.json);
        assert_eq!(settings.address(), "127.0.0.1:9000");
    }

    #[test]
    fn absent_flags_keep_settings() {
        let cli = Cli::parse_from(["fle"]);
        let mut settings = FleSettings::default();
        settings.server.port = 7000;
        settings.logging.json = true;
        assert!(cli.apply(&mut settings).is_empty());
        assert_eq!(settings.server.port, 7000);
        assert!(settings.logging.json);
    }

    #[test]
    fn settings_file_then_cli() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fle.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 8181, "maxConnections": 5}, "session": {"timeoutSecs": 120}}"#,
        )
        .unwrap();

        let cli = Cli::parse_from([
            "fle",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "8282",
        ]);
        let (settings, _rejected) = cli.settings().unwrap();
        assert_eq!(settings.server.port, 8282);
        assert_eq!(settings.server.max_connections, 5);
        assert_eq!(settings.session.timeout(), Duration::from_secs(120));
    }

    #[test]
    fn empty_host_flag_is_ignored() {
        let cli = Cli::parse_from(["fle", "--host", ""]);
        let mut settings = FleSettings::default();
        assert!(cli.apply(&mut settings).is_empty());
        assert_eq!(settings.server.host, "0.0.0.0");
    }

    #[test]
    fn session_options_follow_settings() {
        let mut settings = FleSettings::default();
        settings.session.timeout_secs = 90;
        settings.session.max_retries = 3;
        let options = session_options(&settings);
        assert_eq!(options.timeout, Duration::from_secs(90));
        assert_eq!(options.max_retries, 3);
        assert!(options.initial_data.is_empty());
    }

    #[test]
    fn production_forces_json_logs() {
        let mut settings = FleSettings::default();
        assert!(!json_logs(&settings));
        settings.environment = Environment::Production;
        assert!(json_logs(&settings));
    }
}
