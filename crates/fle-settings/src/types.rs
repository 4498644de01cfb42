//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a settings file only needs the
//! keys it wants to change.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Deployment environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development: request tracing enabled.
    #[default]
    Development,
    /// Production deployment.
    Production,
    /// Automated tests.
    Test,
}

impl Environment {
    /// Wire name of the environment.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum log level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Normal operation.
    #[default]
    Info,
    /// Recoverable problems.
    Warn,
    /// Failures.
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FleSettings {
    /// Deployment environment.
    pub environment: Environment,
    /// HTTP listener settings.
    pub server: ServerSettings,
    /// Per-connection transport settings.
    pub websocket: WebSocketSettings,
    /// Session registry settings.
    pub session: SessionSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port. `0` asks the OS for a free port.
    pub port: u16,
    /// Origin allowed by the CORS layer.
    pub cors_origin: String,
    /// Upgrade requests beyond this many live connections are refused.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            cors_origin: "http://localhost:3000".to_string(),
            max_connections: 1000,
        }
    }
}

/// Per-connection transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// Socket read buffer size in bytes.
    pub read_buffer_size: usize,
    /// Socket write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_size: usize,
    /// Capacity of each connection's outbound queue.
    pub send_queue_capacity: usize,
    /// Writer heartbeat period in seconds.
    pub heartbeat_interval_secs: u64,
    /// Read deadline in seconds, renewed by every liveness frame.
    pub pong_wait_secs: u64,
    /// Upper bound on a single socket write, in seconds.
    pub write_wait_secs: u64,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024,
            write_buffer_size: 1024,
            max_message_size: 512,
            send_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            pong_wait_secs: 60,
            write_wait_secs: 10,
        }
    }
}

impl WebSocketSettings {
    /// Writer heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Read deadline window.
    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Per-write timeout.
    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }
}

/// Session registry settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a session expires, in seconds.
    pub timeout_secs: u64,
    /// Extra code-generation attempts after the first collision.
    pub max_retries: u32,
    /// Period of the background expiry sweep, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            max_retries: 10,
            cleanup_interval_secs: 600,
        }
    }
}

impl SessionSettings {
    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sweep period.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Logging settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Minimum level.
    pub level: LogLevel,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl FleSettings {
    /// `host:port` string suitable for binding.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Whether the server runs in development mode.
    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    /// Check cross-field and range constraints.
    ///
    /// `server.port` may be `0` only in the test environment.
    pub fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.host.trim().is_empty() {
            return Err(invalid("server.host must not be empty"));
        }
        if server.port == 0 && self.environment != Environment::Test {
            return Err(invalid("server.port must be between 1 and 65535"));
        }
        if server.cors_origin.trim().is_empty() {
            return Err(invalid("server.corsOrigin must not be empty"));
        }
        if server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be positive"));
        }

        let ws = &self.websocket;
        for (name, value) in [
            ("websocket.readBufferSize", ws.read_buffer_size),
            ("websocket.writeBufferSize", ws.write_buffer_size),
            ("websocket.maxMessageSize", ws.max_message_size),
            ("websocket.sendQueueCapacity", ws.send_queue_capacity),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{name} must be positive")));
            }
        }
        for (name, value) in [
            ("websocket.heartbeatIntervalSecs", ws.heartbeat_interval_secs),
            ("websocket.pongWaitSecs", ws.pong_wait_secs),
            ("websocket.writeWaitSecs", ws.write_wait_secs),
            ("session.timeoutSecs", self.session.timeout_secs),
            ("session.cleanupIntervalSecs", self.session.cleanup_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{name} must be positive")));
            }
        }
        if ws.heartbeat_interval_secs >= ws.pong_wait_secs {
            return Err(invalid(
                "websocket.heartbeatIntervalSecs must be shorter than websocket.pongWaitSecs",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults() {
        let s = FleSettings::default();
        assert_eq!(s.environment, Environment::Development);
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.server.cors_origin, "http://localhost:3000");
        assert_eq!(s.server.max_connections, 1000);
        assert_eq!(s.websocket.max_message_size, 512);
        assert_eq!(s.websocket.send_queue_capacity, 256);
        assert_eq!(s.websocket.pong_wait(), Duration::from_secs(60));
        assert_eq!(s.session.timeout(), Duration::from_secs(3600));
        assert_eq!(s.logging.level, LogLevel::Info);
        assert!(!s.logging.json);
    }

    #[test]
    fn address_joins_host_and_port() {
        let mut s = FleSettings::default();
        s.server.host = "127.0.0.1".into();
        s.server.port = 9000;
        assert_eq!(s.address(), "127.0.0.1:9000");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(FleSettings::default()).unwrap();
        assert_eq!(json["server"]["corsOrigin"], "http://localhost:3000");
        assert_eq!(json["websocket"]["sendQueueCapacity"], 256);
        assert_eq!(json["environment"], "development");
        assert_eq!(json["logging"]["level"], "info");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: FleSettings =
            serde_json::from_str(r#"{"server": {"port": 9999}, "environment": "production"}"#)
                .unwrap();
        assert_eq!(s.server.port, 9999);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.environment, Environment::Production);
        assert!(!s.is_development());
    }

    #[test]
    fn unknown_environment_rejected() {
        let result = serde_json::from_str::<FleSettings>(r#"{"environment": "staging"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn port_zero_only_in_test_environment() {
        let mut s = FleSettings::default();
        s.server.port = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
        s.environment = Environment::Test;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn empty_host_rejected() {
        let mut s = FleSettings::default();
        s.server.host = "  ".into();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("server.host"));
    }

    #[test]
    fn zero_buffer_rejected() {
        let mut s = FleSettings::default();
        s.websocket.read_buffer_size = 0;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("readBufferSize"));
    }

    #[test]
    fn heartbeat_must_beat_pong_wait() {
        let mut s = FleSettings::default();
        s.websocket.heartbeat_interval_secs = 60;
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(m)) if m.contains("heartbeat"));
    }

    #[test]
    fn display_names() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(LogLevel::Warn.to_string(), "warn");
    }
}
