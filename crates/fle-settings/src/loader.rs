//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`FleSettings::default()`]
//! 2. If a settings file is given and exists, deep-merge its values over defaults
//! 3. Apply `FLE_*` environment variable overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::cell::RefCell;
use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::FleSettings;

/// Load settings without a file: defaults plus environment overrides.
pub fn load_settings() -> Result<FleSettings> {
    load_settings_from_path(None)
}

/// An override value that failed to parse or fell outside its range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOverride {
    /// Variable name, e.g. `FLE_PORT`.
    pub key: String,
    /// The value as given.
    pub value: String,
    /// What the variable expects.
    pub expected: &'static str,
}

impl fmt::Display for RejectedOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={:?} is not a valid {}", self.key, self.value, self.expected)
    }
}

/// Load settings from an optional JSON file with env var overrides.
///
/// A missing file falls back to defaults. Invalid JSON or a failed
/// validation is an error. Rejected env values are logged and ignored.
pub fn load_settings_from_path(path: Option<&Path>) -> Result<FleSettings> {
    let (settings, rejected) = load_settings_reporting(path)?;
    for rejected in &rejected {
        warn!(key = %rejected.key, value = %rejected.value, expected = rejected.expected, "invalid env var, ignoring");
    }
    Ok(settings)
}

/// Same as [`load_settings_from_path`], but hands rejected env values back
/// instead of logging them, for callers that install logging afterwards.
pub fn load_settings_reporting(path: Option<&Path>) -> Result<(FleSettings, Vec<RejectedOverride>)> {
    let defaults = serde_json::to_value(FleSettings::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "settings file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut settings: FleSettings = serde_json::from_value(merged)?;
    let rejected = apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok((settings, rejected))
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut FleSettings) -> Vec<RejectedOverride> {
    apply_overrides(settings, |name| std::env::var(name).ok())
}

/// Apply overrides read through `lookup`.
///
/// Empty values are treated as unset. Values that fail to parse or fall
/// outside their range are ignored, keeping the file/default value, and
/// returned to the caller.
pub fn apply_overrides(
    settings: &mut FleSettings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<RejectedOverride> {
    let env = EnvReader {
        lookup,
        rejected: RefCell::new(Vec::new()),
    };

    // ── Environment / logging ───────────────────────────────────────
    if let Some(v) = env.enumeration("FLE_ENV") {
        settings.environment = v;
    }
    if let Some(v) = env.enumeration("FLE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.boolean("FLE_LOG_JSON") {
        settings.logging.json = v;
    }

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("FLE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("FLE_PORT", parse_u16_range, (1, u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("FLE_CORS_ORIGIN") {
        settings.server.cors_origin = v;
    }
    if let Some(v) = env.parsed("FLE_MAX_CONNECTIONS", parse_usize_range, (1, 1_000_000)) {
        settings.server.max_connections = v;
    }

    // ── WebSocket ───────────────────────────────────────────────────
    let ws = &mut settings.websocket;
    if let Some(v) = env.parsed("FLE_WS_READ_BUFFER_SIZE", parse_usize_range, (1, 1 << 24)) {
        ws.read_buffer_size = v;
    }
    if let Some(v) = env.parsed("FLE_WS_WRITE_BUFFER_SIZE", parse_usize_range, (1, 1 << 24)) {
        ws.write_buffer_size = v;
    }
    if let Some(v) = env.parsed("FLE_WS_MAX_MESSAGE_SIZE", parse_usize_range, (1, 1 << 26)) {
        ws.max_message_size = v;
    }
    if let Some(v) = env.parsed("FLE_WS_SEND_QUEUE_CAPACITY", parse_usize_range, (1, 1 << 20)) {
        ws.send_queue_capacity = v;
    }
    if let Some(v) = env.parsed("FLE_HEARTBEAT_INTERVAL", parse_u64_range, (1, 3600)) {
        ws.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.parsed("FLE_PONG_WAIT", parse_u64_range, (1, 3600)) {
        ws.pong_wait_secs = v;
    }
    if let Some(v) = env.parsed("FLE_WRITE_WAIT", parse_u64_range, (1, 3600)) {
        ws.write_wait_secs = v;
    }

    // ── Session ─────────────────────────────────────────────────────
    let session = &mut settings.session;
    if let Some(v) = env.parsed("FLE_SESSION_TIMEOUT", parse_u64_range, (1, 31_536_000)) {
        session.timeout_secs = v;
    }
    if let Some(v) = env.parsed("FLE_SESSION_MAX_RETRIES", parse_u32_range, (0, 1000)) {
        session.max_retries = v;
    }
    if let Some(v) = env.parsed("FLE_SESSION_CLEANUP_INTERVAL", parse_u64_range, (1, 86_400)) {
        session.cleanup_interval_secs = v;
    }

    env.rejected.into_inner()
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Lookup wrapper ──────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
    rejected: RefCell<Vec<RejectedOverride>>,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name)
    }

    fn reject(&self, name: &str, value: String, expected: &'static str) {
        self.rejected.borrow_mut().push(RejectedOverride {
            key: name.to_string(),
            value,
            expected,
        });
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let val = self.raw(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            self.reject(name, val, "boolean");
        }
        result
    }

    fn parsed<T, P>(&self, name: &str, parse: P, (min, max): (T, T)) -> Option<T>
    where
        P: Fn(&str, T, T) -> Option<T>,
    {
        let val = self.raw(name)?;
        let result = parse(val.trim(), min, max);
        if result.is_none() {
            self.reject(name, val, "number in range");
        }
        result
    }

    /// Lowercase serde enum such as `Environment` or `LogLevel`.
    fn enumeration<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let val = self.raw(name)?;
        let result = serde_json::from_value(Value::String(val.trim().to_lowercase())).ok();
        if result.is_none() {
            self.reject(name, val, "variant");
        }
        result
    }
}
