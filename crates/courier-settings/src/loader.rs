//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COURIER_*` environment variable overrides
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::CourierSettings;

/// Resolve the settings file path: `COURIER_SETTINGS_PATH`, or
/// `~/.courier/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("COURIER_SETTINGS_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; a file with invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: CourierSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
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

/// Apply `COURIER_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides_from(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides_from(settings: &mut CourierSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("COURIER_LOG_FORMAT") {
        match serde_json::from_value(Value::String(v.clone())) {
            Ok(format) => settings.logging.format = format,
            Err(_) => tracing::warn!(key = "COURIER_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }

    // ── TCP ─────────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_TCP_HOST") {
        settings.tcp.host = v;
    }
    if let Some(v) = env.u16("COURIER_TCP_PORT", 0, 65535) {
        settings.tcp.port = v;
    }
    if let Some(v) = env.u64("COURIER_TCP_RETRY_ATTEMPTS", 0, u64::from(u32::MAX)) {
        settings.tcp.retry_attempts = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("COURIER_TCP_RETRY_DELAY", 0, 3_600_000) {
        settings.tcp.retry_delay = v;
    }

    // ── AMQP ────────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_AMQP_URLS") {
        settings.amqp.urls = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
    }
    if let Some(v) = env.string("COURIER_AMQP_QUEUE") {
        settings.amqp.queue = v;
    }
    if let Some(v) = env.bool("COURIER_AMQP_NO_ACK") {
        settings.amqp.no_ack = v;
    }
    if let Some(v) = env.u16("COURIER_AMQP_PREFETCH_COUNT", 0, u16::MAX) {
        settings.amqp.prefetch_count = v;
    }
    if let Some(v) = env.bool("COURIER_AMQP_WILDCARDS") {
        settings.amqp.wildcards = v;
    }
    if let Some(v) = env.i32("COURIER_AMQP_MAX_CONNECTION_ATTEMPTS", -1, i32::MAX) {
        settings.amqp.max_connection_attempts = v;
    }

    // ── gRPC ────────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_GRPC_URL") {
        settings.grpc.url = v;
    }
    if let Some(v) = env.bool("COURIER_GRPC_GRACEFUL_SHUTDOWN") {
        settings.grpc.graceful_shutdown = v;
    }
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

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as an `i32` within a range.
pub fn parse_i32_range(val: &str, min: i32, max: i32) -> Option<i32> {
    let n: i32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn i32(&self, name: &str, min: i32, max: i32) -> Option<i32> {
        self.parsed(name, "i32", |v| parse_i32_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
