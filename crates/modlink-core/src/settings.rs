//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow for one section (`client`, `server`, ...):
//! 1. Start with the compiled `Default` of the section type
//! 2. If the settings file exists, deep-merge its section over the defaults
//! 3. Apply `MODLINK_*` environment overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

/// Environment variable naming an explicit settings file.
pub const SETTINGS_PATH_ENV: &str = "MODLINK_SETTINGS";

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// Failed to read the settings file.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse or map the settings JSON.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Section types that accept environment overrides.
pub trait EnvOverrides {
    /// Overwrite fields from `MODLINK_*` variables.
    fn apply_env_overrides(&mut self);
}

/// Settings file path: `$MODLINK_SETTINGS`, else `~/.modlink/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = read_env_string(SETTINGS_PATH_ENV) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".modlink").join("settings.json")
}

/// Load `section` from the default settings path.
pub fn load_section<T>(section: &str) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned + EnvOverrides,
{
    load_section_from_path(&settings_path(), section)
}

/// Load `section` from `path`.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_section_from_path<T>(path: &Path, section: &str) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned + EnvOverrides,
{
    let defaults = serde_json::to_value(T::default())?;

    let merged = if path.exists() {
        debug!(?path, section, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let mut user: Value = serde_json::from_str(&content)?;
        match user.get_mut(section).map(Value::take) {
            Some(overrides) => deep_merge(defaults, overrides),
            None => defaults,
        }
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: T = serde_json::from_value(merged)?;
    settings.apply_env_overrides();
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

// ── Pure parsing functions (testable without env vars) ──────────────

/// Parse a `u64` within `min..=max`.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a `usize` within `min..=max`.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers ─────────────────────────────────────────────────

/// Non-empty string variable.
pub fn read_env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Ranged `u64` variable; invalid values are ignored with a warning.
pub fn read_env_u64(name: &str, min: u64, max: u64) -> Option<u64> {
    let val = std::env::var(name).ok()?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

/// Ranged `usize` variable; invalid values are ignored with a warning.
pub fn read_env_usize(name: &str, min: usize, max: usize) -> Option<usize> {
    let val = std::env::var(name).ok()?;
    let result = parse_usize_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid usize env var, ignoring");
    }
    result
}

// ── Tests ───────────────────────────────────────────────────────────
