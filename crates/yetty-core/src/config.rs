//! Terminal configuration: YAML file plus environment overrides.
//!
//! Values are looked up by dotted path (`streaming.shm-size`); any key can
//! be overridden with a `YETTY_`-prefixed environment variable where dots
//! and dashes become underscores (`YETTY_STREAMING_SHM_SIZE`). Lookups never
//! fail: callers supply the default.

use rustc_hash::FxHashMap;
use serde_yml::Value;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "YETTY_";

// Keys the core consults.
pub const KEY_STREAMING_ENABLED: &str = "streaming.enabled";
pub const KEY_STREAMING_SHM_SIZE: &str = "streaming.shm-size";
pub const KEY_RENDERING_SHOW_FPS: &str = "rendering.show-fps";
pub const KEY_SCROLLBACK_LINES: &str = "scrollback.lines";

/// Default shared-memory region size (16 MiB).
pub const DEFAULT_SHM_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct Config {
    root: Value,
    env: FxHashMap<String, String>,
}

impl Config {
    /// Empty configuration (defaults everywhere, env still applies).
    pub fn new() -> Self {
        Self {
            root: Value::Null,
            env: collect_env(),
        }
    }

    /// Load from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// Parse from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let root: Value = serde_yml::from_str(text)
            .map_err(|e| Error::InvalidArgument(format!("config: {e}")))?;
        Ok(Self {
            root,
            env: collect_env(),
        })
    }

    pub fn get_bool(&self, path: &str, default: bool) -> bool {
        if let Some(raw) = self.env_override(path) {
            return match raw.as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    warn!(path, value = other, "unparseable boolean override");
                    default
                }
            };
        }
        self.node(path).and_then(Value::as_bool).unwrap_or(default)
    }

    pub fn get_u64(&self, path: &str, default: u64) -> u64 {
        if let Some(raw) = self.env_override(path) {
            return raw.parse().unwrap_or_else(|_| {
                warn!(path, value = %raw, "unparseable integer override");
                default
            });
        }
        self.node(path).and_then(Value::as_u64).unwrap_or(default)
    }

    pub fn get_str(&self, path: &str, default: &str) -> String {
        if let Some(raw) = self.env_override(path) {
            return raw;
        }
        self.node(path)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn has(&self, path: &str) -> bool {
        self.env_override(path).is_some() || self.node(path).is_some()
    }

    // Convenience accessors for the keys the core consults.

    pub fn streaming_enabled(&self) -> bool {
        self.get_bool(KEY_STREAMING_ENABLED, true)
    }

    pub fn streaming_shm_size(&self) -> u64 {
        self.get_u64(KEY_STREAMING_SHM_SIZE, DEFAULT_SHM_SIZE)
    }

    pub fn show_fps(&self) -> bool {
        self.get_bool(KEY_RENDERING_SHOW_FPS, false)
    }

    pub fn scrollback_lines(&self) -> u64 {
        self.get_u64(KEY_SCROLLBACK_LINES, 10_000)
    }

    fn node(&self, path: &str) -> Option<&Value> {
        let mut node = &self.root;
        for part in path.split('.') {
            node = node.get(part)?;
        }
        if node.is_null() {
            None
        } else {
            Some(node)
        }
    }

    fn env_override(&self, path: &str) -> Option<String> {
        let key = path_to_env_var(path);
        let value = self.env.get(&key)?;
        debug!(path, %key, "config env override");
        Some(value.clone())
    }
}

/// `streaming.shm-size` -> `YETTY_STREAMING_SHM_SIZE`
fn path_to_env_var(path: &str) -> String {
    let mut key = String::with_capacity(ENV_PREFIX.len() + path.len());
    key.push_str(ENV_PREFIX);
    for c in path.chars() {
        key.push(match c {
            '.' | '-' => '_',
            other => other.to_ascii_uppercase(),
        });
    }
    key
}

fn collect_env() -> FxHashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}
