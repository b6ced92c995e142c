//! Notifier configuration: defaults, YAML files and environment overrides.

use crate::desktop::DesktopEnvironment;
use crate::error::{LockwatchError, LockwatchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const ENV_BUFFER: &str = "LOCKWATCH_BUFFER";
pub const ENV_STOP_TIMEOUT_MS: &str = "LOCKWATCH_STOP_TIMEOUT_MS";
pub const ENV_QUERY_TIMEOUT_MS: &str = "LOCKWATCH_QUERY_TIMEOUT_MS";
pub const ENV_EMIT_INITIAL: &str = "LOCKWATCH_EMIT_INITIAL";
pub const ENV_DESKTOP: &str = "LOCKWATCH_DESKTOP";

/// Tunables for a [`Notifier`](crate::Notifier) and its platform adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Recommended capacity of the output channel.
    pub buffer: usize,
    /// How long an adapter may take to leave its native wait before the
    /// execution context is forcibly terminated.
    pub stop_timeout_ms: u64,
    /// Upper bound for a single state query.
    pub query_timeout_ms: u64,
    /// Emit the current state as the first event of a subscription.
    pub emit_initial_state: bool,
    /// Desktop name override; `XDG_CURRENT_DESKTOP` is used when unset.
    pub desktop: Option<String>,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            buffer: 10,
            stop_timeout_ms: 2000,
            query_timeout_ms: 2000,
            emit_initial_state: true,
            desktop: None,
        }
    }
}

impl NotifierConfig {
    /// Parse a YAML document; missing keys keep their defaults.
    pub fn from_yaml_str(content: &str) -> LockwatchResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file.
    pub fn load(path: impl AsRef<Path>) -> LockwatchResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LockwatchError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_yaml_str(&content)?;
        debug!(?path, "Loaded notifier config");
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> LockwatchResult<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `LOCKWATCH_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> LockwatchResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_BUFFER) {
            self.buffer = parse_env(ENV_BUFFER, &value)?;
        }
        if let Some(value) = lookup(ENV_STOP_TIMEOUT_MS) {
            self.stop_timeout_ms = parse_env(ENV_STOP_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_QUERY_TIMEOUT_MS) {
            self.query_timeout_ms = parse_env(ENV_QUERY_TIMEOUT_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_EMIT_INITIAL) {
            self.emit_initial_state = parse_bool(ENV_EMIT_INITIAL, &value)?;
        }
        if let Some(value) = lookup(ENV_DESKTOP) {
            if value.trim().is_empty() {
                warn!("{} is set but empty, ignoring", ENV_DESKTOP);
            } else {
                self.desktop = Some(value);
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> LockwatchResult<()> {
        if self.buffer == 0 {
            return Err(LockwatchError::Config(
                "buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// The configured desktop, falling back to `XDG_CURRENT_DESKTOP`.
    pub fn desktop_environment(&self) -> DesktopEnvironment {
        match &self.desktop {
            Some(name) => DesktopEnvironment::from_name(name),
            None => DesktopEnvironment::detect(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> LockwatchResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| LockwatchError::Config(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> LockwatchResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(LockwatchError::Config(format!(
            "{key}={value:?}: expected a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = NotifierConfig::default();
        assert_eq!(config.buffer, 10);
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
        assert!(config.emit_initial_state);
        assert!(config.desktop.is_none());
    }

    #[test]
    fn test_yaml_partial_keeps_defaults() {
        let config = NotifierConfig::from_yaml_str("buffer: 32\ndesktop: KDE\n").unwrap();
        assert_eq!(config.buffer, 32);
        assert_eq!(config.stop_timeout_ms, 2000);
        assert_eq!(config.desktop_environment(), DesktopEnvironment::Kde);
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let err = NotifierConfig::from_yaml_str("buffer: 0").unwrap_err();
        assert!(matches!(err, LockwatchError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_BUFFER, "64"),
            (ENV_STOP_TIMEOUT_MS, "500"),
            (ENV_EMIT_INITIAL, "off"),
            (ENV_DESKTOP, "X-Cinnamon"),
        ]);
        let mut config = NotifierConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.buffer, 64);
        assert_eq!(config.stop_timeout(), Duration::from_millis(500));
        assert!(!config.emit_initial_state);
        assert_eq!(config.desktop_environment(), DesktopEnvironment::Cinnamon);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = NotifierConfig::default();
        let err = config
            .apply_env(|key| (key == ENV_BUFFER).then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_BUFFER));
    }
}
