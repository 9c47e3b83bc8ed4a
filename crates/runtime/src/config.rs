//! Runtime configuration.
//!
//! Settings come from a TOML document, from `MRT_*` environment variables, or
//! from the builder methods on [`RuntimeConfig`]. Later sources override
//! earlier ones when applied in that order.

use serde_derive::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Report every thread's whole stack conservatively instead of precisely.
pub const ENV_CONSERVATIVE_STACK: &str = "MRT_CONSERVATIVE_STACK";
/// Spin count of the module list's reader/writer lock.
pub const ENV_RWLOCK_SPIN_COUNT: &str = "MRT_RWLOCK_SPIN_COUNT";
/// Initial backoff between suspension rounds, in microseconds.
pub const ENV_SUSPEND_BACKOFF_US: &str = "MRT_SUSPEND_BACKOFF_US";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse runtime configuration")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}

/// Global runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuntimeConfig {
    conservative_stack_reporting: bool,
    rwlock_spin_count: u32,
    suspend_backoff_us: u64,
    suspend_backoff_max_us: u64,
}

impl Default for RuntimeConfig {
    fn default() -> RuntimeConfig {
        RuntimeConfig {
            conservative_stack_reporting: false,
            rwlock_spin_count: 1000,
            suspend_backoff_us: 100,
            suspend_backoff_max_us: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml(text: &str) -> Result<RuntimeConfig, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<RuntimeConfig, ConfigError> {
        let mut config = RuntimeConfig::default();
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Override settings with the variables `lookup` knows about.
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(value) = lookup(ENV_CONSERVATIVE_STACK) {
            self.conservative_stack_reporting = match value.trim() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: ENV_CONSERVATIVE_STACK,
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup(ENV_RWLOCK_SPIN_COUNT) {
            self.rwlock_spin_count = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_RWLOCK_SPIN_COUNT,
                value: value.clone(),
            })?;
        }
        if let Some(value) = lookup(ENV_SUSPEND_BACKOFF_US) {
            self.suspend_backoff_us = value.trim().parse().map_err(|_| ConfigError::Env {
                var: ENV_SUSPEND_BACKOFF_US,
                value: value.clone(),
            })?;
        }
        Ok(self)
    }

    /// Report whole stacks conservatively during GC root enumeration.
    pub fn conservative_stack_reporting(&mut self, enable: bool) -> &mut Self {
        self.conservative_stack_reporting = enable;
        self
    }

    pub fn rwlock_spin_count(&mut self, count: u32) -> &mut Self {
        self.rwlock_spin_count = count;
        self
    }

    /// Wait between suspension rounds, doubling each round up to `max`.
    pub fn suspend_backoff(&mut self, initial: Duration, max: Duration) -> &mut Self {
        self.suspend_backoff_us = u64::try_from(initial.as_micros()).unwrap_or(u64::MAX);
        self.suspend_backoff_max_us = u64::try_from(max.as_micros()).unwrap_or(u64::MAX);
        self
    }

    pub fn is_conservative_stack_reporting(&self) -> bool {
        self.conservative_stack_reporting
    }

    pub fn get_rwlock_spin_count(&self) -> u32 {
        self.rwlock_spin_count
    }

    pub fn initial_suspend_backoff(&self) -> Duration {
        Duration::from_micros(self.suspend_backoff_us)
    }

    pub fn max_suspend_backoff(&self) -> Duration {
        Duration::from_micros(self.suspend_backoff_max_us.max(self.suspend_backoff_us))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = RuntimeConfig::new();
        assert!(!config.is_conservative_stack_reporting());
        assert_eq!(config.get_rwlock_spin_count(), 1000);
        assert_eq!(config.initial_suspend_backoff(), Duration::from_micros(100));
    }

    #[test]
    fn toml_overrides_some_keys() {
        let config = RuntimeConfig::from_toml(
            r#"
            conservative-stack-reporting = true
            suspend-backoff-us = 5
            "#,
        )
        .unwrap();
        assert!(config.is_conservative_stack_reporting());
        assert_eq!(config.initial_suspend_backoff(), Duration::from_micros(5));
        assert_eq!(config.get_rwlock_spin_count(), 1000);
    }

    #[test]
    fn toml_rejects_unknown_keys() {
        let err = RuntimeConfig::from_toml("spin = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn environment_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_CONSERVATIVE_STACK, "1"),
            (ENV_RWLOCK_SPIN_COUNT, " 20 "),
        ]
        .into_iter()
        .collect();
        let mut config = RuntimeConfig::new();
        config
            .apply_env(|var| env.get(var).map(|v| v.to_string()))
            .unwrap();
        assert!(config.is_conservative_stack_reporting());
        assert_eq!(config.get_rwlock_spin_count(), 20);
    }

    #[test]
    fn environment_rejects_garbage() {
        let err = RuntimeConfig::new()
            .apply_env(|var| (var == ENV_SUSPEND_BACKOFF_US).then(|| "soon".to_string()))
            .unwrap_err();
        match err {
            ConfigError::Env { var, value } => {
                assert_eq!(var, ENV_SUSPEND_BACKOFF_US);
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = RuntimeConfig::new();
        config
            .conservative_stack_reporting(true)
            .suspend_backoff(Duration::from_micros(7), Duration::from_millis(1));
        let text = toml::to_string(&config).unwrap();
        assert_eq!(RuntimeConfig::from_toml(&text).unwrap(), config);
    }
}
