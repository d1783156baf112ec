//! Sync engine configuration.
//!
//! Every tunable the engine relies on lives in `SyncSettings`; nothing is
//! hardcoded in the components themselves. Values come from defaults and can be
//! overridden through `STRIDE_*` environment variables.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::normalize_text_option;

const MAX_RESEND_WINDOW_MS: u64 = 600_000;
const MAX_CLOUD_BATCH_SIZE: usize = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// How a received goals snapshot is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GoalsReplaceMode {
    /// Replace the whole local map with the received one
    #[default]
    Replace,
    /// Overwrite received keys, keep local keys the sender did not mention
    Merge,
}

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Resend-suppression window for the outbound agent
    pub resend_window: Duration,
    /// Upper bound on one direct delivery attempt
    pub direct_timeout: Duration,
    /// Max entities per atomic cloud batch write
    pub cloud_batch_size: usize,
    pub goals_mode: GoalsReplaceMode,
    /// Session UI tick period
    pub ui_tick: Duration,
    /// Session telemetry sample period
    pub sample_interval: Duration,
    /// Stamped on captured changes as their origin
    pub device_name: String,
    /// Max history rows read per capture pass
    pub capture_limit: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            resend_window: Duration::from_secs(5),
            direct_timeout: Duration::from_secs(10),
            cloud_batch_size: 50,
            goals_mode: GoalsReplaceMode::Replace,
            ui_tick: Duration::from_millis(100),
            sample_interval: Duration::from_secs(5),
            device_name: "local".to_string(),
            capture_limit: 1_000,
        }
    }
}

impl SyncSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let resend_window_ms = optional_u64(&lookup, "STRIDE_RESEND_WINDOW_MS")?
            .unwrap_or_else(|| duration_ms(defaults.resend_window));
        if resend_window_ms > MAX_RESEND_WINDOW_MS {
            return Err(ConfigError::Invalid(format!(
                "STRIDE_RESEND_WINDOW_MS must be in [0, {MAX_RESEND_WINDOW_MS}]"
            )));
        }

        let direct_timeout_ms = optional_u64(&lookup, "STRIDE_DIRECT_TIMEOUT_MS")?
            .unwrap_or_else(|| duration_ms(defaults.direct_timeout));
        if !(100..=120_000).contains(&direct_timeout_ms) {
            return Err(ConfigError::Invalid(
                "STRIDE_DIRECT_TIMEOUT_MS must be in [100, 120000]".to_string(),
            ));
        }

        let cloud_batch_size = optional_u64(&lookup, "STRIDE_CLOUD_BATCH_SIZE")?
            .map_or(Ok(defaults.cloud_batch_size), |value| {
                usize::try_from(value).map_err(|_| {
                    ConfigError::Invalid("STRIDE_CLOUD_BATCH_SIZE is out of range".to_string())
                })
            })?;
        if !(1..=MAX_CLOUD_BATCH_SIZE).contains(&cloud_batch_size) {
            return Err(ConfigError::Invalid(format!(
                "STRIDE_CLOUD_BATCH_SIZE must be in [1, {MAX_CLOUD_BATCH_SIZE}]"
            )));
        }

        let goals_mode = match optional_trimmed(&lookup, "STRIDE_GOALS_MODE").as_deref() {
            None | Some("replace") => GoalsReplaceMode::Replace,
            Some("merge") => GoalsReplaceMode::Merge,
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "STRIDE_GOALS_MODE must be 'replace' or 'merge', got '{other}'"
                )))
            }
        };

        let ui_tick_ms = optional_u64(&lookup, "STRIDE_UI_TICK_MS")?
            .unwrap_or_else(|| duration_ms(defaults.ui_tick));
        let sample_interval_ms = optional_u64(&lookup, "STRIDE_SAMPLE_INTERVAL_MS")?
            .unwrap_or_else(|| duration_ms(defaults.sample_interval));
        if ui_tick_ms == 0 || sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "session intervals must be greater than zero".to_string(),
            ));
        }

        let device_name =
            optional_trimmed(&lookup, "STRIDE_DEVICE_NAME").unwrap_or(defaults.device_name);

        Ok(Self {
            resend_window: Duration::from_millis(resend_window_ms),
            direct_timeout: Duration::from_millis(direct_timeout_ms),
            cloud_batch_size,
            goals_mode,
            ui_tick: Duration::from_millis(ui_tick_ms),
            sample_interval: Duration::from_millis(sample_interval_ms),
            device_name,
            capture_limit: defaults.capture_limit,
        })
    }

    #[must_use]
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    #[must_use]
    pub fn with_resend_window(mut self, window: Duration) -> Self {
        self.resend_window = window;
        self
    }
}

fn optional_trimmed(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn optional_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<u64>, ConfigError> {
    optional_trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ConfigError::Invalid(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = SyncSettings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.resend_window, Duration::from_secs(5));
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = SyncSettings::from_lookup(lookup_from(&[
            ("STRIDE_RESEND_WINDOW_MS", "250"),
            ("STRIDE_CLOUD_BATCH_SIZE", "10"),
            ("STRIDE_GOALS_MODE", "merge"),
            ("STRIDE_DEVICE_NAME", " watch "),
        ]))
        .unwrap();

        assert_eq!(settings.resend_window, Duration::from_millis(250));
        assert_eq!(settings.cloud_batch_size, 10);
        assert_eq!(settings.goals_mode, GoalsReplaceMode::Merge);
        assert_eq!(settings.device_name, "watch");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SyncSettings::from_lookup(lookup_from(&[("STRIDE_CLOUD_BATCH_SIZE", "0")])).is_err());
        assert!(SyncSettings::from_lookup(lookup_from(&[("STRIDE_GOALS_MODE", "sometimes")])).is_err());
        assert!(SyncSettings::from_lookup(lookup_from(&[("STRIDE_RESEND_WINDOW_MS", "-5")])).is_err());
        assert!(SyncSettings::from_lookup(lookup_from(&[("STRIDE_UI_TICK_MS", "0")])).is_err());
    }
}
