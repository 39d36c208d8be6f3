// SPDX-License-Identifier: MIT
// Daemon and provider configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Which completion backend to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Inline,
    Fim,
    Sweep,
    Zeta,
}

impl std::str::FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inline" => Ok(Self::Inline),
            "fim" => Ok(Self::Fim),
            "sweep" => Ok(Self::Sweep),
            "zeta" => Ok(Self::Zeta),
            other => anyhow::bail!("unsupported provider type: {other}"),
        }
    }
}

pub const DEFAULT_API_KEY_ENV: &str = "SWEEP_AI_TOKEN";
pub const DEFAULT_COMPLETION_PATH: &str = "/v1/completions";

/// Provider connection and sampling settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderConfig {
    pub provider_url: String,
    pub completion_path: String,
    pub provider_model: String,
    pub provider_temperature: f64,
    /// Max tokens to generate; doubles as the input window budget.
    pub provider_max_tokens: usize,
    pub provider_top_k: usize,
    pub api_key: String,
    /// Environment variable consulted when `api_key` is empty.
    pub api_key_env: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_url: "http://localhost:8000".into(),
            completion_path: DEFAULT_COMPLETION_PATH.into(),
            provider_model: String::new(),
            provider_temperature: 0.2,
            provider_max_tokens: 1000,
            provider_top_k: 0,
            api_key: String::new(),
            api_key_env: DEFAULT_API_KEY_ENV.into(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from config or the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if !self.api_key.is_empty() {
            return Some(self.api_key.clone());
        }
        std::env::var(self.api_key_env_name())
            .ok()
            .filter(|v| !v.is_empty())
    }

    pub fn api_key_env_name(&self) -> &str {
        if self.api_key_env.is_empty() {
            DEFAULT_API_KEY_ENV
        } else {
            &self.api_key_env
        }
    }
}

/// Cursor prediction (and therefore staging) behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CursorPredictionConfig {
    pub enabled: bool,
    /// Advance to the next stage automatically after a tab-accept.
    pub auto_advance: bool,
    /// Max line gap between changes grouped into one stage.
    pub proximity_threshold: usize,
    /// Distance at which a prefetched completion is shown directly instead
    /// of a cursor prediction.
    pub dist_threshold: usize,
}

impl Default for CursorPredictionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_advance: true,
            proximity_threshold: 3,
            dist_threshold: 10,
        }
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    pub provider_type: ProviderKind,
    pub provider: ProviderConfig,
    #[serde(with = "duration_ms")]
    pub completion_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub idle_completion_delay: Duration,
    #[serde(with = "duration_ms")]
    pub text_change_debounce: Duration,
    pub cursor_prediction: CursorPredictionConfig,
    pub log: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderKind::Fim,
            provider: ProviderConfig::default(),
            completion_timeout: Duration::from_secs(5),
            idle_completion_delay: Duration::from_millis(500),
            text_change_debounce: Duration::from_millis(150),
            cursor_prediction: CursorPredictionConfig::default(),
            log: "info".into(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a JSON file, falling back to defaults for any
    /// omitted field.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
