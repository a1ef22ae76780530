//! Configuration for the deep-research orchestrator.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment. Configuration is loaded from
//! `~/.config/deepresearch/config.toml` and/or `.deepresearch/config.toml`
//! in the working directory, with `DEEPRESEARCH_`-prefixed environment
//! variables taking precedence.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Policy applied when a `start` call exceeds the background-unit cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Queue the unit; it begins polling once a slot frees up.
    #[default]
    Queue,
    /// Reject the submission with a capacity error.
    Reject,
}

/// Top-level configuration for the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchConfig {
    pub provider: ProviderConfig,
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

/// Remote deep-research provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Default model identifier submitted with each query.
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the provider API.
    pub base_url: Option<String>,
    /// Cost per 1M input tokens (USD).
    pub input_cost_per_million: f64,
    /// Cost per 1M output tokens (USD).
    pub output_cost_per_million: f64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "deep-research-pro-preview".to_string(),
            api_key_env: "DEEPRESEARCH_API_KEY".to_string(),
            base_url: None,
            input_cost_per_million: 1.0,
            output_cost_per_million: 4.0,
        }
    }
}

/// Lifecycle-engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock window `start` waits for a synchronous completion.
    pub sync_budget_secs: u64,
    /// Sleep between background provider polls.
    pub poll_interval_secs: u64,
    /// Default for the per-task `max_wait_hours` bound (1..=24).
    pub default_max_wait_hours: u32,
    /// Maximum simultaneous background polling units.
    pub max_background_tasks: usize,
    /// What to do with submissions beyond the cap.
    pub overflow_policy: OverflowPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_budget_secs: 30,
            poll_interval_secs: 10,
            default_max_wait_hours: 8,
            max_background_tasks: 3,
            overflow_policy: OverflowPolicy::Queue,
        }
    }
}

/// Durable state and report output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the embedded SQLite database.
    pub db_path: PathBuf,
    /// Default directory for exported markdown reports.
    pub output_dir: PathBuf,
    /// Minimum free disk space required before writing a report (bytes).
    pub min_free_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("deep_research.db"),
            output_dir: PathBuf::from("./research_reports"),
            min_free_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `DEEPRESEARCH_`)
/// 2. Workspace-local config (`.deepresearch/config.toml`)
/// 3. User config (`~/.config/deepresearch/config.toml`)
/// 4. Built-in defaults
pub fn load_config(workspace: Option<&Path>) -> Result<ResearchConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(ResearchConfig::default()));

    if let Some(dirs) = directories::ProjectDirs::from("dev", "deepresearch", "deepresearch") {
        let user_config = dirs.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".deepresearch").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // DEEPRESEARCH_ENGINE__SYNC_BUDGET_SECS, DEEPRESEARCH_PROVIDER__MODEL, etc.
    figment = figment.merge(Env::prefixed("DEEPRESEARCH_").split("__"));

    figment.extract().map_err(Box::new)
}
