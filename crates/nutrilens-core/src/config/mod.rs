use crate::error::{NutriLensError, Result};
use config::{Config, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutriLensConfig {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Food-log CRUD API (also serves `/login`, `/register` and, for the
/// `backend` analysis provider, `/analyze_food`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            timeout_secs: default_backend_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_analysis_provider")]
    pub provider: String,
    /// Overrides the provider's default endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_analysis_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_analysis_timeout")]
    pub timeout_secs: u64,
    /// Attach the depth buffer to requests for endpoints that accept it.
    #[serde(default = "default_true")]
    pub send_depth: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: default_analysis_provider(),
            base_url: None,
            model: default_analysis_model(),
            api_key: None,
            env_var: None,
            max_tokens: default_max_tokens(),
            timeout_secs: default_analysis_timeout(),
            send_depth: true,
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Where the bearer token is persisted. Defaults to `~/.config/nutrilens/token`.
    #[serde(default)]
    pub token_path: Option<String>,
}

impl SessionConfig {
    pub fn resolved_token_path(&self) -> Result<PathBuf> {
        match &self.token_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => config_dir().map(|d| d.join("token")),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// JSONL file holding entries whose remote persist has not succeeded yet.
    #[serde(default)]
    pub pending_path: Option<String>,
}

impl LogConfig {
    pub fn resolved_pending_path(&self) -> Result<PathBuf> {
        match &self.pending_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => config_dir().map(|d| d.join("pending.jsonl")),
        }
    }
}

/// Valid analysis provider names.
pub const VALID_ANALYSIS_PROVIDERS: &[&str] = &["backend", "openai"];

// -- Defaults --

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}
fn default_backend_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_analysis_provider() -> String {
    "backend".to_string()
}
fn default_analysis_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> usize {
    300
}
fn default_analysis_timeout() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

impl NutriLensConfig {
    /// Load configuration with three-layer TOML merge plus env overrides:
    /// 1. ~/.config/nutrilens/config.toml (global)
    /// 2. .nutrilens/config.toml (project)
    /// 3. .nutrilens/config.local.toml (local, gitignored)
    /// 4. `NUTRILENS_BACKEND_URL` / `NUTRILENS_ANALYSIS_URL`
    pub fn load(project_dir: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(global_path) = global_config_path() {
            if global_path.exists() {
                builder = builder.add_source(File::from(global_path).required(false));
            }
        }

        if let Some(dir) = project_dir {
            let project_config = dir.join(".nutrilens").join("config.toml");
            if project_config.exists() {
                builder = builder.add_source(File::from(project_config).required(false));
            }

            let local_config = dir.join(".nutrilens").join("config.local.toml");
            if local_config.exists() {
                builder = builder.add_source(File::from(local_config).required(false));
            }
        }

        let config = builder
            .build()
            .map_err(|e| NutriLensError::Config(e.to_string()))?;

        let mut cfg: Self = config
            .try_deserialize()
            .map_err(|e| NutriLensError::Config(e.to_string()))?;

        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate();
        Ok(cfg)
    }

    /// Defaults only (no files, no environment).
    pub fn default_config() -> Self {
        Self {
            backend: BackendConfig::default(),
            analysis: AnalysisConfig::default(),
            session: SessionConfig::default(),
            log: LogConfig::default(),
        }
    }

    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("NUTRILENS_BACKEND_URL").filter(|s| !s.is_empty()) {
            self.backend.base_url = url;
        }
        if let Some(url) = lookup("NUTRILENS_ANALYSIS_URL").filter(|s| !s.is_empty()) {
            self.analysis.base_url = Some(url);
        }
    }

    /// Validate config values, fixing what can be fixed and logging warnings.
    pub fn validate(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !VALID_ANALYSIS_PROVIDERS.contains(&self.analysis.provider.as_str()) {
            warnings.push(format!(
                "unknown analysis provider '{}', valid: {}",
                self.analysis.provider,
                VALID_ANALYSIS_PROVIDERS.join(", ")
            ));
        }

        if self.backend.base_url.trim().is_empty() {
            warnings.push(format!(
                "backend.base_url is empty, using {}",
                default_backend_url()
            ));
            self.backend.base_url = default_backend_url();
        }

        // Timeouts must be finite and non-zero
        let timeout_checks: Vec<(&str, &mut u64, u64)> = vec![
            (
                "backend.timeout_secs",
                &mut self.backend.timeout_secs,
                default_backend_timeout(),
            ),
            (
                "backend.connect_timeout_secs",
                &mut self.backend.connect_timeout_secs,
                default_connect_timeout(),
            ),
            (
                "analysis.timeout_secs",
                &mut self.analysis.timeout_secs,
                default_analysis_timeout(),
            ),
        ];
        for (name, val, fallback) in timeout_checks {
            if *val == 0 {
                warnings.push(format!("{name} = 0, setting to {fallback}"));
                *val = fallback;
            }
        }

        if self.analysis.max_tokens == 0 {
            warnings.push(format!(
                "analysis.max_tokens = 0, setting to {}",
                default_max_tokens()
            ));
            self.analysis.max_tokens = default_max_tokens();
        }

        for w in &warnings {
            tracing::warn!("config: {}", w);
        }

        warnings
    }
}

fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|p| p.join("nutrilens"))
        .ok_or_else(|| NutriLensError::Config("cannot determine config directory".to_string()))
}

fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("nutrilens").join("config.toml"))
}

/// Resolve an API key: check config field first, then environment variable.
pub fn resolve_api_key(config: &AnalysisConfig, default_env_var: &str) -> Result<String> {
    if let Some(ref key) = config.api_key {
        if !key.is_empty() {
            return Ok(key.clone());
        }
    }

    let env_var_name = config.env_var.as_deref().unwrap_or(default_env_var);

    std::env::var(env_var_name)
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            NutriLensError::Config(format!(
                "{} analysis provider requires an API key (set analysis.api_key or {})",
                config.provider, env_var_name
            ))
        })
}
