//! Application configuration.
//!
//! One YAML file with three sections: `backend`, `provider` and an optional
//! `orchestrator`. String values may reference environment variables as
//! `${VAR}` or `${VAR:-default}`; a leading `~` in paths is expanded.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::OrchestratorConfig;
use crate::inference::ProviderConfig;
use crate::mcp_client::BackendConfig;

/// File name searched for when no explicit path is given.
pub const CONFIG_FILE_NAME: &str = "mcp-orchestrator.yaml";

/// Env var that points at a config file.
pub const CONFIG_ENV_VAR: &str = "MCP_ORCHESTRATOR_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find {CONFIG_FILE_NAME} (set {CONFIG_ENV_VAR} or pass --config)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

impl AppConfig {
    /// Parse config from YAML text, interpolating env vars first.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Self::parse(raw, "<inline>")
    }

    fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: AppConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                path: origin.to_string(),
                reason: e.to_string(),
            })?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.backend.command = expand_tilde(&self.backend.command);
        for arg in &mut self.backend.args {
            *arg = expand_tilde(arg);
        }
        if let Some(cwd) = self.backend.cwd.as_mut() {
            *cwd = expand_tilde(cwd);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                reason: "backend.command is empty".into(),
            });
        }
        if self.backend.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                reason: "backend.max_concurrency must be at least 1".into(),
            });
        }
        if self.orchestrator.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                reason: "orchestrator.max_iterations must be at least 1".into(),
            });
        }
        self.provider.validate().map_err(|e| ConfigError::Invalid {
            reason: e.to_string(),
        })
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Order: `explicit`, then `MCP_ORCHESTRATOR_CONFIG`, then an upward search
/// from `start` for `mcp-orchestrator.yaml`.
pub fn find_config_path(explicit: Option<&Path>, start: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
        tracing::warn!(path = %candidate.display(), "{CONFIG_ENV_VAR} points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Ok(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    Err(ConfigError::NotFound)
}

/// Read and parse a config file.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let config = AppConfig::parse(&raw, &path.display().to_string())?;
    tracing::info!(
        path = %path.display(),
        backend = %config.backend.command,
        model = %config.provider.model,
        "config loaded"
    );
    Ok(config)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. Unset without a default resolves to "".
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
