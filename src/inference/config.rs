//! Provider endpoint configuration.

use std::time::Duration;

use serde::Deserialize;

use super::errors::ProviderError;

/// Where and how to reach the OpenAI-compatible endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// e.g. `http://localhost:11434/v1`. `/chat/completions` is appended.
    pub base_url: String,
    pub model: String,
    /// Sent as a bearer token when present and non-empty.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_request_timeout_secs() -> u64 {
    120
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The bearer key, ignoring blanks left by unset `${VAR}` references.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    /// `{base_url}/chat/completions`, tolerating a trailing slash.
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ProviderError::ConfigError {
                reason: format!("base_url must be an http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.model.trim().is_empty() {
            return Err(ProviderError::ConfigError {
                reason: "model must not be empty".into(),
            });
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_yaml() {
        let config: ProviderConfig = serde_yaml::from_str(
            "base_url: http://localhost:11434/v1/\nmodel: qwen2.5\napi_key: ''\n",
        )
        .unwrap();
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.request_timeout(), Duration::from_secs(120));
        assert!(config.api_key().is_none());
        assert_eq!(config.completions_url(), "http://localhost:11434/v1/chat/completions");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url_and_model() {
        assert!(ProviderConfig::new("localhost:8080", "m").validate().is_err());
        assert!(ProviderConfig::new("http://localhost:8080", " ").validate().is_err());
    }
}
