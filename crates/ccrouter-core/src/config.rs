//! Router configuration, loaded once at startup.
//!
//! The JSON file accepts both snake_case and the capitalized keys used
//! by existing configs (`Providers`, `Router`, `APIKEY`).

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(
        "no Gemini API key found. Set the GEMINI_API_KEY environment variable, store one with \
         `security add-generic-password -s claude-code-router -a gemini-api-key -w <key>`, or put \
         api_key in the provider config"
    )]
    MissingGeminiApiKey,
    #[error("provider {0} has no api_key configured")]
    MissingProviderApiKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Gemini,
    Openai,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub name: String,
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_provider_kind() -> ProviderKind {
    ProviderKind::Openai
}

/// Routing rules as `"provider,model"` strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouterRules {
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub think: Option<String>,
    #[serde(default)]
    pub long_context: Option<String>,
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: u64,
    #[serde(default)]
    pub web_search: Option<String>,
}

fn default_long_context_threshold() -> u64 {
    60_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Optional static shared secret required from callers.
    #[serde(default, alias = "APIKEY")]
    pub api_key: Option<String>,
    #[serde(default, alias = "PROXY_URL")]
    pub https_proxy: Option<String>,
    #[serde(default, alias = "Providers")]
    pub providers: Vec<ProviderEntry>,
    #[serde(default, alias = "Router")]
    pub router: RouterRules,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3456
}

impl RouterConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: RouterConfig = serde_json::from_str(&raw)?;
        if config.https_proxy.is_none() {
            config.https_proxy = std::env::var("HTTPS_PROXY")
                .ok()
                .filter(|value| !value.is_empty());
        }
        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderEntry> {
        self.providers.iter().find(|entry| entry.name == name)
    }
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CCR_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".claude-code-router")
        .join("config.json")
}
