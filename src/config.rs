use crate::error::{Result, ScraperError};
use serde::Deserialize;
use std::fs;
use std::path::Path;

const CONFIG_PATH: &str = "config.toml";

/// Immutable process configuration: endpoint bases, timeouts, pacing and the
/// storage location come from an optional `config.toml`; credentials come
/// from the environment. Loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database_path: String,
    pub search: SearchConfig,
    pub endpoints: EndpointConfig,
    pub timeouts: TimeoutConfig,
    pub pipeline: PipelineConfig,
    pub llm: LlmConfig,
    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search results page the scraper reads. The site paginates through
    /// query parameters, so one URL describes one saved search.
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub rdw_base: String,
    pub anwb_base: String,
    pub finnik_base: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub page_seconds: u64,
    pub registry_seconds: u64,
    pub valuation_seconds: u64,
    pub llm_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pause between listings to stay under third-party rate limits.
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
}

/// Credentials supplied out-of-band via the process environment.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub llm_api_key: Option<String>,
    pub session_cookie: Option<String>,
}

impl Secrets {
    fn from_env() -> Self {
        Self {
            llm_api_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            session_cookie: std::env::var("GASPEDAAL_COOKIE").ok(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "data/occasions.db".to_string(),
            search: SearchConfig::default(),
            endpoints: EndpointConfig::default(),
            timeouts: TimeoutConfig::default(),
            pipeline: PipelineConfig::default(),
            llm: LlmConfig::default(),
            secrets: Secrets::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: "https://www.gaspedaal.nl/toyota/corolla/stationwagon?brnst=25&bmin=2020&pmax=20000&kmax=120000&srt=df-a".to_string(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            rdw_base: "https://opendata.rdw.nl".to_string(),
            anwb_base: "https://api.anwb.nl/car-information/backend-application/api/v0"
                .to_string(),
            finnik_base: "https://finnik.nl".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            page_seconds: 15,
            registry_seconds: 10,
            valuation_seconds: 15,
            llm_seconds: 60,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { delay_ms: 2000 }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            base_url: "https://api.deepseek.com".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut config = if Path::new(CONFIG_PATH).exists() {
            let config_content = fs::read_to_string(CONFIG_PATH).map_err(|e| {
                ScraperError::Config(format!(
                    "Failed to read config file '{CONFIG_PATH}': {e}"
                ))
            })?;
            toml::from_str(&config_content)?
        } else {
            Config::default()
        };

        config.secrets = Secrets::from_env();
        Ok(config)
    }

    /// The normalize pipeline cannot run without an LLM credential.
    pub fn require_llm_api_key(&self) -> Result<&str> {
        self.secrets
            .llm_api_key
            .as_deref()
            .ok_or_else(|| ScraperError::Config("DEEPSEEK_API_KEY not set".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_section() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.timeouts.registry_seconds, 10);
        assert_eq!(config.pipeline.delay_ms, 2000);
        assert!(config.endpoints.rdw_base.starts_with("https://opendata.rdw.nl"));
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let config: Config = toml::from_str(
            r#"
            database_path = "/tmp/test.db"

            [pipeline]
            delay_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path, "/tmp/test.db");
        assert_eq!(config.pipeline.delay_ms, 50);
        assert_eq!(config.llm.model, "deepseek-chat");
    }
}
