use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::batch::EngineConfig;
use crate::driver::{CheckpointConfig, OrderSiteConfig};
use crate::workflow::WorkflowConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Account API used by checkpoint batches. Checkpoint mode is
    /// unavailable without it.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    /// Storefront used by order batches. Order mode is unavailable
    /// without it.
    #[serde(default)]
    pub order: Option<OrderSiteConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8005
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("cartpilot.db")
}

/// Sanitized config for API responses (URL query strings stripped)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub workflow: WorkflowConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<SanitizedCheckpointConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<SanitizedOrderSiteConfig>,
}

/// Checkpoint config without query parameters, which may carry tokens.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCheckpointConfig {
    pub account_api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub home_url: Option<String>,
    pub request_timeout_secs: u64,
    pub inter_account_delay_ms: u64,
}

/// Order site config without query parameters.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedOrderSiteConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

fn strip_query(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or_default().to_string(),
    }
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            engine: config.engine.clone(),
            workflow: config.workflow.clone(),
            checkpoint: config
                .checkpoint
                .as_ref()
                .map(|c| SanitizedCheckpointConfig {
                    account_api_url: strip_query(&c.account_api_url),
                    home_url: c.home_url.as_deref().map(strip_query),
                    request_timeout_secs: c.request_timeout_secs,
                    inter_account_delay_ms: c.inter_account_delay_ms,
                }),
            order: config.order.as_ref().map(|o| SanitizedOrderSiteConfig {
                base_url: strip_query(&o.base_url),
                request_timeout_secs: o.request_timeout_secs,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8005);
        assert_eq!(config.server.host.to_string(), "0.0.0.0");
        assert_eq!(config.database.path, PathBuf::from("cartpilot.db"));
        assert_eq!(config.engine.max_tasks_per_batch, 2000);
        assert!(config.checkpoint.is_none());
        assert!(config.order.is_none());
    }

    #[test]
    fn test_deserialize_full_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
path = "/var/lib/cartpilot/runs.db"

[engine]
max_tasks_per_batch = 500
default_concurrency = 2

[workflow]
call_timeout_secs = 60

[workflow.checkout]
max_attempts = 1

[checkpoint]
account_api_url = "https://shop.test/api/account"
inter_account_delay_ms = 1000

[order]
base_url = "https://shop.test"

[order.endpoints]
checkout = "/api/v2/checkout"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.engine.max_tasks_per_batch, 500);
        assert_eq!(config.engine.default_concurrency, 2);
        assert_eq!(config.engine.max_concurrency, 10);
        assert_eq!(config.workflow.call_timeout_secs, 60);
        assert_eq!(config.workflow.checkout.retry.max_attempts, 1);
        assert_eq!(config.workflow.init.retry.max_attempts, 3);

        let checkpoint = config.checkpoint.unwrap();
        assert_eq!(checkpoint.inter_account_delay_ms, 1000);
        assert_eq!(checkpoint.request_timeout_secs, 15);

        let order = config.order.unwrap();
        assert_eq!(order.base_url, "https://shop.test");
        assert_eq!(order.endpoints.checkout, "/api/v2/checkout");
        assert_eq!(order.endpoints.session, "/api/user/session");
    }

    #[test]
    fn test_checkpoint_requires_url() {
        let result: Result<Config, _> = toml::from_str("[checkpoint]\nrequest_timeout_secs = 5\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_sanitized_config_strips_query() {
        let mut config = Config::default();
        config.checkpoint = Some(CheckpointConfig::new(
            "https://shop.test/api/account?token=secret#top",
        ));

        let sanitized = SanitizedConfig::from(&config);
        let checkpoint = sanitized.checkpoint.unwrap();
        assert_eq!(checkpoint.account_api_url, "https://shop.test/api/account");

        config.order = Some(OrderSiteConfig::new("https://shop.test/?ref=secret"));
        let json = serde_json::to_string(&SanitizedConfig::from(&config)).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("https://shop.test/"));
    }

    #[test]
    fn test_sanitized_config_without_checkpoint() {
        let sanitized = SanitizedConfig::from(&Config::default());
        let json = serde_json::to_value(&sanitized).unwrap();
        assert!(json.get("checkpoint").is_none());
        assert_eq!(json["server"]["port"], 8005);
    }
}
