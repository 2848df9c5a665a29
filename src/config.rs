//! Engine configuration.
//!
//! Deployment-variable settings only: broker endpoint and credentials, HTTP
//! concurrency. Runtime tuning values that were never meant to vary per
//! deployment (receive limit, batch size, flush interval) live as constants
//! on their components.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub broker: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Requests allowed in flight at once.
    #[serde(default = "default_http_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            concurrency: default_http_concurrency(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,

    #[serde(default = "default_broker_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Base client id; each connection appends a unique suffix.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: None,
            password: None,
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

fn default_http_concurrency() -> usize {
    32
}

fn default_user_agent() -> String {
    crate::http::DEFAULT_USER_AGENT.to_string()
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "forager".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.http.concurrency, 32);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert!(config.broker.username.is_none());
    }

    #[test]
    fn test_partial_json_fills_in_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"broker": {"host": "mq.internal"}}"#).unwrap();
        assert_eq!(config.broker.host, "mq.internal");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.http.concurrency, 32);
    }
}
