//! Client configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_host: String,
    pub server_port: u16,
    pub use_tls: bool,
    /// Relay-discovery servers handed to every peer connection.
    pub ice_servers: Vec<String>,
    pub ring_timeout_secs: u64,
    pub force_connect_delay_ms: u64,
    pub connecting_timeout_secs: u64,
    pub page_size: usize,
    pub cache_ttl_secs: u64,
    pub typing_idle_ms: u64,
    pub reconnect_max_backoff_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_host: "localhost".to_string(),
            server_port: 5000,
            use_tls: false,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ring_timeout_secs: 30,
            force_connect_delay_ms: 2000,
            connecting_timeout_secs: 10,
            page_size: 50,
            cache_ttl_secs: 300,
            typing_idle_ms: 3000,
            reconnect_max_backoff_secs: 30,
        }
    }
}

impl ClientConfig {
    pub fn new(host: &str, port: u16, use_tls: bool) -> Self {
        Self {
            server_host: host.to_string(),
            server_port: port,
            use_tls,
            ..Self::default()
        }
    }

    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: Self = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(data_dir.join(CONFIG_FILE), content)?;
        Ok(())
    }

    pub fn http_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.server_host, self.server_port)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/ws", scheme, self.server_host, self.server_port)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn force_connect_delay(&self) -> Duration {
        Duration::from_millis(self.force_connect_delay_ms)
    }

    pub fn connecting_timeout(&self) -> Duration {
        Duration::from_secs(self.connecting_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn typing_idle(&self) -> Duration {
        Duration::from_millis(self.typing_idle_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let config = ClientConfig::new("chat.example.org", 443, true);
        assert_eq!(config.http_url(), "https://chat.example.org:443");
        assert_eq!(config.ws_url(), "wss://chat.example.org:443/ws");
        assert_eq!(config.ring_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{ "server_host": "10.0.0.2", "page_size": 20 }"#,
        )
        .unwrap();

        let config = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(config.server_host, "10.0.0.2");
        assert_eq!(config.page_size, 20);
        assert_eq!(config.ring_timeout_secs, 30);
        assert_eq!(config.ice_servers.len(), 2);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ClientConfig::default();
        config.server_port = 8443;
        config.save(dir.path()).unwrap();

        let loaded = ClientConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.server_port, 8443);
    }
}
