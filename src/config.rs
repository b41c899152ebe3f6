//! Configuration for the relay leaf demo binary
//!
//! Supports a small JSON configuration file; every field is optional
//! and command line flags override whatever the file says.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::discovery::DEFAULT_DISCOVERY_URL;
use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Discovery endpoint returning the relay node list
    #[serde(default = "default_discovery_url")]
    pub discovery_url: String,

    /// Partner identifier forwarded to discovery and relay nodes
    #[serde(default)]
    pub partner_id: Option<String>,

    /// Upstream proxies, tried in order (`scheme://[user:pass@]host:port`)
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Enable debug logging
    #[serde(default)]
    pub verbose: bool,
}

fn default_discovery_url() -> String {
    DEFAULT_DISCOVERY_URL.to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            discovery_url: default_discovery_url(),
            partner_id: None,
            proxies: Vec::new(),
            verbose: false,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert_eq!(config.discovery_url, DEFAULT_DISCOVERY_URL);
        assert!(config.partner_id.is_none());
        assert!(config.proxies.is_empty());
        assert!(!config.verbose);
    }

    #[test]
    fn test_full_config() {
        let config = RelayConfig::from_json(
            r#"{
                "discovery_url": "https://discovery.example.com/nodes",
                "partner_id": "acme",
                "proxies": ["socks5://127.0.0.1:1080"],
                "verbose": true
            }"#,
        )
        .unwrap();
        assert_eq!(config.discovery_url, "https://discovery.example.com/nodes");
        assert_eq!(config.partner_id.as_deref(), Some("acme"));
        assert_eq!(config.proxies.len(), 1);
        assert!(config.verbose);
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = RelayConfig::from_json("{not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let config = RelayConfig::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = RelayConfig::from_json(&json).unwrap();
        assert_eq!(parsed.discovery_url, config.discovery_url);
    }
}
