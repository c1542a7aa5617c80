use serde::{Deserialize, Serialize};

use crate::balancer::DEFAULT_VIRTUAL_NODES;
use crate::error::{Result, WeftError};

/// Dispatcher configuration.
///
/// These are the recognized options; `validate` rejects unsupported values
/// at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which transport binding to instantiate.
    #[serde(default = "default_transport_type")]
    pub transport_type: String,

    /// `consistent-hash` or `round-robin`.
    #[serde(default = "default_load_balancer_type")]
    pub load_balancer_type: String,

    /// Ring density for consistent hashing.
    #[serde(default = "default_virtual_nodes")]
    pub load_balancer_virtual_nodes: usize,

    /// Discovery scope.
    #[serde(default = "default_membership_namespace")]
    pub membership_namespace: String,

    #[serde(default = "default_membership_selector")]
    pub membership_selector: String,

    /// Transport dial budget.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,

    /// Fallback polling period for non-watching discovery.
    #[serde(default = "default_discovery_refresh")]
    pub discovery_refresh_seconds: u64,

    /// Active probe period.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_seconds: u64,
}

fn default_transport_type() -> String {
    "grpc".to_string()
}

fn default_load_balancer_type() -> String {
    "consistent-hash".to_string()
}

fn default_virtual_nodes() -> usize {
    DEFAULT_VIRTUAL_NODES
}

fn default_membership_namespace() -> String {
    "default".to_string()
}

fn default_membership_selector() -> String {
    "app=workflow-engine".to_string()
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_discovery_refresh() -> u64 {
    30
}

fn default_health_check_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_type: default_transport_type(),
            load_balancer_type: default_load_balancer_type(),
            load_balancer_virtual_nodes: default_virtual_nodes(),
            membership_namespace: default_membership_namespace(),
            membership_selector: default_membership_selector(),
            connection_timeout_seconds: default_connection_timeout(),
            discovery_refresh_seconds: default_discovery_refresh(),
            health_check_interval_seconds: default_health_check_interval(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("TRANSPORT_TYPE") {
            config.transport_type = value;
        }
        if let Ok(value) = std::env::var("LOAD_BALANCER_TYPE") {
            config.load_balancer_type = value;
        }
        if let Some(value) = env_parse("LOAD_BALANCER_VIRTUAL_NODES") {
            config.load_balancer_virtual_nodes = value;
        }
        if let Ok(value) = std::env::var("MEMBERSHIP_NAMESPACE") {
            config.membership_namespace = value;
        }
        if let Ok(value) = std::env::var("MEMBERSHIP_SELECTOR") {
            config.membership_selector = value;
        }
        if let Some(value) = env_parse("CONNECTION_TIMEOUT_SECONDS") {
            config.connection_timeout_seconds = value;
        }
        if let Some(value) = env_parse("DISCOVERY_REFRESH_SECONDS") {
            config.discovery_refresh_seconds = value;
        }
        if let Some(value) = env_parse("HEALTH_CHECK_INTERVAL_SECONDS") {
            config.health_check_interval_seconds = value;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        match self.transport_type.as_str() {
            "grpc" | "local" => {}
            other => {
                return Err(WeftError::Config(format!(
                    "unsupported transport type: {}",
                    other
                )))
            }
        }

        match self.load_balancer_type.as_str() {
            "consistent-hash" | "round-robin" => {}
            other => {
                return Err(WeftError::Config(format!(
                    "unsupported load balancer type: {}",
                    other
                )))
            }
        }

        if self.load_balancer_virtual_nodes == 0 {
            return Err(WeftError::Config(
                "load_balancer_virtual_nodes must be positive".to_string(),
            ));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(WeftError::Config(
                "connection_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.discovery_refresh_seconds == 0 {
            return Err(WeftError::Config(
                "discovery_refresh_seconds must be positive".to_string(),
            ));
        }
        if self.health_check_interval_seconds == 0 {
            return Err(WeftError::Config(
                "health_check_interval_seconds must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|raw| raw.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.transport_type, "grpc");
        assert_eq!(config.load_balancer_type, "consistent-hash");
        assert_eq!(config.load_balancer_virtual_nodes, DEFAULT_VIRTUAL_NODES);
        assert_eq!(config.discovery_refresh_seconds, 30);
    }

    #[test]
    fn test_unsupported_values_rejected() {
        let mut config = Config::default();
        config.transport_type = "carrier-pigeon".to_string();
        assert!(matches!(config.validate(), Err(WeftError::Config(_))));

        let mut config = Config::default();
        config.load_balancer_type = "least-connections".to_string();
        assert!(matches!(config.validate(), Err(WeftError::Config(_))));

        let mut config = Config::default();
        config.load_balancer_virtual_nodes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_robin_accepted() {
        let mut config = Config::default();
        config.load_balancer_type = "round-robin".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("LOAD_BALANCER_TYPE", "round-robin");
        std::env::set_var("LOAD_BALANCER_VIRTUAL_NODES", "64");
        std::env::set_var("MEMBERSHIP_NAMESPACE", "workflows");

        let config = Config::from_env();
        assert_eq!(config.load_balancer_type, "round-robin");
        assert_eq!(config.load_balancer_virtual_nodes, 64);
        assert_eq!(config.membership_namespace, "workflows");
        // Untouched options keep their defaults.
        assert_eq!(config.transport_type, "grpc");

        std::env::remove_var("LOAD_BALANCER_TYPE");
        std::env::remove_var("LOAD_BALANCER_VIRTUAL_NODES");
        std::env::remove_var("MEMBERSHIP_NAMESPACE");
    }

    #[test]
    fn test_deserialization_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"load_balancer_type": "round-robin"}"#).unwrap();
        assert_eq!(config.load_balancer_type, "round-robin");
        assert_eq!(config.transport_type, "grpc");
        assert_eq!(config.load_balancer_virtual_nodes, DEFAULT_VIRTUAL_NODES);
    }
}
