//! MQTT broker configuration.

use serde::Deserialize;

/// Configuration of one named MQTT broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name sensors refer to in their `mqtt` bindings.
    pub name: String,
    /// Broker hostname or IP address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT client identifier.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// Delay before reconnecting after a connection error, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Disabled brokers are not connected; bindings to them are skipped.
    pub enabled: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            client_id: "sensord".to_string(),
            keep_alive_secs: 30,
            reconnect_delay_ms: 5000,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_have_sensible_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.name, "default");
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "sensord");
        assert_eq!(config.keep_alive_secs, 30);
        assert!(config.enabled);
    }

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            name = "home"
            host = "mqtt.example.com"
            port = 8883
            client_id = "living-room"
            keep_alive_secs = 60
            enabled = false
        "#;
        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name, "home");
        assert_eq!(config.host, "mqtt.example.com");
        assert_eq!(config.port, 8883);
        assert_eq!(config.client_id, "living-room");
        assert_eq!(config.keep_alive_secs, 60);
        assert!(!config.enabled);
    }

    #[test]
    fn should_use_defaults_for_missing_fields() {
        let toml = r#"host = "192.168.1.100""#;
        let config: BrokerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.host, "192.168.1.100");
        assert_eq!(config.port, 1883);
        assert_eq!(config.client_id, "sensord");
    }
}
