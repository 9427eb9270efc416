//! WebSocket endpoint configuration.

use serde::Deserialize;

/// Configuration of one named outbound WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Name sensors refer to in their `ws` bindings.
    pub name: String,
    /// `ws://` or `wss://` URI.
    pub uri: String,
    /// Connection attempt timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Delay between connection attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            uri: "ws://localhost:8080".to_string(),
            connect_timeout_ms: 5000,
            reconnect_delay_ms: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_deserialize_from_toml() {
        let toml = r#"
            name = "dashboard"
            uri = "wss://dashboard.example.com/events"
            connect_timeout_ms = 1500
        "#;
        let config: EndpointConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.name, "dashboard");
        assert_eq!(config.uri, "wss://dashboard.example.com/events");
        assert_eq!(config.connect_timeout_ms, 1500);
        assert_eq!(config.reconnect_delay_ms, 5000);
    }
}
