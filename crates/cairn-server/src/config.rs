use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9420;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = ServerConfig::default();
        assert_eq!(c.bind_addr, "127.0.0.1:9420".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn deserializes_bind_addr() {
        let c: ServerConfig = serde_json::from_str(r#"{"bind_addr":"0.0.0.0:8080"}"#).unwrap();
        assert_eq!(c.bind_addr.port(), 8080);
        let c: ServerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(c, ServerConfig::default());
    }
}
