use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

/// Length of a peer identifier.
pub const PEER_ID_LEN: usize = 6;

/// Symbols a peer identifier is drawn from.
pub const PEER_ID_CHARSET: &[u8; 36] = b"QWERTYUIOPASDFGHJKLZXCVBNM0123456789";

/// Fixed retry interval of the reconnection timer.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Number of chat messages kept in history.
pub const CHAT_HISTORY_LIMIT: usize = 100;

/// Maximum encoded frame size on TCP channels (1 MB). A 12x12 board encodes to a few KB.
pub const MAX_FRAME_SIZE: u32 = 1_000_000;

/// Timeout applied to single TCP writes and broker round trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Board dimension chosen by the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardSize {
    #[default]
    Small,
    Medium,
    Large,
    Huge,
}

impl BoardSize {
    pub const ALL: [BoardSize; 4] = [
        BoardSize::Small,
        BoardSize::Medium,
        BoardSize::Large,
        BoardSize::Huge,
    ];

    /// Number of cells along one side of the board.
    pub const fn dimension(self) -> usize {
        match self {
            BoardSize::Small => 6,
            BoardSize::Medium => 8,
            BoardSize::Large => 10,
            BoardSize::Huge => 12,
        }
    }

    pub fn parse(name: &str) -> Option<BoardSize> {
        match name.trim().to_ascii_lowercase().as_str() {
            "small" => Some(BoardSize::Small),
            "medium" => Some(BoardSize::Medium),
            "large" => Some(BoardSize::Large),
            "huge" => Some(BoardSize::Huge),
            _ => None,
        }
    }
}

/// Location of the rendezvous broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Namespace on the broker; peers only see each other within one path.
    pub path: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            path: "/broker".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "millis")]
    pub reconnect_interval: Duration,
    pub broker: BrokerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: RECONNECT_INTERVAL,
            broker: BrokerConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load settings from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use tokio::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_dimensions() {
        let dims: Vec<usize> = BoardSize::ALL.iter().map(|s| s.dimension()).collect();
        assert_eq!(dims, vec![6, 8, 10, 12]);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: SessionConfig =
            serde_json::from_str(r#"{"reconnect_interval": 250, "broker": {"port": 4000}}"#)
                .unwrap();
        assert_eq!(config.reconnect_interval, Duration::from_millis(250));
        assert_eq!(config.broker.port, 4000);
        assert_eq!(config.broker.host, "127.0.0.1");
        assert_eq!(config.broker.path, "/broker");
    }

    #[test]
    fn charset_has_unique_symbols() {
        let mut symbols = PEER_ID_CHARSET.to_vec();
        symbols.sort_unstable();
        symbols.dedup();
        assert_eq!(symbols.len(), 36);
    }
}
