use serde::{Deserialize, Serialize};

use crate::game::{GameState, Role};
use crate::sync::Patch;

/// A timestamped chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Role,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl ChatMessage {
    /// Message stamped with the current wall-clock time.
    pub fn now(sender: Role, text: impl Into<String>) -> Self {
        Self {
            sender,
            text: text.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Everything exchanged over a peer channel, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Message {
    /// Incremental state change.
    Patch { ops: Patch },
    /// Full-state announcement used for resync after a reconnection.
    Sync { state: GameState },
    /// Chat side-channel.
    Chat(ChatMessage),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Operation;
    use serde_json::json;

    #[test]
    fn envelopes_carry_discriminator() {
        let patch = Message::Patch {
            ops: Patch(vec![Operation::replace("/moves", json!(2))]),
        };
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!({"kind": "patch", "ops": [{"op": "replace", "path": "/moves", "value": 2}]})
        );

        let sync = Message::Sync {
            state: GameState::default(),
        };
        assert_eq!(serde_json::to_value(&sync).unwrap()["kind"], "sync");

        let chat = Message::Chat(ChatMessage {
            sender: Role::Host,
            text: "hi".into(),
            timestamp: 42,
        });
        assert_eq!(
            serde_json::to_value(&chat).unwrap(),
            json!({"kind": "chat", "sender": "host", "text": "hi", "timestamp": 42})
        );
    }

    #[test]
    fn decode_round_trips_and_rejects_unknown_kinds() {
        let msg = Message::Chat(ChatMessage::now(Role::Joined, "gg"));
        assert_eq!(Message::decode(&msg.encode().unwrap()).unwrap(), msg);
        assert!(Message::decode(br#"{"kind":"shout","text":"x"}"#).is_err());
        assert!(Message::decode(br#"[{"op":"remove","path":"/size"}]"#).is_err());
    }
}
