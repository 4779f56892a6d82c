//! Rendezvous brokers: peer discovery keyed by [`PeerId`].
//!
//! A broker registers the local peer under its identifier, dials remote peers
//! by identifier and hands over channels other peers open to us. No game data
//! flows through it.

use crate::peer_id::PeerId;
use crate::transport::Transport;

pub mod memory;
pub mod tcp;

/// Something the broker wants the session transport to know.
pub enum BrokerEvent {
    /// A remote peer opened a channel to us.
    Incoming(Box<dyn Transport>),
    /// The link to the broker itself was lost. Open channels stay usable.
    Disconnected,
}

impl std::fmt::Debug for BrokerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerEvent::Incoming(channel) => write!(f, "Incoming({})", channel.describe()),
            BrokerEvent::Disconnected => write!(f, "Disconnected"),
        }
    }
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Identifier this peer is registered under.
    fn local_id(&self) -> &PeerId;

    /// Open a channel to `remote`.
    async fn connect(&self, remote: &PeerId) -> anyhow::Result<Box<dyn Transport>>;

    /// Wait for the next broker event. `None` once the broker is shut down.
    async fn next_event(&self) -> Option<BrokerEvent>;

    /// Re-establish a lost broker link under the same identifier.
    async fn reconnect(&self) -> anyhow::Result<()>;

    fn is_disconnected(&self) -> bool;
}
