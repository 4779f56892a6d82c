//! In-process broker for tests and simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info};
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerEvent};
use crate::error::BrokerError;
use crate::peer_id::PeerId;
use crate::transport::in_memory::{InMemoryTransport, LinkHandle};
use crate::transport::Transport;

struct PeerEntry {
    events: mpsc::UnboundedSender<BrokerEvent>,
    online: Arc<AtomicBool>,
    muted: Arc<AtomicBool>,
    links: Vec<LinkHandle>,
}

/// Registry of in-process peers with fault injection.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<PeerId, PeerEntry>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<PeerId, PeerEntry>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a peer under `id`.
    pub fn register(&self, id: PeerId) -> Result<MemoryBroker, BrokerError> {
        let mut peers = self.peers();
        if peers.contains_key(&id) {
            return Err(BrokerError::IdTaken(id.to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let online = Arc::new(AtomicBool::new(true));
        peers.insert(
            id.clone(),
            PeerEntry {
                events: tx,
                online: online.clone(),
                muted: Arc::new(AtomicBool::new(false)),
                links: Vec::new(),
            },
        );
        debug!("Registered {} with the in-memory broker", id);
        Ok(MemoryBroker {
            id,
            network: self.clone(),
            online,
            events: tokio::sync::Mutex::new(rx),
        })
    }

    /// Register under a freshly generated identifier.
    pub fn register_random(&self) -> MemoryBroker {
        loop {
            if let Ok(broker) = self.register(PeerId::random()) {
                return broker;
            }
        }
    }

    /// Close every live channel `id` is part of.
    pub fn drop_links(&self, id: &PeerId) {
        let links: Vec<LinkHandle> = self
            .peers()
            .get_mut(id)
            .map(|entry| std::mem::take(&mut entry.links))
            .unwrap_or_default();
        info!("Dropping {} channel(s) of {}", links.len(), id);
        for link in links {
            link.close();
        }
    }

    /// While enabled, everything `id` sends is silently lost.
    pub fn set_drop_messages(&self, id: &PeerId, drop: bool) {
        if let Some(entry) = self.peers().get(id) {
            entry.muted.store(drop, Ordering::SeqCst);
        }
    }

    /// Cut `id`'s broker link. Its open channels keep working.
    pub fn disconnect_broker(&self, id: &PeerId) {
        if let Some(entry) = self.peers().get(id) {
            if entry.online.swap(false, Ordering::SeqCst) {
                info!("Broker link of {} cut", id);
                let _ = entry.events.send(BrokerEvent::Disconnected);
            }
        }
    }

    fn open_channel(&self, from: &PeerId, to: &PeerId) -> Result<Box<dyn Transport>, BrokerError> {
        let mut peers = self.peers();
        let from_muted = match peers.get(from) {
            Some(entry) if entry.online.load(Ordering::SeqCst) => entry.muted.clone(),
            _ => return Err(BrokerError::Disconnected),
        };
        let to_entry = match peers.get_mut(to) {
            Some(entry) if entry.online.load(Ordering::SeqCst) => entry,
            _ => return Err(BrokerError::UnknownPeer(to.to_string())),
        };
        let (local, remote, link) = InMemoryTransport::pair_with_mutes(from_muted, to_entry.muted.clone());
        to_entry.links.retain(|l| !l.is_closed());
        to_entry.links.push(link.clone());
        to_entry
            .events
            .send(BrokerEvent::Incoming(Box::new(remote)))
            .map_err(|_| BrokerError::UnknownPeer(to.to_string()))?;
        if let Some(entry) = peers.get_mut(from) {
            entry.links.retain(|l| !l.is_closed());
            entry.links.push(link);
        }
        Ok(Box::new(local))
    }
}

/// One peer's view of a [`MemoryNetwork`].
pub struct MemoryBroker {
    id: PeerId,
    network: MemoryNetwork,
    online: Arc<AtomicBool>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerEvent>>,
}

impl MemoryBroker {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn connect(&self, remote: &PeerId) -> anyhow::Result<Box<dyn Transport>> {
        Ok(self.network.open_channel(&self.id, remote)?)
    }

    async fn next_event(&self) -> Option<BrokerEvent> {
        self.events.lock().await.recv().await
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        if !self.online.swap(true, Ordering::SeqCst) {
            info!("{} re-registered with the in-memory broker", self.id);
        }
        Ok(())
    }

    fn is_disconnected(&self) -> bool {
        !self.online.load(Ordering::SeqCst)
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        let entry = self.network.peers().remove(&self.id);
        if let Some(entry) = entry {
            for link in entry.links {
                link.close();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::Role;
    use crate::protocol::{ChatMessage, Message};

    fn id(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn connect_delivers_incoming_channel() {
        let network = MemoryNetwork::new();
        let host = network.register(id("AAAAAA")).unwrap();
        let guest = network.register(id("BBBBBB")).unwrap();

        let mut outbound = guest.connect(host.local_id()).await.unwrap();
        let mut inbound = match host.next_event().await {
            Some(BrokerEvent::Incoming(channel)) => channel,
            other => panic!("unexpected event {:?}", other),
        };
        let msg = Message::Chat(ChatMessage::now(Role::Joined, "hello"));
        outbound.send(msg.clone()).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn unknown_and_duplicate_ids_are_rejected() {
        let network = MemoryNetwork::new();
        let guest = network.register(id("BBBBBB")).unwrap();
        assert!(guest.connect(&id("ZZZZZZ")).await.is_err());
        assert!(matches!(network.register(id("BBBBBB")), Err(BrokerError::IdTaken(_))));
    }

    #[tokio::test]
    async fn broker_loss_blocks_dialing_until_reconnect() {
        let network = MemoryNetwork::new();
        let host = network.register(id("AAAAAA")).unwrap();
        let guest = network.register(id("BBBBBB")).unwrap();

        network.disconnect_broker(guest.local_id());
        assert!(guest.is_disconnected());
        assert!(matches!(guest.next_event().await, Some(BrokerEvent::Disconnected)));
        assert!(guest.connect(host.local_id()).await.is_err());

        guest.reconnect().await.unwrap();
        assert!(!guest.is_disconnected());
        assert!(guest.connect(host.local_id()).await.is_ok());
    }

    #[tokio::test]
    async fn drop_links_closes_both_ends() {
        let network = MemoryNetwork::new();
        let host = network.register(id("AAAAAA")).unwrap();
        let guest = network.register(id("BBBBBB")).unwrap();
        let mut outbound = guest.connect(host.local_id()).await.unwrap();
        let Some(BrokerEvent::Incoming(mut inbound)) = host.next_event().await else {
            panic!("expected incoming channel");
        };
        network.drop_links(host.local_id());
        assert!(inbound.recv().await.is_err());
        assert!(outbound.recv().await.is_err());
    }
}
