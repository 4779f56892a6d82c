//! Session transport: one peer channel at a time, a connection status
//! machine and the reconnection timer.
//!
//! Background tasks (broker events, the channel pump, reconnection ticks)
//! never touch game state. They report through [`LinkEvent`]s that the owning
//! session consumes one at a time.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::broker::{Broker, BrokerEvent};
use crate::config::MAX_FRAME_SIZE;
use crate::error::{LinkError, PeerIdError};
use crate::observe::{Observable, Subscription};
use crate::peer_id::PeerId;
use crate::protocol::Message;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    /// A remote peer opened a channel to us.
    Connected,
    /// We opened a channel to a remote peer.
    Joined,
    Disconnected,
    Reconnecting,
}

impl ConnectionStatus {
    /// A channel is open and usable.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Joined)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Status(ConnectionStatus),
    Message(Message),
    /// Transport or broker failure. Never fatal.
    Error(String),
}

#[derive(Default)]
struct LinkState {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    // Bumped for every attached channel so a stale pump cannot tear down its successor.
    generation: u64,
    open_status: Option<ConnectionStatus>,
    last_remote: Option<PeerId>,
    pump: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    // At most one outbound dial at a time.
    dial: Option<JoinHandle<()>>,
    closed: bool,
}

fn running(task: &Option<JoinHandle<()>>) -> bool {
    task.as_ref().is_some_and(|t| !t.is_finished())
}

struct Shared {
    broker: Arc<dyn Broker>,
    status: Observable<ConnectionStatus>,
    status_order: Mutex<()>,
    state: Mutex<LinkState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    reconnect_interval: Duration,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let _order = lock(&self.status_order);
        let previous = self.status.get();
        if previous == status {
            return;
        }
        info!("Connection status {:?} -> {:?}", previous, status);
        self.status.publish(status);
        let _ = self.events.send(LinkEvent::Status(status));
    }

    fn report(&self, message: String) {
        error!("{}", message);
        let _ = self.events.send(LinkEvent::Error(message));
    }

    /// Make `channel` the active peer channel.
    fn attach(self: &Arc<Self>, channel: Box<dyn Transport>, status: ConnectionStatus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            if let Some(pump) = state.pump.take() {
                debug!("Replacing the previous peer channel");
                pump.abort();
            }
            if let Some(timer) = state.reconnect.take() {
                debug!("Reconnection timer cancelled");
                timer.abort();
            }
            state.generation += 1;
            state.outbound = Some(tx);
            state.open_status = Some(status);
            state.generation
        };
        info!("Peer channel open ({})", channel.describe());
        // Announce before the pump can deliver anything from the peer.
        self.set_status(status);
        let pump = tokio::spawn(pump(self.clone(), generation, channel, rx));
        let mut state = lock(&self.state);
        if state.generation == generation && !state.closed {
            state.pump = Some(pump);
        } else {
            pump.abort();
        }
    }

    fn channel_closed(self: &Arc<Self>, generation: u64) {
        {
            let mut state = lock(&self.state);
            if state.generation != generation || state.closed {
                return;
            }
            state.outbound = None;
            state.open_status = None;
            state.pump = None;
        }
        warn!("Connection to peer closed");
        self.set_status(ConnectionStatus::Disconnected);
        self.start_reconnect_timer();
    }

    fn broker_lost(self: &Arc<Self>) {
        warn!("Connection to broker lost");
        self.set_status(ConnectionStatus::Disconnected);
        self.start_reconnect_timer();
    }

    fn start_reconnect_timer(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.closed || running(&state.reconnect) {
            return;
        }
        let shared = self.clone();
        state.reconnect = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(shared.reconnect_interval).await;
                if !shared.reconnect_tick().await {
                    break;
                }
            }
        }));
    }

    /// One retry. Returns false once nothing is left to recover.
    async fn reconnect_tick(self: &Arc<Self>) -> bool {
        if self.broker.is_disconnected() {
            debug!("Reconnecting to broker...");
            self.set_status(ConnectionStatus::Reconnecting);
            if let Err(e) = self.broker.reconnect().await {
                self.report(format!("Broker reconnection failed: {}", e));
            }
            return true;
        }
        let (open, remote, dialing) = {
            let state = lock(&self.state);
            (state.open_status, state.last_remote.clone(), running(&state.dial))
        };
        if let Some(status) = open {
            // Only the broker link was lost and the peer channel survived it.
            {
                let mut state = lock(&self.state);
                state.reconnect.take();
            }
            self.set_status(status);
            return false;
        }
        if dialing {
            debug!("Previous dial still in flight");
            return true;
        }
        if let Some(remote) = remote {
            debug!("Reconnecting to peer {}...", remote);
            self.set_status(ConnectionStatus::Reconnecting);
            self.spawn_dial(remote, false);
        }
        true
    }

    /// Dial `remote` in the background. An explicit connect replaces a dial in
    /// flight; a retry never overlaps one.
    fn spawn_dial(self: &Arc<Self>, remote: PeerId, replace: bool) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        if running(&state.dial) {
            if !replace {
                return;
            }
            if let Some(previous) = state.dial.take() {
                previous.abort();
            }
        }
        state.dial = Some(tokio::spawn(dial(self.clone(), remote)));
    }
}

async fn dial(shared: Arc<Shared>, remote: PeerId) {
    match shared.broker.connect(&remote).await {
        Ok(channel) => {
            lock(&shared.state).last_remote = Some(remote);
            shared.attach(channel, ConnectionStatus::Joined);
        }
        Err(e) => shared.report(format!("Connection to peer {} failed: {}", remote, e)),
    }
}

async fn pump(
    shared: Arc<Shared>,
    generation: u64,
    mut channel: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => match channel.send(msg).await {
                    Ok(()) => {}
                    Err(e) if e.downcast_ref::<LinkError>().is_some() => {
                        // Nothing reached the wire; the channel is still usable.
                        shared.report(format!("Message dropped: {}", e));
                    }
                    Err(e) => {
                        shared.report(format!("Peer connection error: {}", e));
                        break;
                    }
                },
                None => break,
            },
            incoming = channel.recv() => match incoming {
                Ok(msg) => {
                    let _ = shared.events.send(LinkEvent::Message(msg));
                }
                Err(e) => {
                    debug!("Peer channel ended: {}", e);
                    break;
                }
            },
        }
    }
    shared.channel_closed(generation);
}

async fn accept_loop(shared: Arc<Shared>) {
    while let Some(event) = shared.broker.next_event().await {
        match event {
            BrokerEvent::Incoming(channel) => shared.attach(channel, ConnectionStatus::Connected),
            BrokerEvent::Disconnected => shared.broker_lost(),
        }
    }
    debug!("Broker event stream ended");
}

/// Handle to the session transport. Dropping it stops every background task.
pub struct PeerLink {
    shared: Arc<Shared>,
    accept: JoinHandle<()>,
}

impl PeerLink {
    /// Start listening for broker events. Must be called inside a Tokio runtime.
    pub fn start(broker: Arc<dyn Broker>, reconnect_interval: Duration) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            broker,
            status: Observable::new(ConnectionStatus::NotConnected),
            status_order: Mutex::new(()),
            state: Mutex::new(LinkState::default()),
            events,
            reconnect_interval,
        });
        let accept = tokio::spawn(accept_loop(shared.clone()));
        (PeerLink { shared, accept }, rx)
    }

    pub fn local_id(&self) -> &PeerId {
        self.shared.broker.local_id()
    }

    /// Open a channel to `remote`. Success shows up as a `Joined` status,
    /// failure as a [`LinkEvent::Error`].
    pub fn connect(&self, remote: &str) {
        let remote = match PeerId::parse(remote) {
            Ok(id) if &id == self.local_id() => Err(PeerIdError::OwnId),
            other => other,
        };
        match remote {
            Ok(remote) => {
                info!("Connecting to peer {}", remote);
                self.shared.spawn_dial(remote, true);
            }
            Err(e) => self.shared.report(format!("Cannot connect: {}", e)),
        }
    }

    /// Queue `msg` on the open channel. Never blocks. A message that would
    /// not fit in one frame is refused here instead of failing the channel.
    pub fn send(&self, msg: Message) -> Result<(), LinkError> {
        let size = msg.encode().map_err(|e| LinkError::Encode(e.to_string()))?.len();
        if size > MAX_FRAME_SIZE as usize {
            return Err(LinkError::TooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        let state = lock(&self.shared.state);
        if state.closed {
            return Err(LinkError::Closed);
        }
        match &state.outbound {
            Some(outbound) => outbound.send(msg).map_err(|_| LinkError::NoConnection),
            None => Err(LinkError::NoConnection),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.get()
    }

    /// Observe every status transition, in order.
    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.status.subscribe(callback)
    }

    pub fn is_reconnecting(&self) -> bool {
        running(&lock(&self.shared.state).reconnect)
    }

    /// Identifier of the peer we last dialed successfully.
    pub fn last_remote(&self) -> Option<PeerId> {
        lock(&self.shared.state).last_remote.clone()
    }

    /// Close the channel and stop recovering. Terminal.
    pub fn close(&self) {
        self.shutdown();
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    fn shutdown(&self) {
        self.accept.abort();
        let mut state = lock(&self.shared.state);
        state.closed = true;
        state.outbound = None;
        state.open_status = None;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(timer) = state.reconnect.take() {
            timer.abort();
        }
        if let Some(dial) = state.dial.take() {
            dial.abort();
        }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{MemoryBroker, MemoryNetwork};
    use crate::game::Role;
    use crate::protocol::ChatMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout};

    const TICK: Duration = Duration::from_millis(20);

    async fn next_status(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> ConnectionStatus {
        loop {
            match timeout(Duration::from_secs(2), rx.recv()).await {
                Ok(Some(LinkEvent::Status(status))) => return status,
                Ok(Some(_)) => continue,
                other => panic!("no status event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn both_sides_open_with_their_own_status() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = PeerLink::start(Arc::new(network.register_random()), TICK);
        let (guest, mut guest_rx) = PeerLink::start(Arc::new(network.register_random()), TICK);

        guest.connect(&host.local_id().to_string().to_lowercase());
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        assert_eq!(next_status(&mut host_rx).await, ConnectionStatus::Connected);
        assert_eq!(guest.last_remote().as_ref(), Some(host.local_id()));

        let msg = Message::Chat(ChatMessage::now(Role::Joined, "hi"));
        guest.send(msg.clone()).unwrap();
        match timeout(Duration::from_secs(2), host_rx.recv()).await {
            Ok(Some(LinkEvent::Message(received))) => assert_eq!(received, msg),
            other => panic!("expected message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_without_channel_reports_no_connection() {
        let network = MemoryNetwork::new();
        let (link, _rx) = PeerLink::start(Arc::new(network.register_random()), TICK);
        let msg = Message::Chat(ChatMessage::now(Role::Host, "anyone?"));
        assert_eq!(link.send(msg.clone()), Err(LinkError::NoConnection));
        link.close();
        assert_eq!(link.send(msg), Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn invalid_ids_are_signalled() {
        let network = MemoryNetwork::new();
        let (link, mut rx) = PeerLink::start(Arc::new(network.register_random()), TICK);
        link.connect("nope");
        assert!(matches!(rx.recv().await, Some(LinkEvent::Error(_))));
        link.connect(&link.local_id().to_string());
        assert!(matches!(rx.recv().await, Some(LinkEvent::Error(_))));
        assert_eq!(link.status(), ConnectionStatus::NotConnected);
    }

    #[tokio::test]
    async fn joined_side_redials_after_channel_loss() {
        let network = MemoryNetwork::new();
        let host_broker = network.register_random();
        let host_id = host_broker.local_id().clone();
        let (_host, mut host_rx) = PeerLink::start(Arc::new(host_broker), TICK);
        let (guest, mut guest_rx) = PeerLink::start(Arc::new(network.register_random()), TICK);

        guest.connect(host_id.as_str());
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        assert_eq!(next_status(&mut host_rx).await, ConnectionStatus::Connected);

        network.drop_links(&host_id);
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Disconnected);
        assert!(guest.is_reconnecting());
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Reconnecting);
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        assert!(!guest.is_reconnecting());
    }

    /// Memory broker whose dials take a while.
    struct SlowBroker {
        inner: MemoryBroker,
        delay: Duration,
        dials: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Broker for SlowBroker {
        fn local_id(&self) -> &PeerId {
            self.inner.local_id()
        }

        async fn connect(&self, remote: &PeerId) -> anyhow::Result<Box<dyn Transport>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            sleep(self.delay).await;
            self.inner.connect(remote).await
        }

        async fn next_event(&self) -> Option<BrokerEvent> {
            self.inner.next_event().await
        }

        async fn reconnect(&self) -> anyhow::Result<()> {
            self.inner.reconnect().await
        }

        fn is_disconnected(&self) -> bool {
            self.inner.is_disconnected()
        }
    }

    #[tokio::test]
    async fn slow_redials_never_overlap() {
        let network = MemoryNetwork::new();
        let host_broker = network.register_random();
        let host_id = host_broker.local_id().clone();
        let (_host, _host_rx) = PeerLink::start(Arc::new(host_broker), TICK);
        let dials = Arc::new(AtomicUsize::new(0));
        let slow = SlowBroker {
            inner: network.register_random(),
            delay: TICK * 6,
            dials: dials.clone(),
        };
        let (guest, mut guest_rx) = PeerLink::start(Arc::new(slow), TICK);

        guest.connect(host_id.as_str());
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        network.drop_links(&host_id);
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Disconnected);
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Reconnecting);
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        sleep(TICK * 10).await;
        // Ticks during the slow dial were skipped.
        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(guest.status(), ConnectionStatus::Joined);
    }

    #[tokio::test]
    async fn oversized_messages_are_refused_before_queueing() {
        let network = MemoryNetwork::new();
        let (host, mut host_rx) = PeerLink::start(Arc::new(network.register_random()), TICK);
        let (guest, mut guest_rx) = PeerLink::start(Arc::new(network.register_random()), TICK);
        guest.connect(host.local_id().as_str());
        assert_eq!(next_status(&mut guest_rx).await, ConnectionStatus::Joined);
        assert_eq!(next_status(&mut host_rx).await, ConnectionStatus::Connected);

        let huge = Message::Chat(ChatMessage::now(Role::Joined, "x".repeat(MAX_FRAME_SIZE as usize)));
        assert!(matches!(guest.send(huge), Err(LinkError::TooLarge { .. })));

        let msg = Message::Chat(ChatMessage::now(Role::Joined, "still here"));
        guest.send(msg.clone()).unwrap();
        match timeout(Duration::from_secs(2), host_rx.recv()).await {
            Ok(Some(LinkEvent::Message(received))) => assert_eq!(received, msg),
            other => panic!("expected message, got {:?}", other),
        }
        assert_eq!(guest.status(), ConnectionStatus::Joined);
    }

    #[tokio::test]
    async fn broker_loss_is_recovered() {
        let network = MemoryNetwork::new();
        let broker = network.register_random();
        let id = broker.local_id().clone();
        let broker = Arc::new(broker);
        let (link, mut rx) = PeerLink::start(broker.clone(), TICK);

        network.disconnect_broker(&id);
        assert_eq!(next_status(&mut rx).await, ConnectionStatus::Disconnected);
        assert_eq!(next_status(&mut rx).await, ConnectionStatus::Reconnecting);
        assert!(!broker.is_disconnected());
        drop(link);
    }
}
