//! The session context: one peer's engine, link, chat and observers.
//!
//! Everything that mutates [`GameState`] runs on the task that drives
//! [`Session::next_event`] or calls the intent methods; link traffic is
//! queued and handled strictly in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::broker::Broker;
use crate::chat::ChatLog;
use crate::config::{BoardSize, SessionConfig};
use crate::error::{LinkError, RuleError};
use crate::game::{ClaimResult, GameEngine, GameProgress, GameState, Line, Outcome, Role};
use crate::link::{ConnectionStatus, LinkEvent, PeerLink};
use crate::observe::{Observable, Subscription};
use crate::peer_id::PeerId;
use crate::protocol::{ChatMessage, Message};
use crate::sync::{self, Patch, ResyncAction};

/// Something observers of a session should react to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Status(ConnectionStatus),
    Progress(GameProgress),
    /// The shared state changed, locally or from the peer.
    StateChanged,
    Chat(ChatMessage),
    /// A local claim was refused; nothing changed and nothing was sent.
    MoveRejected { line: Line, reason: RuleError },
    /// A peer patch could not be applied; a full-state exchange was started.
    Desync(String),
    Error(String),
}

pub struct Session {
    link: PeerLink,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    engine: GameEngine,
    chat: ChatLog,
    state: Observable<GameState>,
    progress: Observable<GameProgress>,
    pending: VecDeque<SessionEvent>,
}

impl Session {
    /// Start a session on `broker`. Must be called inside a Tokio runtime.
    pub fn start(broker: Arc<dyn Broker>, config: &SessionConfig) -> Self {
        let (link, link_events) = PeerLink::start(broker, config.reconnect_interval);
        info!("Session started as {}", link.local_id());
        Self {
            link,
            link_events,
            engine: GameEngine::new(),
            chat: ChatLog::new(),
            state: Observable::new(GameState::default()),
            progress: Observable::new(GameProgress::NotStarted),
            pending: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        self.link.local_id()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link.status()
    }

    pub fn state(&self) -> &GameState {
        self.engine.state()
    }

    pub fn progress(&self) -> GameProgress {
        self.engine.progress()
    }

    pub fn role(&self) -> Option<Role> {
        self.engine.role()
    }

    pub fn is_my_turn(&self) -> bool {
        self.engine.is_my_turn()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.engine.outcome()
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn subscribe_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GameState) + Send + Sync + 'static,
    {
        self.state.subscribe(callback)
    }

    pub fn subscribe_progress<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&GameProgress) + Send + Sync + 'static,
    {
        self.progress.subscribe(callback)
    }

    pub fn subscribe_status<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.link.subscribe_status(callback)
    }

    /// Dial the peer registered as `remote`.
    pub fn connect(&self, remote: &str) {
        self.link.connect(remote);
    }

    pub fn submit_player(&mut self, name: &str, size: Option<BoardSize>) -> Result<(), RuleError> {
        self.mutate(|engine| engine.submit_player(name, size))
    }

    pub fn claim_line(&mut self, line: Line) -> Result<ClaimResult, RuleError> {
        let status = self.link.status();
        let result = self.mutate(|engine| engine.claim_line(line, status));
        if let Err(reason) = result {
            debug!("Rejected claim of {}: {}", line, reason);
            self.pending.push_back(SessionEvent::MoveRejected { line, reason });
        }
        result
    }

    pub fn start_new_game(&mut self) -> Result<(), RuleError> {
        self.mutate(|engine| engine.start_new_game())
    }

    /// Send a chat line and append it to the local history.
    pub fn send_chat(&mut self, text: &str) -> Result<(), LinkError> {
        let sender = self.engine.role().ok_or(LinkError::NoConnection)?;
        let message = ChatMessage::now(sender, text);
        self.link.send(Message::Chat(message.clone()))?;
        self.chat.push(message);
        Ok(())
    }

    /// Wait for the next event, handling link traffic on the way. `None` once
    /// the link has shut down and every queued event was delivered.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let link_event = self.link_events.recv().await?;
            self.handle_link_event(link_event);
        }
    }

    /// Handle one link event. Resulting session events are queued for
    /// [`Session::next_event`].
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Status(status) => self.on_status(status),
            LinkEvent::Message(Message::Patch { ops }) => self.on_patch(ops),
            LinkEvent::Message(Message::Sync { state }) => self.on_sync(state),
            LinkEvent::Message(Message::Chat(message)) => {
                self.chat.push(message.clone());
                self.pending.push_back(SessionEvent::Chat(message));
            }
            LinkEvent::Error(message) => self.pending.push_back(SessionEvent::Error(message)),
        }
    }

    fn on_status(&mut self, status: ConnectionStatus) {
        self.pending.push_back(SessionEvent::Status(status));
        let before = self.engine.state().clone();
        if let Some(progress) = self.engine.on_connection_status(status) {
            self.publish_progress(progress);
        }
        if &before != self.engine.state() {
            self.publish_state();
        }
        if status.is_open() && self.engine.progress() == GameProgress::InProgress {
            info!("Reconnected mid-game at {} moves, announcing state", self.engine.state().move_count());
            self.send_state();
        }
    }

    fn on_patch(&mut self, patch: Patch) {
        match sync::apply_to_state(self.engine.state(), &patch) {
            Ok(state) => {
                debug!("Applied patch of {} operations", patch.len());
                self.engine.replace_state(state);
                self.refresh();
            }
            Err(e) => {
                error!("State desync: {}", e);
                self.pending.push_back(SessionEvent::Desync(e.to_string()));
                // Resync only repairs a move-count gap. If the failed patch left
                // `moves` equal on both sides (lobby, new game) the peer answers
                // InSync and the divergence stays.
                self.send_state();
            }
        }
    }

    fn on_sync(&mut self, remote: GameState) {
        match sync::resolve_resync(self.engine.state(), &remote) {
            Ok(ResyncAction::Adopt(patch)) => match sync::apply_to_state(self.engine.state(), &patch) {
                Ok(state) => {
                    self.engine.replace_state(state);
                    self.refresh();
                }
                Err(e) => self.pending.push_back(SessionEvent::Desync(e.to_string())),
            },
            Ok(ResyncAction::Respond) => self.send_state(),
            Ok(ResyncAction::InSync) => {}
            Err(e) => self.pending.push_back(SessionEvent::Desync(e.to_string())),
        }
    }

    /// Run an intent, ship the resulting patch and re-derive progress.
    fn mutate<T>(&mut self, intent: impl FnOnce(&mut GameEngine) -> Result<T, RuleError>) -> Result<T, RuleError> {
        let before = self.engine.state().clone();
        let result = intent(&mut self.engine)?;
        match sync::diff_states(&before, self.engine.state()) {
            Ok(patch) if patch.is_empty() => {}
            Ok(patch) => {
                debug!("Sending patch of {} operations", patch.len());
                self.send(Message::Patch { ops: patch });
            }
            Err(e) => error!("Cannot diff local state: {}", e),
        }
        self.refresh();
        Ok(result)
    }

    fn send_state(&mut self) {
        self.send(Message::Sync {
            state: self.engine.state().clone(),
        });
    }

    fn send(&mut self, msg: Message) {
        if let Err(e) = self.link.send(msg) {
            warn!("Message not sent: {}", e);
            self.pending.push_back(SessionEvent::Error(e.to_string()));
        }
    }

    fn refresh(&mut self) {
        if let Some(progress) = self.engine.update_progress() {
            self.publish_progress(progress);
        }
        self.publish_state();
    }

    fn publish_state(&mut self) {
        self.state.publish(self.engine.state().clone());
        self.pending.push_back(SessionEvent::StateChanged);
    }

    fn publish_progress(&mut self, progress: GameProgress) {
        self.progress.publish(progress);
        self.pending.push_back(SessionEvent::Progress(progress));
        if let Some(outcome) = self.engine.outcome() {
            info!("Game finished: {:?}", outcome);
        }
    }
}
