//! Chat history shared by both peers' sessions.

use crate::config::CHAT_HISTORY_LIMIT;
use crate::observe::{Observable, Subscription};
use crate::protocol::ChatMessage;

/// Bounded, timestamp-ordered chat history.
pub struct ChatLog {
    messages: Observable<Vec<ChatMessage>>,
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            messages: Observable::new(Vec::new()),
        }
    }

    /// Append a message, keep the newest [`CHAT_HISTORY_LIMIT`] and publish.
    pub fn push(&self, message: ChatMessage) {
        let mut messages = self.messages.get();
        messages.push(message);
        if messages.len() > CHAT_HISTORY_LIMIT {
            let excess = messages.len() - CHAT_HISTORY_LIMIT;
            messages.drain(..excess);
        }
        messages.sort_by_key(|m| m.timestamp);
        self.messages.publish(messages);
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.get()
    }

    /// Notified with the full history after every new message.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Vec<ChatMessage>) + Send + Sync + 'static,
    {
        self.messages.subscribe(callback)
    }
}
