use crate::protocol::Message;

/// A single point-to-point peer channel.
///
/// `recv` must be cancel safe: the session pump races it against outbound
/// messages and drops the pending future whenever something is sent.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()>;
    async fn recv(&mut self) -> anyhow::Result<Message>;

    /// Human readable description of the remote end, for logs.
    fn describe(&self) -> String {
        "peer".to_string()
    }
}

pub mod in_memory;
pub mod tcp;
