use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::protocol::Message;
use crate::transport::Transport;

/// Shared close switch for both ends of an in-memory channel.
#[derive(Clone)]
pub struct LinkHandle {
    closed: Arc<watch::Sender<bool>>,
}

impl LinkHandle {
    /// Close both ends; pending and future `recv` calls fail.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

pub struct InMemoryTransport {
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    link: LinkHandle,
    closed: watch::Receiver<bool>,
    // While set, sent messages silently vanish.
    muted: Arc<AtomicBool>,
}

impl InMemoryTransport {
    pub fn pair() -> (Self, Self) {
        let (a, b, _) = Self::pair_with_mutes(
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicBool::new(false)),
        );
        (a, b)
    }

    /// Connected pair whose outbound traffic can be suppressed per end, plus
    /// the handle that closes both.
    pub fn pair_with_mutes(first_muted: Arc<AtomicBool>, second_muted: Arc<AtomicBool>) -> (Self, Self, LinkHandle) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let link = LinkHandle {
            closed: Arc::new(closed_tx),
        };
        (
            Self {
                tx: tx2,
                rx: rx1,
                link: link.clone(),
                closed: closed_rx.clone(),
                muted: first_muted,
            },
            Self {
                tx: tx1,
                rx: rx2,
                link: link.clone(),
                closed: closed_rx,
                muted: second_muted,
            },
            link,
        )
    }

    pub fn handle(&self) -> LinkHandle {
        self.link.clone()
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn send(&mut self, msg: Message) -> anyhow::Result<()> {
        if self.link.is_closed() {
            return Err(anyhow::anyhow!("Channel closed"));
        }
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tx
            .send(msg)
            .map_err(|_| anyhow::anyhow!("Channel closed"))
    }

    async fn recv(&mut self) -> anyhow::Result<Message> {
        if *self.closed.borrow() {
            return Err(anyhow::anyhow!("Channel closed"));
        }
        tokio::select! {
            msg = self.rx.recv() => msg.ok_or_else(|| anyhow::anyhow!("Channel closed")),
            _ = self.closed.wait_for(|closed| *closed) => Err(anyhow::anyhow!("Channel closed")),
        }
    }

    fn describe(&self) -> String {
        "in-memory peer".to_string()
    }
}
