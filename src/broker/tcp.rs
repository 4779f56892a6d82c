//! TCP rendezvous: a registry mapping `(path, peer id)` to a listening
//! address, and a client that registers with it and dials peers directly.
//!
//! A peer keeps one control connection open for as long as it is
//! registered. Lookups use short-lived connections of their own.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::broker::{Broker, BrokerEvent};
use crate::config::{BrokerConfig, IO_TIMEOUT};
use crate::error::BrokerError;
use crate::peer_id::PeerId;
use crate::transport::tcp::{encode_frame, read_frame, TcpTransport};
use crate::transport::Transport;

// Control frames are tiny.
const MAX_CONTROL_FRAME: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Request {
    Register { path: String, id: String, addr: String },
    Lookup { path: String, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Reply {
    Registered,
    Address { addr: String },
    Error { message: String },
}

async fn write_message<T: Serialize>(stream: &mut TcpStream, value: &T) -> anyhow::Result<()> {
    let frame = encode_frame(value, MAX_CONTROL_FRAME)?;
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn round_trip(stream: &mut TcpStream, request: &Request) -> anyhow::Result<Reply> {
    timeout(IO_TIMEOUT, async {
        write_message(stream, request).await?;
        read_frame(stream, MAX_CONTROL_FRAME).await
    })
    .await
    .map_err(|_| anyhow::anyhow!("Broker timeout after {:?}", IO_TIMEOUT))?
}

async fn connect_service(addr: &str) -> anyhow::Result<TcpStream> {
    timeout(IO_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("Broker connect timeout after {:?}", IO_TIMEOUT))?
        .map_err(|e| BrokerError::Io(e).into())
}

type Registry = Arc<Mutex<HashMap<(String, String), String>>>;

fn lock_registry(map: &Registry) -> MutexGuard<'_, HashMap<(String, String), String>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The rendezvous service.
pub struct RendezvousServer {
    listener: TcpListener,
    registry: Registry,
}

impl RendezvousServer {
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Registry::default(),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the listener fails.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("Rendezvous broker listening on {}", self.listener.local_addr()?);
        loop {
            let (stream, remote) = self.listener.accept().await?;
            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_client(stream, registry).await {
                    debug!("Broker client {} finished: {}", remote, e);
                }
            });
        }
    }
}

async fn serve_client(mut stream: TcpStream, registry: Registry) -> anyhow::Result<()> {
    let mut owned: Vec<(String, String)> = Vec::new();
    let result: anyhow::Result<()> = async {
        loop {
            let request: Request = read_frame(&mut stream, MAX_CONTROL_FRAME).await?;
            let reply = match request {
                Request::Register { path, id, addr } => {
                    let key = (path, id);
                    let mut map = lock_registry(&registry);
                    if map.contains_key(&key) {
                        Reply::Error {
                            message: BrokerError::IdTaken(key.1.clone()).to_string(),
                        }
                    } else {
                        info!("Registered {} at {} under {}", key.1, addr, key.0);
                        map.insert(key.clone(), addr);
                        owned.push(key);
                        Reply::Registered
                    }
                }
                Request::Lookup { path, id } => match lock_registry(&registry).get(&(path, id.clone())) {
                    Some(addr) => Reply::Address { addr: addr.clone() },
                    None => Reply::Error {
                        message: BrokerError::UnknownPeer(id).to_string(),
                    },
                },
            };
            write_message(&mut stream, &reply).await?;
        }
    }
    .await;
    let mut map = lock_registry(&registry);
    for key in owned {
        debug!("Unregistered {}", key.1);
        map.remove(&key);
    }
    result
}

/// Client side of the rendezvous service.
pub struct TcpBroker {
    id: PeerId,
    config: BrokerConfig,
    listen_addr: SocketAddr,
    disconnected: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<BrokerEvent>>,
    accept_task: JoinHandle<()>,
    control_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpBroker {
    /// Listen for peers on `listen_host` (any free port) and register `id`
    /// with the rendezvous service described by `config`.
    pub async fn register(config: BrokerConfig, id: PeerId, listen_host: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind((listen_host, 0)).await?;
        let listen_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let accept_events = events_tx.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!("Incoming peer channel from {}", remote);
                        let channel: Box<dyn Transport> = Box::new(TcpTransport::new(stream));
                        if accept_events.send(BrokerEvent::Incoming(channel)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Peer listener failed: {}", e);
                        break;
                    }
                }
            }
        });

        let broker = Self {
            id,
            config,
            listen_addr,
            disconnected: Arc::new(AtomicBool::new(true)),
            events_tx,
            events: tokio::sync::Mutex::new(events_rx),
            accept_task,
            control_task: Mutex::new(None),
        };
        broker.open_control().await?;
        Ok(broker)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    async fn open_control(&self) -> anyhow::Result<()> {
        let mut stream = connect_service(&self.config.addr()).await?;
        let reply = round_trip(
            &mut stream,
            &Request::Register {
                path: self.config.path.clone(),
                id: self.id.to_string(),
                addr: self.listen_addr.to_string(),
            },
        )
        .await?;
        match reply {
            Reply::Registered => {}
            Reply::Error { message } => return Err(BrokerError::Protocol(message).into()),
            other => return Err(BrokerError::Protocol(format!("unexpected reply {:?}", other)).into()),
        }
        info!("Registered {} with broker {}", self.id, self.config.addr());
        self.disconnected.store(false, Ordering::SeqCst);

        let disconnected = self.disconnected.clone();
        let events = self.events_tx.clone();
        let id = self.id.clone();
        let watcher = tokio::spawn(async move {
            // The service never speaks unprompted; any read result means the link is gone.
            let mut byte = [0u8; 1];
            let _ = stream.read(&mut byte).await;
            warn!("Broker link of {} lost", id);
            disconnected.store(true, Ordering::SeqCst);
            let _ = events.send(BrokerEvent::Disconnected);
        });
        let previous = self
            .control_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(watcher);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn lookup(&self, remote: &PeerId) -> anyhow::Result<String> {
        let mut stream = connect_service(&self.config.addr()).await?;
        let reply = round_trip(
            &mut stream,
            &Request::Lookup {
                path: self.config.path.clone(),
                id: remote.to_string(),
            },
        )
        .await?;
        match reply {
            Reply::Address { addr } => Ok(addr),
            Reply::Error { message } => Err(BrokerError::Protocol(message).into()),
            other => Err(BrokerError::Protocol(format!("unexpected reply {:?}", other)).into()),
        }
    }
}

#[async_trait::async_trait]
impl Broker for TcpBroker {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    async fn connect(&self, remote: &PeerId) -> anyhow::Result<Box<dyn Transport>> {
        if self.is_disconnected() {
            return Err(BrokerError::Disconnected.into());
        }
        let addr = self.lookup(remote).await?;
        debug!("Dialing {} at {}", remote, addr);
        Ok(Box::new(TcpTransport::connect(addr).await?))
    }

    async fn next_event(&self) -> Option<BrokerEvent> {
        self.events.lock().await.recv().await
    }

    async fn reconnect(&self) -> anyhow::Result<()> {
        if !self.is_disconnected() {
            return Ok(());
        }
        self.open_control().await
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Some(task) = self
            .control_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }
    }
}
