pub mod broker;
pub mod chat;
pub mod config;
pub mod error;
pub mod game;
pub mod link;
mod logging;
pub mod observe;
pub mod peer_id;
pub mod player;
pub mod protocol;
pub mod session;
pub mod sync;
pub mod transport;

pub use broker::memory::{MemoryBroker, MemoryNetwork};
pub use broker::tcp::{RendezvousServer, TcpBroker};
pub use broker::{Broker, BrokerEvent};
pub use chat::ChatLog;
pub use config::*;
pub use error::*;
pub use game::*;
pub use link::{ConnectionStatus, LinkEvent, PeerLink};
pub use logging::init_logging;
pub use observe::{Observable, Subscription};
pub use peer_id::PeerId;
pub use player::{GreedyPlayer, Player};
pub use protocol::{ChatMessage, Message};
pub use session::{Session, SessionEvent};
pub use sync::{Patch, ResyncAction};
pub use transport::in_memory::InMemoryTransport;
pub use transport::tcp::TcpTransport;
pub use transport::Transport;
