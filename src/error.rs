//! Error types shared across the crate.

use thiserror::Error;

/// Rejected peer identifier input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer id must be {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("Peer id contains invalid symbol {0:?}")]
    InvalidSymbol(char),
    #[error("Cannot connect to own peer id")]
    OwnId,
}

/// A patch that cannot be applied to the current document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error("Invalid pointer: {0:?}")]
    InvalidPointer(String),
    #[error("Path not found: {0}")]
    PathNotFound(String),
    #[error("Index {index} out of bounds at {path}")]
    IndexOutOfBounds { path: String, index: usize },
    #[error("Cannot descend into scalar at {0}")]
    NotAContainer(String),
    #[error("Operation at {0} is missing a value")]
    MissingValue(String),
    #[error("Cannot remove the document root")]
    RemoveRoot,
}

/// Failure to reconcile local state with a remote update.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Patch error: {0}")]
    Patch(#[from] PatchError),
    #[error("Patched document is not a valid game state: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("Board grids do not form a square board")]
    MalformedBoard,
}

/// Why a local intent was refused by the rule engine.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleError {
    #[error("No open peer connection")]
    NotConnected,
    #[error("Game is not in progress")]
    NotInProgress,
    #[error("Not your turn")]
    NotYourTurn,
    #[error("Line is already claimed")]
    LineTaken,
    #[error("Line is outside the board")]
    OutOfBounds,
    #[error("Display name is empty")]
    EmptyName,
    #[error("The host must choose a board size")]
    MissingSize,
    #[error("Players can only join while awaiting players")]
    NotAwaitingPlayers,
    #[error("Game is not finished")]
    NotFinished,
    #[error("Only the host can start a new game")]
    NotHost,
}

/// Errors from the session transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("No peer connection")]
    NoConnection,
    #[error("Session transport is shut down")]
    Closed,
    #[error("Message too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: u32 },
    #[error("Message cannot be encoded: {0}")]
    Encode(String),
}

/// Errors from the rendezvous broker.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Peer {0} is not registered with the broker")]
    UnknownPeer(String),
    #[error("Peer id {0} is already registered")]
    IdTaken(String),
    #[error("Broker link is down")]
    Disconnected,
    #[error("Broker protocol error: {0}")]
    Protocol(String),
    #[error("Broker I/O error: {0}")]
    Io(#[from] std::io::Error),
}
