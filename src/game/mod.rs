//! Game rules and the replicated state they operate on.

pub mod rules;
pub mod state;

pub use rules::{ClaimResult, GameEngine};
pub use state::{
    Board, BoardSize, CellState, GameProgress, GameState, Line, LineKind, Outcome, PlayerState,
    Players, Role,
};
