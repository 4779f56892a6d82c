//! Turn-based rules over [`GameState`].
//!
//! [`GameEngine`] owns the local copy of the state together with the locally
//! derived role and progress. Intents (`submit_player`, `claim_line`,
//! `start_new_game`) mutate the state and never touch progress; callers diff
//! the state around an intent and then call [`GameEngine::update_progress`],
//! which applies the deterministic, locally derived changes (board allocation
//! on match start) that both peers perform on their own.

use log::{debug, info};

use crate::config::BoardSize;
use crate::error::RuleError;
use crate::game::state::{Board, CellState, GameProgress, GameState, Line, Outcome, PlayerState, Role};
use crate::link::ConnectionStatus;

/// Result of an accepted line claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimResult {
    pub line: Line,
    /// Cells closed by this claim (0, 1 or 2).
    pub closed: u32,
    /// Whose move is next.
    pub next_turn: Role,
}

/// Rule engine plus the local copy of the shared state.
#[derive(Debug, Clone, Default)]
pub struct GameEngine {
    state: GameState,
    role: Option<Role>,
    progress: GameProgress,
}

impl GameEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with a fixed role and progress, for replaying stored states.
    pub fn with_state(state: GameState, role: Role, progress: GameProgress) -> Self {
        Self {
            state,
            role: Some(role),
            progress,
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Local role, fixed by the first opened connection.
    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn progress(&self) -> GameProgress {
        self.progress
    }

    pub fn is_my_turn(&self) -> bool {
        self.progress == GameProgress::InProgress
            && self.role.is_some()
            && self.state.current_turn == self.role
    }

    /// Winner by score, once the game is finished.
    pub fn outcome(&self) -> Option<Outcome> {
        if self.progress != GameProgress::Finished {
            return None;
        }
        self.state.outcome()
    }

    /// React to a connection status transition. Returns the new progress if
    /// it changed.
    pub fn on_connection_status(&mut self, status: ConnectionStatus) -> Option<GameProgress> {
        match status {
            ConnectionStatus::Connected | ConnectionStatus::Joined => {
                if self.role.is_none() {
                    let role = if status == ConnectionStatus::Connected {
                        Role::Host
                    } else {
                        Role::Joined
                    };
                    info!("Playing as {}", role);
                    self.role = Some(role);
                }
                if self.progress == GameProgress::NotStarted {
                    let changed = self.set_progress(GameProgress::AwaitingPlayers);
                    // Lobby patches may have arrived while the link was down.
                    return self.update_progress().or(changed);
                }
                None
            }
            // The lobby itself is kept: the peer still holds the same state.
            ConnectionStatus::Disconnected if self.progress == GameProgress::AwaitingPlayers => {
                self.set_progress(GameProgress::NotStarted)
            }
            _ => None,
        }
    }

    /// Register the local player as ready. The host must also pick the board
    /// size; a size passed by the joined player is ignored.
    pub fn submit_player(&mut self, name: &str, size: Option<BoardSize>) -> Result<(), RuleError> {
        let role = self.role.ok_or(RuleError::NotConnected)?;
        if self.progress != GameProgress::AwaitingPlayers {
            return Err(RuleError::NotAwaitingPlayers);
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(RuleError::EmptyName);
        }
        if role == Role::Host {
            self.state.size = Some(size.ok_or(RuleError::MissingSize)?);
        }
        self.state.players.set(role, PlayerState::ready(name));
        debug!("{} ready as {:?}", role, name);
        Ok(())
    }

    /// Claim `line` for the local player.
    ///
    /// On success the line is claimed, `moves` incremented, every adjacent cell
    /// whose four edges are now claimed is assigned to the local role and
    /// scored. The turn passes to the other role only when no cell was closed.
    /// On error the state is untouched.
    pub fn claim_line(&mut self, line: Line, status: ConnectionStatus) -> Result<ClaimResult, RuleError> {
        if !status.is_open() {
            return Err(RuleError::NotConnected);
        }
        if self.progress != GameProgress::InProgress {
            return Err(RuleError::NotInProgress);
        }
        let role = match self.role {
            Some(role) if self.state.current_turn == Some(role) => role,
            _ => return Err(RuleError::NotYourTurn),
        };
        match self.state.board.line(line) {
            None => return Err(RuleError::OutOfBounds),
            Some(true) => return Err(RuleError::LineTaken),
            Some(false) => {}
        }

        if let Some(claimed) = self.state.board.line_mut(line) {
            *claimed = true;
        }
        self.state.moves = Some(self.state.move_count() + 1);

        let mut closed = 0;
        for (row, col) in self.state.board.adjacent_cells(line) {
            let enclosed = self.state.board.is_enclosed(row, col);
            if let Some(cell) = self.state.board.cell_mut(row, col) {
                if cell.is_free() && enclosed {
                    *cell = CellState::owned_by(role);
                    closed += 1;
                }
            }
        }

        let next_turn = if closed > 0 {
            if let Some(player) = self.state.players.get_mut(role) {
                player.score += closed;
            }
            role
        } else {
            role.other()
        };
        self.state.current_turn = Some(next_turn);

        debug!(
            "{} claimed {} (move {}, closed {})",
            role,
            line,
            self.state.move_count(),
            closed
        );
        Ok(ClaimResult {
            line,
            closed,
            next_turn,
        })
    }

    /// Reset to the default state. Host only, after the match is finished.
    pub fn start_new_game(&mut self) -> Result<(), RuleError> {
        if self.progress != GameProgress::Finished {
            return Err(RuleError::NotFinished);
        }
        if self.role != Some(Role::Host) {
            return Err(RuleError::NotHost);
        }
        self.state = GameState::default();
        info!("Starting a new game");
        Ok(())
    }

    /// Replace the local state with one received from the peer.
    pub fn replace_state(&mut self, state: GameState) {
        self.state = state;
    }

    /// Re-derive progress from the state. Returns the final progress if it changed.
    pub fn update_progress(&mut self) -> Option<GameProgress> {
        let mut changed = None;
        // Bounded: a full cycle is four transitions.
        for _ in 0..4 {
            let next = match self.progress {
                GameProgress::AwaitingPlayers if self.state.players.both_ready() => {
                    self.begin_match();
                    GameProgress::InProgress
                }
                GameProgress::InProgress if self.state.board.all_owned() => GameProgress::Finished,
                GameProgress::Finished if self.state.size.is_none() => GameProgress::AwaitingPlayers,
                _ => break,
            };
            changed = self.set_progress(next).or(changed);
        }
        changed
    }

    fn begin_match(&mut self) {
        // A board adopted from the peer during resync is kept as is.
        if self.state.board.is_allocated() {
            self.state.current_turn.get_or_insert(Role::Host);
            self.state.moves.get_or_insert(0);
            return;
        }
        let size = self.state.size.unwrap_or_default();
        self.state.board = Board::new(size.dimension());
        self.state.current_turn = Some(Role::Host);
        self.state.moves = Some(0);
    }

    fn set_progress(&mut self, progress: GameProgress) -> Option<GameProgress> {
        if self.progress == progress {
            return None;
        }
        info!("Game progress {:?} -> {:?}", self.progress, progress);
        self.progress = progress;
        Some(progress)
    }
}
