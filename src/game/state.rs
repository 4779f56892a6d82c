//! Shared, replicated game state.
//!
//! This is the object both peers hold a copy of. Its JSON form is the
//! document patches are computed against, so field names and optionality
//! here define the wire schema.

use core::fmt;

use serde::{Deserialize, Serialize};

pub use crate::config::BoardSize;

/// Which side of the session a peer plays. The initiator of the peer
/// connection is `Joined`, the side that accepted it is `Host`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joined,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Host => Role::Joined,
            Role::Joined => Role::Host,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => f.write_str("host"),
            Role::Joined => f.write_str("joined"),
        }
    }
}

/// Ownership of a single box.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellState {
    #[default]
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "host")]
    HostOwned,
    #[serde(rename = "joined")]
    JoinedOwned,
}

impl CellState {
    pub fn owned_by(role: Role) -> CellState {
        match role {
            Role::Host => CellState::HostOwned,
            Role::Joined => CellState::JoinedOwned,
        }
    }

    pub fn owner(self) -> Option<Role> {
        match self {
            CellState::Free => None,
            CellState::HostOwned => Some(Role::Host),
            CellState::JoinedOwned => Some(Role::Joined),
        }
    }

    pub fn is_free(self) -> bool {
        self == CellState::Free
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub name: String,
    pub score: u32,
    pub ready: bool,
}

impl PlayerState {
    pub fn ready(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            score: 0,
            ready: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Players {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<PlayerState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub joined: Option<PlayerState>,
}

impl Players {
    pub fn get(&self, role: Role) -> Option<&PlayerState> {
        match role {
            Role::Host => self.host.as_ref(),
            Role::Joined => self.joined.as_ref(),
        }
    }

    pub fn get_mut(&mut self, role: Role) -> Option<&mut PlayerState> {
        match role {
            Role::Host => self.host.as_mut(),
            Role::Joined => self.joined.as_mut(),
        }
    }

    pub fn set(&mut self, role: Role, player: PlayerState) {
        match role {
            Role::Host => self.host = Some(player),
            Role::Joined => self.joined = Some(player),
        }
    }

    pub fn both_ready(&self) -> bool {
        matches!((&self.host, &self.joined), (Some(h), Some(j)) if h.ready && j.ready)
    }
}

/// Orientation of a line on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineKind {
    #[serde(rename = "h")]
    Horizontal,
    #[serde(rename = "v")]
    Vertical,
}

/// A claimable edge. Horizontal lines are indexed `[row][col]` in an
/// `(N+1) x N` grid, vertical lines in an `N x (N+1)` grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Line {
    pub kind: LineKind,
    pub row: usize,
    pub col: usize,
}

impl Line {
    pub const fn h(row: usize, col: usize) -> Self {
        Self {
            kind: LineKind::Horizontal,
            row,
            col,
        }
    }

    pub const fn v(row: usize, col: usize) -> Self {
        Self {
            kind: LineKind::Vertical,
            row,
            col,
        }
    }
}

impl fmt::Display for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            LineKind::Horizontal => 'h',
            LineKind::Vertical => 'v',
        };
        write!(f, "{}({},{})", kind, self.row, self.col)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub cells: Vec<Vec<CellState>>,
    pub h_lines: Vec<Vec<bool>>,
    pub v_lines: Vec<Vec<bool>>,
}

impl Board {
    /// All cells free, all lines unclaimed.
    pub fn new(dimension: usize) -> Self {
        Self {
            cells: vec![vec![CellState::Free; dimension]; dimension],
            h_lines: vec![vec![false; dimension]; dimension + 1],
            v_lines: vec![vec![false; dimension + 1]; dimension],
        }
    }

    pub fn dimension(&self) -> usize {
        self.cells.len()
    }

    pub fn is_allocated(&self) -> bool {
        !self.cells.is_empty()
    }

    /// Claimed flag of `line`, or `None` when it lies outside the board.
    pub fn line(&self, line: Line) -> Option<bool> {
        let grid = match line.kind {
            LineKind::Horizontal => &self.h_lines,
            LineKind::Vertical => &self.v_lines,
        };
        grid.get(line.row).and_then(|r| r.get(line.col)).copied()
    }

    pub(crate) fn line_mut(&mut self, line: Line) -> Option<&mut bool> {
        let grid = match line.kind {
            LineKind::Horizontal => &mut self.h_lines,
            LineKind::Vertical => &mut self.v_lines,
        };
        grid.get_mut(line.row).and_then(|r| r.get_mut(line.col))
    }

    pub fn cell(&self, row: usize, col: usize) -> Option<CellState> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    pub(crate) fn cell_mut(&mut self, row: usize, col: usize) -> Option<&mut CellState> {
        self.cells.get_mut(row).and_then(|r| r.get_mut(col))
    }

    /// Whether the grids have the shapes of an `n x n` board (or are all
    /// empty for an unallocated one).
    pub fn is_well_formed(&self) -> bool {
        let n = self.dimension();
        if n == 0 {
            return self.h_lines.is_empty() && self.v_lines.is_empty();
        }
        self.cells.iter().all(|row| row.len() == n)
            && self.h_lines.len() == n + 1
            && self.h_lines.iter().all(|row| row.len() == n)
            && self.v_lines.len() == n
            && self.v_lines.iter().all(|row| row.len() == n + 1)
    }

    /// The four edges bounding cell `(row, col)`: top, bottom, left, right.
    pub fn cell_edges(row: usize, col: usize) -> [Line; 4] {
        [
            Line::h(row, col),
            Line::h(row + 1, col),
            Line::v(row, col),
            Line::v(row, col + 1),
        ]
    }

    /// Whether every edge of cell `(row, col)` is claimed.
    pub fn is_enclosed(&self, row: usize, col: usize) -> bool {
        Self::cell_edges(row, col)
            .iter()
            .all(|edge| self.line(*edge).unwrap_or(false))
    }

    /// Cells sharing `line` as an edge (at most two).
    pub fn adjacent_cells(&self, line: Line) -> Vec<(usize, usize)> {
        let n = self.dimension();
        let mut cells = Vec::with_capacity(2);
        match line.kind {
            LineKind::Horizontal => {
                if line.row > 0 && line.row <= n && line.col < n {
                    cells.push((line.row - 1, line.col));
                }
                if line.row < n && line.col < n {
                    cells.push((line.row, line.col));
                }
            }
            LineKind::Vertical => {
                if line.col > 0 && line.col <= n && line.row < n {
                    cells.push((line.row, line.col - 1));
                }
                if line.col < n && line.row < n {
                    cells.push((line.row, line.col));
                }
            }
        }
        cells
    }

    /// Every line not yet claimed, horizontal lines first.
    pub fn free_lines(&self) -> Vec<Line> {
        let horizontal = self.h_lines.iter().enumerate().flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, claimed)| !**claimed)
                .map(move |(c, _)| Line::h(r, c))
        });
        let vertical = self.v_lines.iter().enumerate().flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .filter(|(_, claimed)| !**claimed)
                .map(move |(c, _)| Line::v(r, c))
        });
        horizontal.chain(vertical).collect()
    }

    pub fn all_owned(&self) -> bool {
        self.is_allocated() && self.cells.iter().flatten().all(|c| !c.is_free())
    }

    pub fn owned_count(&self, role: Role) -> usize {
        let target = CellState::owned_by(role);
        self.cells.iter().flatten().filter(|c| **c == target).count()
    }
}

/// The single replicated object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<BoardSize>,
    #[serde(default)]
    pub players: Players,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_turn: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moves: Option<u32>,
    #[serde(default)]
    pub board: Board,
}

impl GameState {
    /// Accepted claims so far; unset counts as zero.
    pub fn move_count(&self) -> u32 {
        self.moves.unwrap_or(0)
    }

    pub fn score(&self, role: Role) -> u32 {
        self.players.get(role).map(|p| p.score).unwrap_or(0)
    }

    /// Winner by score. Only meaningful once every cell is owned.
    pub fn outcome(&self) -> Option<Outcome> {
        if !self.board.all_owned() {
            return None;
        }
        let host = self.score(Role::Host);
        let joined = self.score(Role::Joined);
        Some(match host.cmp(&joined) {
            core::cmp::Ordering::Greater => Outcome::HostWins,
            core::cmp::Ordering::Less => Outcome::JoinedWins,
            core::cmp::Ordering::Equal => Outcome::Draw,
        })
    }
}

/// Locally derived phase of the match. Never transmitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum GameProgress {
    #[default]
    NotStarted,
    AwaitingPlayers,
    InProgress,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    HostWins,
    JoinedWins,
    Draw,
}

impl Outcome {
    pub fn winner(self) -> Option<Role> {
        match self {
            Outcome::HostWins => Some(Role::Host),
            Outcome::JoinedWins => Some(Role::Joined),
            Outcome::Draw => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn board_dimensions_follow_size() {
        let board = Board::new(BoardSize::Small.dimension());
        assert_eq!(board.cells.len(), 6);
        assert_eq!(board.h_lines.len(), 7);
        assert!(board.h_lines.iter().all(|r| r.len() == 6));
        assert_eq!(board.v_lines.len(), 6);
        assert!(board.v_lines.iter().all(|r| r.len() == 7));
        assert_eq!(board.free_lines().len(), 2 * 6 * 7);
    }

    #[test]
    fn adjacent_cells_at_edges_and_interior() {
        let board = Board::new(3);
        assert_eq!(board.adjacent_cells(Line::h(0, 0)), vec![(0, 0)]);
        assert_eq!(board.adjacent_cells(Line::h(3, 2)), vec![(2, 2)]);
        assert_eq!(board.adjacent_cells(Line::h(1, 1)), vec![(0, 1), (1, 1)]);
        assert_eq!(board.adjacent_cells(Line::v(0, 0)), vec![(0, 0)]);
        assert_eq!(board.adjacent_cells(Line::v(2, 3)), vec![(2, 2)]);
        assert_eq!(board.adjacent_cells(Line::v(1, 2)), vec![(1, 1), (1, 2)]);
        assert!(board.adjacent_cells(Line::v(3, 0)).is_empty());
    }

    #[test]
    fn default_state_json_omits_unset_fields() {
        let value = serde_json::to_value(GameState::default()).unwrap();
        assert_eq!(
            value,
            json!({"players": {}, "board": {"cells": [], "hLines": [], "vLines": []}})
        );
    }

    #[test]
    fn populated_state_uses_wire_names() {
        let mut state = GameState {
            size: Some(BoardSize::Small),
            current_turn: Some(Role::Joined),
            moves: Some(3),
            board: Board::new(1),
            ..GameState::default()
        };
        state.players.set(Role::Host, PlayerState::ready("Ann"));
        state.board.cells[0][0] = CellState::HostOwned;

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["size"], "small");
        assert_eq!(value["currentTurn"], "joined");
        assert_eq!(value["players"]["host"]["ready"], true);
        assert_eq!(value["board"]["cells"][0][0], "host");
        assert_eq!(value["board"]["hLines"], json!([[false], [false]]));

        let back: GameState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn outcome_requires_full_board() {
        let mut state = GameState {
            board: Board::new(1),
            ..GameState::default()
        };
        assert_eq!(state.outcome(), None);
        state.board.cells[0][0] = CellState::JoinedOwned;
        state.players.set(
            Role::Joined,
            PlayerState {
                name: "Bo".into(),
                score: 1,
                ready: true,
            },
        );
        assert_eq!(state.outcome(), Some(Outcome::JoinedWins));
    }
}
