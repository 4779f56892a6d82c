use rand::seq::IndexedRandom;
use rand::Rng;

use crate::game::{Board, GameState, Line};

/// Chooses moves for one side of a match.
pub trait Player {
    /// Display name submitted when the match is set up.
    fn name(&self) -> &str;

    /// Pick the next line to claim, or `None` if the board is full.
    fn choose_line(&mut self, state: &GameState) -> Option<Line>;
}

/// Closes a box whenever it can, otherwise plays a random free line.
pub struct GreedyPlayer<R: Rng> {
    name: String,
    rng: R,
}

impl<R: Rng> GreedyPlayer<R> {
    pub fn new(name: impl Into<String>, rng: R) -> Self {
        Self {
            name: name.into(),
            rng,
        }
    }
}

/// Free lines that would complete at least one cell.
pub fn closing_lines(board: &Board) -> Vec<Line> {
    board
        .free_lines()
        .into_iter()
        .filter(|&line| {
            board.adjacent_cells(line).into_iter().any(|(row, col)| {
                Board::cell_edges(row, col)
                    .iter()
                    .filter(|&&edge| edge != line && board.line(edge) != Some(true))
                    .count()
                    == 0
            })
        })
        .collect()
}

impl<R: Rng> Player for GreedyPlayer<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn choose_line(&mut self, state: &GameState) -> Option<Line> {
        let closing = closing_lines(&state.board);
        if let Some(line) = closing.choose(&mut self.rng) {
            return Some(*line);
        }
        state.board.free_lines().choose(&mut self.rng).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn prefers_closing_a_box() {
        let mut state = GameState {
            board: Board::new(2),
            ..GameState::default()
        };
        for line in [Line::h(0, 0), Line::h(1, 0), Line::v(0, 0)] {
            *state.board.line_mut(line).unwrap() = true;
        }
        assert_eq!(closing_lines(&state.board), vec![Line::v(0, 1)]);

        let mut player = GreedyPlayer::new("Bot", SmallRng::seed_from_u64(7));
        for _ in 0..10 {
            assert_eq!(player.choose_line(&state), Some(Line::v(0, 1)));
        }
    }

    #[test]
    fn full_board_has_no_move() {
        let mut state = GameState {
            board: Board::new(1),
            ..GameState::default()
        };
        for line in Board::cell_edges(0, 0) {
            *state.board.line_mut(line).unwrap() = true;
        }
        let mut player = GreedyPlayer::new("Bot", SmallRng::seed_from_u64(1));
        assert_eq!(player.choose_line(&state), None);
    }
}
