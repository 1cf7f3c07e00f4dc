use async_trait::async_trait;
use chess::{Board, BoardStatus, ChessMove, Color, MoveGen, Piece};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::error::SelectionError;
use crate::game::GameState;

/// Picks the move to play. Implementations may be slow; the orchestrator runs
/// each call on its own task so other games keep flowing.
#[async_trait]
pub trait MoveSelector: Send + Sync {
    async fn select(&self, state: &GameState) -> Result<ChessMove, SelectionError>;

    fn name(&self) -> &str {
        "selector"
    }
}

/// Uniformly random legal move.
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomSelector;

#[async_trait]
impl MoveSelector for RandomSelector {
    async fn select(&self, state: &GameState) -> Result<ChessMove, SelectionError> {
        let moves: Vec<ChessMove> = state.position.legal_moves().collect();
        moves
            .choose(&mut thread_rng())
            .copied()
            .ok_or(SelectionError::NoMove)
    }

    fn name(&self) -> &str {
        "random"
    }
}

const PAWN_VALUE: i32 = 100;
const KNIGHT_VALUE: i32 = 300;
const BISHOP_VALUE: i32 = 320;
const ROOK_VALUE: i32 = 500;
const QUEEN_VALUE: i32 = 900;
const MATE_SCORE: i32 = 100_000;

// Pawn advancement bonus by rank, from White's side.
const PAWN_RANK_BONUS: [i32; 8] = [0, 5, 10, 20, 30, 50, 80, 0];

/// Shallow fixed-depth alpha-beta over material. Runs on the blocking pool.
#[derive(Clone, Copy, Debug)]
pub struct MaterialSelector {
    depth: u32,
}

impl MaterialSelector {
    pub fn new(depth: u32) -> Self {
        Self {
            depth: depth.max(1),
        }
    }
}

impl Default for MaterialSelector {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl MoveSelector for MaterialSelector {
    async fn select(&self, state: &GameState) -> Result<ChessMove, SelectionError> {
        let board = *state.position.as_chess_board();
        let depth = self.depth;
        tokio::task::spawn_blocking(move || search(&board, depth))
            .await
            .map_err(|e| SelectionError::Failed(e.to_string()))?
            .ok_or(SelectionError::NoMove)
    }

    fn name(&self) -> &str {
        "material"
    }
}

pub fn search(board: &Board, depth: u32) -> Option<ChessMove> {
    let mut best: Option<(ChessMove, i32)> = None;
    let mut alpha = -MATE_SCORE - 1;
    for mv in MoveGen::new_legal(board) {
        let next = board.make_move_new(mv);
        let score = -alpha_beta(&next, depth.saturating_sub(1), -MATE_SCORE - 1, -alpha, 1);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((mv, score));
        }
        alpha = alpha.max(score);
    }
    best.map(|(mv, _)| mv)
}

// Negamax: scores are from the side to move.
fn alpha_beta(board: &Board, depth: u32, mut alpha: i32, beta: i32, ply: i32) -> i32 {
    match board.status() {
        BoardStatus::Checkmate => return -MATE_SCORE + ply,
        BoardStatus::Stalemate => return 0,
        BoardStatus::Ongoing => {}
    }
    if depth == 0 {
        return evaluate(board);
    }
    for mv in MoveGen::new_legal(board) {
        let score = -alpha_beta(&board.make_move_new(mv), depth - 1, -beta, -alpha, ply + 1);
        if score >= beta {
            return beta;
        }
        alpha = alpha.max(score);
    }
    alpha
}

pub fn evaluate(board: &Board) -> i32 {
    let mut score = 0;
    for square in *board.combined() {
        let (Some(piece), Some(color)) = (board.piece_on(square), board.color_on(square)) else {
            continue;
        };
        let value = match piece {
            Piece::Pawn => {
                let rank = square.get_rank().to_index();
                let rank = if color == Color::White { rank } else { 7 - rank };
                PAWN_VALUE + PAWN_RANK_BONUS[rank]
            }
            Piece::Knight => KNIGHT_VALUE,
            Piece::Bishop => BISHOP_VALUE,
            Piece::Rook => ROOK_VALUE,
            Piece::Queen => QUEEN_VALUE,
            Piece::King => 0,
        };
        score += if color == board.side_to_move() { value } else { -value };
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{parse_uci, Position, TerminalStatus};
    use crate::game::{Clock, Phase};
    use crate::protocol::Side;

    fn state_for(fen: &str) -> GameState {
        let position = Position::from_fen(fen).unwrap();
        GameState {
            game_id: "g1".to_string(),
            side_to_move: position.side_to_move().into(),
            our_side: Side::White,
            position,
            move_history: Vec::new(),
            clock: Clock::default(),
            phase: Phase::Middlegame,
            terminal: TerminalStatus::None,
        }
    }

    #[tokio::test]
    async fn random_selector_plays_legal_moves() {
        let state = state_for("startpos");
        for _ in 0..10 {
            let mv = RandomSelector.select(&state).await.unwrap();
            assert!(state.position.legal(mv));
        }
    }

    #[tokio::test]
    async fn random_selector_fails_without_moves() {
        // fool's mate, white to move and mated
        let state = state_for("rnb1kbnr/pppp1ppp/8/4p3/6Pq/5P2/PPPPP2P/RNBQKBNR w KQkq - 1 3");
        assert_eq!(RandomSelector.select(&state).await, Err(SelectionError::NoMove));
    }

    #[tokio::test]
    async fn material_selector_takes_hanging_queen() {
        let state = state_for("4k3/8/8/3q4/8/8/8/3QK3 w - - 0 1");
        let mv = MaterialSelector::new(2).select(&state).await.unwrap();
        assert_eq!(mv, parse_uci("d1d5").unwrap());
    }

    #[tokio::test]
    async fn material_selector_finds_back_rank_mate() {
        let state = state_for("6k1/5ppp/8/8/8/8/5PPP/R5K1 w - - 0 1");
        let mv = MaterialSelector::default().select(&state).await.unwrap();
        assert_eq!(mv, parse_uci("a1a8").unwrap());
    }

    #[test]
    fn evaluation_is_symmetric_at_start() {
        assert_eq!(evaluate(&Board::default()), 0);
    }
}
