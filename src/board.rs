use chess::{BitBoard, Board as ChessBoard, BoardStatus, ChessMove, Color, MoveGen, Piece, Square};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MoveError;

pub const STARTPOS: &str = "startpos";

/// Outcome the rules alone can decide, independent of clocks or resignation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TerminalStatus {
    None,
    Checkmate,
    Stalemate,
    Draw,
    InsufficientMaterial,
    Repetition,
}

impl TerminalStatus {
    pub fn is_terminal(self) -> bool {
        self != TerminalStatus::None
    }
}

/// A board plus the bits of history the `chess` crate does not track:
/// the fifty-move counter and the hashes needed for repetition.
#[derive(Clone, Debug)]
pub struct Position {
    inner: ChessBoard,
    halfmove_clock: u32,
    // hashes since the last irreversible move, current position last
    history: Vec<u64>,
}

impl Position {
    pub fn new() -> Self {
        Self::from_chess_board(ChessBoard::default(), 0)
    }

    /// Accepts either `startpos` or a FEN string.
    pub fn from_fen(fen: &str) -> Result<Self, String> {
        let fen = fen.trim();
        if fen.is_empty() || fen == STARTPOS {
            return Ok(Self::new());
        }
        let board = ChessBoard::from_str(fen).map_err(|e| e.to_string())?;
        let halfmove_clock = fen
            .split_whitespace()
            .nth(4)
            .and_then(|field| field.parse().ok())
            .unwrap_or(0);
        Ok(Self::from_chess_board(board, halfmove_clock))
    }

    fn from_chess_board(board: ChessBoard, halfmove_clock: u32) -> Self {
        Self {
            inner: board,
            halfmove_clock,
            history: vec![board.get_hash()],
        }
    }

    pub fn legal(&self, mv: ChessMove) -> bool {
        self.inner.legal(mv)
    }

    /// Applies a move already known to be legal.
    pub fn make_move(&self, mv: ChessMove) -> Self {
        let irreversible = self.inner.piece_on(mv.get_source()) == Some(Piece::Pawn)
            || self.inner.piece_on(mv.get_dest()).is_some();
        let next = self.inner.make_move_new(mv);
        let (halfmove_clock, mut history) = if irreversible {
            (0, Vec::new())
        } else {
            (self.halfmove_clock + 1, self.history.clone())
        };
        history.push(next.get_hash());
        Self {
            inner: next,
            halfmove_clock,
            history,
        }
    }

    pub fn legal_moves(&self) -> MoveGen {
        MoveGen::new_legal(&self.inner)
    }

    pub fn side_to_move(&self) -> Color {
        self.inner.side_to_move()
    }

    pub fn is_check(&self) -> bool {
        self.inner.checkers().popcnt() > 0
    }

    pub fn halfmove_clock(&self) -> u32 {
        self.halfmove_clock
    }

    pub fn repetitions(&self) -> usize {
        let current = self.inner.get_hash();
        self.history.iter().filter(|&&h| h == current).count()
    }

    pub fn to_fen(&self) -> String {
        self.inner.to_string()
    }

    pub fn as_chess_board(&self) -> &ChessBoard {
        &self.inner
    }

    fn insufficient_material(&self) -> bool {
        let board = &self.inner;
        let heavy = *board.pieces(Piece::Pawn) | *board.pieces(Piece::Rook) | *board.pieces(Piece::Queen);
        if heavy != BitBoard(0) {
            return false;
        }
        let knights = board.pieces(Piece::Knight).popcnt();
        let bishops = *board.pieces(Piece::Bishop);
        match (knights, bishops.popcnt()) {
            (0, 0) | (1, 0) | (0, 1) => true,
            // bishops all on one square colour can never mate
            (0, _) => {
                let light = bishops.into_iter().filter(|sq| is_light(*sq)).count();
                light == 0 || light == bishops.popcnt() as usize
            }
            _ => false,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

fn is_light(square: Square) -> bool {
    (square.get_rank().to_index() + square.get_file().to_index()) % 2 == 1
}

/// Parses a UCI move such as `e2e4` or `e7e8q`.
pub fn parse_uci(move_str: &str) -> Result<ChessMove, MoveError> {
    let bad = || MoveError::Parse(move_str.to_string());
    if !(4..=5).contains(&move_str.len()) || !move_str.is_ascii() {
        return Err(bad());
    }
    let from = Square::from_str(&move_str[0..2]).map_err(|_| bad())?;
    let to = Square::from_str(&move_str[2..4]).map_err(|_| bad())?;
    let promotion = match move_str[4..].chars().next() {
        None => None,
        Some(c) => Some(match c.to_ascii_lowercase() {
            'q' => Piece::Queen,
            'r' => Piece::Rook,
            'b' => Piece::Bishop,
            'n' => Piece::Knight,
            _ => return Err(bad()),
        }),
    };
    Ok(ChessMove::new(from, to, promotion))
}

/// Board legality as the session layer sees it. Moves travel as UCI strings,
/// the format the server uses in its move lists.
pub trait RulesEngine: Send + Sync {
    fn apply_move(&self, position: &Position, mv: &str) -> Result<Position, MoveError>;

    fn legal_moves(&self, position: &Position) -> Vec<ChessMove>;

    fn terminal_status(&self, position: &Position) -> TerminalStatus;
}

/// Standard chess rules backed by the `chess` crate.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChessRules;

impl RulesEngine for ChessRules {
    fn apply_move(&self, position: &Position, mv: &str) -> Result<Position, MoveError> {
        let chess_move = parse_uci(mv)?;
        if !position.legal(chess_move) {
            return Err(MoveError::Illegal(mv.to_string()));
        }
        Ok(position.make_move(chess_move))
    }

    fn legal_moves(&self, position: &Position) -> Vec<ChessMove> {
        position.legal_moves().collect()
    }

    fn terminal_status(&self, position: &Position) -> TerminalStatus {
        match position.as_chess_board().status() {
            BoardStatus::Checkmate => TerminalStatus::Checkmate,
            BoardStatus::Stalemate => TerminalStatus::Stalemate,
            BoardStatus::Ongoing => {
                if position.insufficient_material() {
                    TerminalStatus::InsufficientMaterial
                } else if position.repetitions() >= 3 {
                    TerminalStatus::Repetition
                } else if position.halfmove_clock() >= 100 {
                    TerminalStatus::Draw
                } else {
                    TerminalStatus::None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(rules: &ChessRules, moves: &[&str]) -> Position {
        moves.iter().fold(Position::new(), |pos, mv| {
            rules.apply_move(&pos, mv).unwrap()
        })
    }

    #[test]
    fn test_fen_parsing() {
        let fen = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";
        let position = Position::from_fen(fen).unwrap();
        assert_eq!(position.to_fen(), fen);
        assert_eq!(Position::from_fen(STARTPOS).unwrap().to_fen(), fen);
        assert!(Position::from_fen("not a fen").is_err());
    }

    #[test]
    fn test_apply_move() {
        let rules = ChessRules;
        let position = rules.apply_move(&Position::new(), "e2e4").unwrap();
        assert_eq!(
            position.to_fen(),
            "rnbqkbnr/pppppppp/8/8/4P3/8/PPPP1PPP/RNBQKBNR b KQkq e3 0 1"
        );
        assert_eq!(position.side_to_move(), Color::Black);
    }

    #[test]
    fn rejects_illegal_and_garbled_moves() {
        let rules = ChessRules;
        assert_eq!(
            rules.apply_move(&Position::new(), "e2e5").unwrap_err(),
            MoveError::Illegal("e2e5".to_string())
        );
        assert!(matches!(
            rules.apply_move(&Position::new(), "e2"),
            Err(MoveError::Parse(_))
        ));
        assert!(matches!(parse_uci("e7e8x"), Err(MoveError::Parse(_))));
        assert_eq!(
            parse_uci("e7e8q").unwrap(),
            ChessMove::new(Square::E7, Square::E8, Some(Piece::Queen))
        );
    }

    #[test]
    fn detects_checkmate() {
        let rules = ChessRules;
        let position = play(&rules, &["f2f3", "e7e5", "g2g4", "d8h4"]);
        assert_eq!(rules.terminal_status(&position), TerminalStatus::Checkmate);
        assert!(rules.legal_moves(&position).is_empty());
    }

    #[test]
    fn detects_threefold_repetition() {
        let rules = ChessRules;
        let shuffle = ["g1f3", "g8f6", "f3g1", "f6g8"];
        let once = play(&rules, &shuffle);
        assert_eq!(rules.terminal_status(&once), TerminalStatus::None);
        let moves: Vec<&str> = shuffle.iter().chain(shuffle.iter()).copied().collect();
        let twice = play(&rules, &moves);
        assert_eq!(rules.terminal_status(&twice), TerminalStatus::Repetition);
    }

    #[test]
    fn detects_insufficient_material() {
        let rules = ChessRules;
        let bare = Position::from_fen("8/8/4k3/8/8/3K4/8/8 w - - 0 1").unwrap();
        assert_eq!(rules.terminal_status(&bare), TerminalStatus::InsufficientMaterial);
        let rook = Position::from_fen("8/8/4k3/8/8/3K4/8/R7 w - - 0 1").unwrap();
        assert_eq!(rules.terminal_status(&rook), TerminalStatus::None);
    }

    #[test]
    fn fifty_move_counter_follows_fen_and_resets() {
        let rules = ChessRules;
        let position = Position::from_fen("8/8/4k3/8/8/3K4/8/R7 w - - 99 80").unwrap();
        assert_eq!(position.halfmove_clock(), 99);
        let quiet = rules.apply_move(&position, "a1a2").unwrap();
        assert_eq!(rules.terminal_status(&quiet), TerminalStatus::Draw);

        let pawn = rules.apply_move(&Position::new(), "e2e4").unwrap();
        assert_eq!(pawn.halfmove_clock(), 0);
    }
}
