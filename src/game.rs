use chess::{ChessMove, Piece};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::thread_rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::board::{Position, RulesEngine, TerminalStatus};
use crate::error::{DesyncError, SelectionError, TransportError};
use crate::protocol::{GameFull, GameStateRecord, GameStatus, Side};

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Clock {
    pub white_remaining: Duration,
    pub black_remaining: Duration,
    pub white_increment: Duration,
    pub black_increment: Duration,
}

impl Clock {
    pub fn from_state(state: &GameStateRecord) -> Self {
        Self {
            white_remaining: state.remaining(Side::White),
            black_remaining: state.remaining(Side::Black),
            white_increment: state.increment(Side::White),
            black_increment: state.increment(Side::Black),
        }
    }

    pub fn remaining(&self, side: Side) -> Duration {
        match side {
            Side::White => self.white_remaining,
            Side::Black => self.black_remaining,
        }
    }

    pub fn increment(&self, side: Side) -> Duration {
        match side {
            Side::White => self.white_increment,
            Side::Black => self.black_increment,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Opening,
    Middlegame,
    Endgame,
}

const OPENING_PLIES: usize = 20;
const ENDGAME_MATERIAL: u32 = 26; // non-pawn material of both sides, start is 62

impl Phase {
    fn of(position: &Position, ply: usize) -> Self {
        let board = position.as_chess_board();
        let material = board.pieces(Piece::Knight).popcnt() * 3
            + board.pieces(Piece::Bishop).popcnt() * 3
            + board.pieces(Piece::Rook).popcnt() * 5
            + board.pieces(Piece::Queen).popcnt() * 9;
        if material <= ENDGAME_MATERIAL {
            Phase::Endgame
        } else if ply < OPENING_PLIES {
            Phase::Opening
        } else {
            Phase::Middlegame
        }
    }
}

/// Read-only view handed to a move selector. Owns its data so it can cross
/// into a spawned task.
#[derive(Clone, Debug)]
pub struct GameState {
    pub game_id: String,
    pub position: Position,
    pub move_history: Vec<String>,
    pub side_to_move: Side,
    pub our_side: Side,
    pub clock: Clock,
    pub phase: Phase,
    pub terminal: TerminalStatus,
}

impl GameState {
    pub fn ply(&self) -> usize {
        self.move_history.len()
    }

    /// Time the selector may spend: a share of our remaining clock, optionally
    /// capped. Games without a running clock only get the cap.
    pub fn move_budget(&self, fraction: f64, cap: Option<Duration>) -> Option<Duration> {
        let remaining = self.clock.remaining(self.our_side);
        let share = if remaining.is_zero() {
            None
        } else {
            Some(remaining.mul_f64(fraction))
        };
        match (share, cap) {
            (Some(share), Some(cap)) => Some(share.min(cap)),
            (share, cap) => share.or(cap),
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum EndReason {
    /// The server reported a terminal status.
    Server {
        status: GameStatus,
        winner: Option<Side>,
    },
    /// `gameFinish` arrived without a final state.
    Finished,
    Desync { detail: String },
    Error { detail: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MoveStage {
    Selecting,
    /// `resubmitted` is set once the same move was sent a second time.
    Submitting { uci: String, fallback: bool, resubmitted: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionStatus {
    Created,
    Active,
    AwaitingMove { ply: usize, stage: MoveStage },
    Ended(EndReason),
}

impl SessionStatus {
    pub fn is_ended(&self) -> bool {
        matches!(self, SessionStatus::Ended(_))
    }
}

/// What the dispatcher has to do after feeding an event to a session.
#[derive(Clone, Debug)]
pub enum SessionAction {
    RequestMove { ply: usize, state: GameState },
    Submit { ply: usize, uci: String, fallback: bool },
    Ended(EndReason),
}

pub struct GameSession {
    id: String,
    our_side: Side,
    opponent: Option<String>,
    rules: Arc<dyn RulesEngine>,
    initial: Position,
    position: Position,
    moves: Vec<String>,
    clock: Clock,
    status: SessionStatus,
    // ply of the selector call still running, if any
    selection_in_flight: Option<usize>,
    last_event_at: DateTime<Utc>,
}

impl GameSession {
    pub fn new(
        id: impl Into<String>,
        our_side: Side,
        opponent: Option<String>,
        rules: Arc<dyn RulesEngine>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            our_side,
            opponent,
            rules,
            initial: Position::new(),
            position: Position::new(),
            moves: Vec::new(),
            clock: Clock::default(),
            status: SessionStatus::Created,
            selection_in_flight: None,
            last_event_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn our_side(&self) -> Side {
        self.our_side
    }

    pub fn opponent(&self) -> Option<&str> {
        self.opponent.as_deref()
    }

    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    pub fn move_count(&self) -> usize {
        self.moves.len()
    }

    pub fn moves(&self) -> &[String] {
        &self.moves
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn last_event_at(&self) -> DateTime<Utc> {
        self.last_event_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, after: Duration) -> bool {
        match chrono::Duration::from_std(after) {
            Ok(after) => now - self.last_event_at > after,
            Err(_) => false,
        }
    }

    pub fn selection_in_flight(&self) -> bool {
        self.selection_in_flight.is_some()
    }

    /// Side to move after `ply` half-moves from the initial position.
    pub fn side_to_move_at(&self, ply: usize) -> Side {
        let first: Side = self.initial.side_to_move().into();
        if ply % 2 == 0 {
            first
        } else {
            first.opposite()
        }
    }

    pub fn is_our_turn(&self) -> bool {
        self.side_to_move_at(self.moves.len()) == self.our_side
    }

    /// "win", "loss", "draw" or "unfinished", from our point of view.
    pub fn outcome(&self) -> &'static str {
        match &self.status {
            SessionStatus::Ended(EndReason::Server { winner: Some(w), .. }) if *w == self.our_side => "win",
            SessionStatus::Ended(EndReason::Server { winner: Some(_), .. }) => "loss",
            SessionStatus::Ended(EndReason::Server { status, .. })
                if matches!(status, GameStatus::Draw | GameStatus::Stalemate) =>
            {
                "draw"
            }
            _ => "unfinished",
        }
    }

    pub fn view(&self) -> GameState {
        GameState {
            game_id: self.id.clone(),
            position: self.position.clone(),
            move_history: self.moves.clone(),
            side_to_move: self.side_to_move_at(self.moves.len()),
            our_side: self.our_side,
            clock: self.clock,
            phase: Phase::of(&self.position, self.moves.len()),
            terminal: self.rules.terminal_status(&self.position),
        }
    }

    /// Full snapshot: activates a fresh session, or resynchronises one after a
    /// stream reconnect.
    pub fn on_snapshot(&mut self, full: &GameFull, now: DateTime<Utc>) -> Option<SessionAction> {
        if self.status.is_ended() {
            return None;
        }
        if self.status == SessionStatus::Created {
            match Position::from_fen(&full.initial_fen) {
                Ok(initial) => {
                    self.position = initial.clone();
                    self.initial = initial;
                }
                Err(e) => return Some(self.desync(DesyncError::InitialPosition(e))),
            }
            self.status = SessionStatus::Active;
            debug!(game_id = %self.id, fen = %full.initial_fen, "session activated");
            return self.apply_state(&full.state, now, true);
        }
        self.apply_state(&full.state, now, false)
    }

    /// Incremental state from the game stream. Repeats of an already seen move
    /// list are no-ops.
    pub fn on_update(&mut self, state: &GameStateRecord, now: DateTime<Utc>) -> Option<SessionAction> {
        self.apply_state(state, now, false)
    }

    fn apply_state(
        &mut self,
        state: &GameStateRecord,
        now: DateTime<Utc>,
        activated: bool,
    ) -> Option<SessionAction> {
        match self.status {
            SessionStatus::Ended(_) => return None,
            SessionStatus::Created => {
                debug!(game_id = %self.id, "state before snapshot, ignored");
                return None;
            }
            _ => {}
        }
        self.last_event_at = now;

        let known = self.moves.len();
        let server_moves = state.move_list();
        if let Err(e) = self.sync_moves(&server_moves) {
            return Some(self.desync(e));
        }
        if state.status.is_terminal() {
            self.clock = Clock::from_state(state);
            return Some(self.end(EndReason::Server {
                status: state.status,
                winner: state.winner,
            }));
        }
        if !activated && server_moves.len() <= known {
            // already seen, or our own move not echoed yet
            return None;
        }
        self.clock = Clock::from_state(state);

        if let SessionStatus::AwaitingMove { ply, .. } = self.status {
            if ply < self.moves.len() {
                self.status = SessionStatus::Active;
            }
        }
        self.maybe_request_move()
    }

    // Replays whatever the server has beyond our local history, checking that
    // the shared prefix agrees first.
    fn sync_moves(&mut self, server_moves: &[String]) -> Result<(), DesyncError> {
        for (index, (local, server)) in self.moves.iter().zip(server_moves).enumerate() {
            if local != server {
                return Err(DesyncError::HistoryMismatch {
                    index,
                    local: local.clone(),
                    server: server.clone(),
                });
            }
        }
        for index in self.moves.len()..server_moves.len() {
            let uci = &server_moves[index];
            let next = self
                .rules
                .apply_move(&self.position, uci)
                .map_err(|_| DesyncError::IllegalReplay {
                    index,
                    uci: uci.clone(),
                })?;
            self.position = next;
            self.moves.push(uci.clone());
        }
        Ok(())
    }

    fn maybe_request_move(&mut self) -> Option<SessionAction> {
        if self.status != SessionStatus::Active || !self.is_our_turn() {
            return None;
        }
        if self.selection_in_flight.is_some() {
            // the stale call must finish before a new one may start
            return None;
        }
        if self.rules.legal_moves(&self.position).is_empty() {
            return None;
        }
        let ply = self.moves.len();
        self.status = SessionStatus::AwaitingMove {
            ply,
            stage: MoveStage::Selecting,
        };
        self.selection_in_flight = Some(ply);
        Some(SessionAction::RequestMove {
            ply,
            state: self.view(),
        })
    }

    /// Result of the selector call started for `ply`.
    pub fn on_move_decided(
        &mut self,
        ply: usize,
        decision: Result<ChessMove, SelectionError>,
    ) -> Option<SessionAction> {
        if self.selection_in_flight == Some(ply) {
            self.selection_in_flight = None;
        }
        if self.status.is_ended() {
            debug!(game_id = %self.id, ply, "selection finished after game end, discarded");
            return None;
        }
        let current = SessionStatus::AwaitingMove {
            ply,
            stage: MoveStage::Selecting,
        };
        if self.status != current {
            debug!(game_id = %self.id, ply, "stale selection discarded");
            return self.maybe_request_move();
        }

        let chosen = match decision {
            Ok(mv) if self.position.legal(mv) => Some((mv.to_string(), false)),
            Ok(mv) => {
                warn!(game_id = %self.id, uci = %mv, "selector returned an illegal move, falling back");
                self.fallback_move(None).map(|uci| (uci, true))
            }
            Err(e) => {
                warn!(game_id = %self.id, error = %e, "selection failed, falling back");
                self.fallback_move(None).map(|uci| (uci, true))
            }
        };
        match chosen {
            Some((uci, fallback)) => {
                self.status = SessionStatus::AwaitingMove {
                    ply,
                    stage: MoveStage::Submitting {
                        uci: uci.clone(),
                        fallback,
                        resubmitted: false,
                    },
                };
                Some(SessionAction::Submit { ply, uci, fallback })
            }
            None => Some(self.end(EndReason::Error {
                detail: "no legal move to play".to_string(),
            })),
        }
    }

    /// Outcome of submitting `uci` for `ply`.
    ///
    /// A transient failure (network, 5xx) resends the same move once, since the
    /// first request may have landed. A rejection switches to an arbitrary legal
    /// move; a rejected fallback ends the session.
    pub fn on_submit_result(
        &mut self,
        ply: usize,
        uci: &str,
        result: Result<(), TransportError>,
    ) -> Option<SessionAction> {
        let (fallback, resubmitted) = match &self.status {
            SessionStatus::AwaitingMove {
                ply: p,
                stage:
                    MoveStage::Submitting {
                        uci: u,
                        fallback,
                        resubmitted,
                    },
            } if *p == ply && u == uci => (*fallback, *resubmitted),
            // the server already echoed the move, or the game is over
            _ => return None,
        };

        let error = match result {
            Ok(()) => {
                if self.moves.len() == ply {
                    match self.rules.apply_move(&self.position, uci) {
                        Ok(next) => {
                            self.position = next;
                            self.moves.push(uci.to_string());
                        }
                        Err(_) => {
                            return Some(self.desync(DesyncError::IllegalReplay {
                                index: ply,
                                uci: uci.to_string(),
                            }))
                        }
                    }
                }
                self.status = SessionStatus::Active;
                return self.maybe_request_move();
            }
            Err(e) => e,
        };

        if !error.is_rejection() && !resubmitted {
            warn!(game_id = %self.id, uci, error = %error, "move submission failed, sending it again");
            return Some(self.submitting(ply, uci.to_string(), fallback, true));
        }
        if fallback {
            return Some(self.end(EndReason::Error {
                detail: format!("fallback move {} failed: {}", uci, error),
            }));
        }
        warn!(game_id = %self.id, uci, error = %error, "move not accepted, switching to a fallback move");
        match self.fallback_move(Some(uci)) {
            Some(retry) => Some(self.submitting(ply, retry, true, false)),
            None => Some(self.end(EndReason::Error {
                detail: error.to_string(),
            })),
        }
    }

    fn submitting(&mut self, ply: usize, uci: String, fallback: bool, resubmitted: bool) -> SessionAction {
        self.status = SessionStatus::AwaitingMove {
            ply,
            stage: MoveStage::Submitting {
                uci: uci.clone(),
                fallback,
                resubmitted,
            },
        };
        SessionAction::Submit { ply, uci, fallback }
    }

    /// Arbitrary legal move, avoiding `not` when there is any alternative.
    fn fallback_move(&self, not: Option<&str>) -> Option<String> {
        let legal: Vec<String> = self
            .rules
            .legal_moves(&self.position)
            .into_iter()
            .map(|mv| mv.to_string())
            .collect();
        let preferred: Vec<&String> = legal.iter().filter(|uci| Some(uci.as_str()) != not).collect();
        let mut rng = thread_rng();
        match preferred.choose(&mut rng) {
            Some(uci) => Some((*uci).clone()),
            None => legal.choose(&mut rng).cloned(),
        }
    }

    /// Terminal transition. Later events for this session are ignored.
    pub fn end(&mut self, reason: EndReason) -> SessionAction {
        if let SessionStatus::Ended(existing) = &self.status {
            return SessionAction::Ended(existing.clone());
        }
        self.status = SessionStatus::Ended(reason.clone());
        SessionAction::Ended(reason)
    }

    fn desync(&mut self, err: DesyncError) -> SessionAction {
        warn!(game_id = %self.id, error = %err, "position desync, ending session");
        self.end(EndReason::Desync {
            detail: err.to_string(),
        })
    }
}
