use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::board::RulesEngine;
use crate::error::RegistryError;
use crate::game::{GameSession, SessionAction};
use crate::protocol::{GameFull, GameStateRecord, Side};

/// Active game sessions keyed by game id. Owned by the dispatcher; nothing else
/// touches the map.
pub struct SessionRegistry {
    sessions: HashMap<String, GameSession>,
    max_sessions: usize,
    rules: Arc<dyn RulesEngine>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, rules: Arc<dyn RulesEngine>) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
            rules,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    pub fn contains(&self, game_id: &str) -> bool {
        self.sessions.contains_key(game_id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &GameSession> {
        self.sessions.values()
    }

    pub fn get_mut(&mut self, game_id: &str) -> Result<&mut GameSession, RegistryError> {
        self.sessions
            .get_mut(game_id)
            .ok_or_else(|| RegistryError::UnknownSession(game_id.to_string()))
    }

    /// Creates a session in `Created`; it activates on its first snapshot.
    pub fn on_game_start(
        &mut self,
        game_id: &str,
        our_side: Side,
        opponent: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<&mut GameSession, RegistryError> {
        if self.sessions.contains_key(game_id) {
            return Err(RegistryError::DuplicateSession(game_id.to_string()));
        }
        if self.sessions.len() >= self.max_sessions {
            return Err(RegistryError::Capacity {
                game_id: game_id.to_string(),
                max: self.max_sessions,
            });
        }
        info!(game_id, ?our_side, opponent = opponent.as_deref().unwrap_or("?"), "session created");
        let session = GameSession::new(game_id, our_side, opponent, self.rules.clone(), now);
        Ok(self.sessions.entry(game_id.to_string()).or_insert(session))
    }

    pub fn on_snapshot(
        &mut self,
        game_id: &str,
        full: &GameFull,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionAction>, RegistryError> {
        Ok(self.get_mut(game_id)?.on_snapshot(full, now))
    }

    pub fn on_game_update(
        &mut self,
        game_id: &str,
        state: &GameStateRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionAction>, RegistryError> {
        Ok(self.get_mut(game_id)?.on_update(state, now))
    }

    /// Removes the session and hands it back for final reporting.
    pub fn on_game_end(&mut self, game_id: &str) -> Result<GameSession, RegistryError> {
        let session = self
            .sessions
            .remove(game_id)
            .ok_or_else(|| RegistryError::UnknownSession(game_id.to_string()))?;
        debug!(game_id, remaining = self.sessions.len(), "session removed");
        Ok(session)
    }

    /// Ids of sessions that have heard nothing for longer than `after`.
    pub fn stale(&self, now: DateTime<Utc>, after: std::time::Duration) -> Vec<String> {
        let mut ids: Vec<String> = self
            .sessions
            .values()
            .filter(|s| !s.status().is_ended() && s.is_stale(now, after))
            .map(|s| s.id().to_string())
            .collect();
        ids.sort();
        ids
    }
}

/// A challenge expected to turn into a game: one we accepted, or one we sent
/// that the opponent may still accept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingGame {
    /// Unknown for a sent challenge until the server echoes it back.
    pub challenge_id: Option<String>,
    pub opponent: String,
    /// We issued the challenge, so we may also cancel it.
    pub sent: bool,
    pub since: DateTime<Utc>,
}

/// Game slots in use: live sessions plus pending challenges. Admission and the
/// challenge scheduler both gate on [`Occupancy::total`].
#[derive(Debug, Default)]
pub struct Occupancy {
    sessions: usize,
    pending: Vec<PendingGame>,
}

pub type SharedOccupancy = Arc<Mutex<Occupancy>>;

impl Occupancy {
    pub fn shared() -> SharedOccupancy {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn total(&self) -> usize {
        self.sessions + self.pending.len()
    }

    pub fn sessions(&self) -> usize {
        self.sessions
    }

    pub fn pending(&self) -> &[PendingGame] {
        &self.pending
    }

    pub fn set_sessions(&mut self, sessions: usize) {
        self.sessions = sessions;
    }

    /// Slot for an incoming challenge we accepted.
    pub fn reserve_accepted(&mut self, challenge_id: &str, opponent: &str, now: DateTime<Utc>) {
        self.pending.push(PendingGame {
            challenge_id: Some(challenge_id.to_string()),
            opponent: opponent.to_string(),
            sent: false,
            since: now,
        });
    }

    /// Slot for a challenge we sent; the id is attached later by [`Occupancy::bind`].
    pub fn reserve_sent(&mut self, opponent: &str, now: DateTime<Utc>) {
        self.pending.push(PendingGame {
            challenge_id: None,
            opponent: opponent.to_string(),
            sent: true,
            since: now,
        });
    }

    /// Attaches the server's challenge id to a sent challenge.
    pub fn bind(&mut self, opponent: &str, challenge_id: &str) -> bool {
        if self.pending.iter().any(|p| p.challenge_id.as_deref() == Some(challenge_id)) {
            return true;
        }
        match self
            .pending
            .iter_mut()
            .find(|p| p.challenge_id.is_none() && p.opponent.eq_ignore_ascii_case(opponent))
        {
            Some(pending) => {
                pending.challenge_id = Some(challenge_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Frees the slot held for `challenge_id` (a challenge's id doubles as the
    /// id of the game it creates). Falls back to an unbound entry for one of
    /// `opponents`.
    pub fn release(&mut self, challenge_id: &str, opponents: &[&str]) -> Option<PendingGame> {
        let index = self
            .pending
            .iter()
            .position(|p| p.challenge_id.as_deref() == Some(challenge_id))
            .or_else(|| {
                self.pending.iter().position(|p| {
                    p.challenge_id.is_none() && opponents.iter().any(|o| p.opponent.eq_ignore_ascii_case(o))
                })
            })?;
        Some(self.pending.remove(index))
    }

    /// Drops reservations older than `after` and returns them.
    pub fn expire(&mut self, now: DateTime<Utc>, after: std::time::Duration) -> Vec<PendingGame> {
        let Ok(after) = chrono::Duration::from_std(after) else {
            return Vec::new();
        };
        let (expired, kept): (Vec<PendingGame>, Vec<PendingGame>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now - p.since >= after);
        self.pending = kept;
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::ChessRules;
    use crate::game::SessionStatus;
    use crate::protocol::GameStatus;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn registry(max: usize) -> SessionRegistry {
        SessionRegistry::new(max, Arc::new(ChessRules))
    }

    fn state(moves: &str) -> GameStateRecord {
        GameStateRecord {
            moves: moves.to_string(),
            wtime: 60_000,
            btime: 60_000,
            winc: 0,
            binc: 0,
            status: GameStatus::Started,
            winner: None,
        }
    }

    #[test]
    fn refuses_games_beyond_capacity() {
        let mut reg = registry(2);
        let now = Utc::now();
        reg.on_game_start("g1", Side::White, None, now).unwrap();
        reg.on_game_start("g2", Side::Black, None, now).unwrap();
        assert_eq!(
            reg.on_game_start("g3", Side::White, None, now).err(),
            Some(RegistryError::Capacity {
                game_id: "g3".to_string(),
                max: 2
            })
        );
        assert_eq!(reg.len(), 2);
        assert!(!reg.contains("g3"));

        reg.on_game_end("g1").unwrap();
        assert!(reg.on_game_start("g3", Side::White, None, now).is_ok());
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mut reg = registry(2);
        let now = Utc::now();
        reg.on_game_start("g1", Side::White, None, now).unwrap();
        assert_eq!(
            reg.on_game_start("g1", Side::Black, None, now).err(),
            Some(RegistryError::DuplicateSession("g1".to_string()))
        );
        assert_eq!(reg.get_mut("g1").unwrap().our_side(), Side::White);
    }

    #[test]
    fn updates_for_unknown_games_are_errors() {
        let mut reg = registry(1);
        assert_eq!(
            reg.on_game_update("nope", &state(""), Utc::now()).err(),
            Some(RegistryError::UnknownSession("nope".to_string()))
        );
        assert!(matches!(
            reg.on_game_end("nope"),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[test]
    fn routes_snapshot_to_session() {
        let mut reg = registry(1);
        let now = Utc::now();
        reg.on_game_start("g1", Side::Black, Some("bob".to_string()), now).unwrap();
        let full = GameFull {
            id: "g1".to_string(),
            variant: Default::default(),
            speed: "blitz".to_string(),
            rated: false,
            white: Default::default(),
            black: Default::default(),
            initial_fen: "startpos".to_string(),
            state: state("e2e4"),
        };
        let action = reg.on_snapshot("g1", &full, now).unwrap();
        assert!(matches!(action, Some(SessionAction::RequestMove { ply: 1, .. })));
        let session = reg.on_game_end("g1").unwrap();
        assert_eq!(session.move_count(), 1);
        assert_eq!(session.opponent(), Some("bob"));
        assert!(reg.is_empty());
    }

    #[test]
    fn lists_stale_sessions() {
        let mut reg = registry(2);
        let then = Utc::now() - chrono::Duration::minutes(30);
        reg.on_game_start("old", Side::White, None, then).unwrap();
        reg.on_game_start("new", Side::White, None, Utc::now()).unwrap();
        assert_eq!(reg.stale(Utc::now(), Duration::from_secs(600)), vec!["old".to_string()]);
        assert_eq!(*reg.get_mut("old").unwrap().status(), SessionStatus::Created);
    }

    #[test]
    fn pending_challenges_hold_slots_until_released() {
        let now = Utc::now();
        let mut occupancy = Occupancy::default();
        occupancy.set_sessions(1);
        occupancy.reserve_accepted("c1", "Peer", now);
        occupancy.reserve_sent("alice", now);
        assert_eq!(occupancy.total(), 3);

        assert!(occupancy.bind("Alice", "c2"));
        assert!(!occupancy.bind("bob", "c3"));

        let released = occupancy.release("c1", &[]).unwrap();
        assert_eq!(released.opponent, "Peer");
        assert!(occupancy.release("c1", &[]).is_none());
        assert_eq!(occupancy.release("c2", &["alice"]).unwrap().challenge_id.as_deref(), Some("c2"));
        assert_eq!(occupancy.total(), 1);
    }

    #[test]
    fn unbound_reservation_is_released_by_opponent() {
        let now = Utc::now();
        let mut occupancy = Occupancy::default();
        occupancy.reserve_sent("Alice", now);
        assert!(occupancy.release("g9", &["bob"]).is_none());
        assert!(occupancy.release("g9", &["alice"]).is_some());
        assert!(occupancy.pending().is_empty());
    }

    #[test]
    fn old_reservations_expire() {
        let then = Utc::now() - chrono::Duration::minutes(10);
        let now = Utc::now();
        let mut occupancy = Occupancy::default();
        occupancy.reserve_accepted("old", "a", then);
        occupancy.reserve_accepted("new", "b", now);
        let expired = occupancy.expire(now, Duration::from_secs(300));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].challenge_id.as_deref(), Some("old"));
        assert_eq!(occupancy.total(), 1);
    }
}
