//! Records exchanged with the Lichess Bot API.
//!
//! Both streams are newline-delimited JSON with a `type` discriminator. Only the
//! fields the bot acts on are modelled; everything else is ignored by serde.

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }
}

impl From<Side> for chess::Color {
    fn from(side: Side) -> Self {
        match side {
            Side::White => chess::Color::White,
            Side::Black => chess::Color::Black,
        }
    }
}

impl From<chess::Color> for Side {
    fn from(color: chess::Color) -> Self {
        match color {
            chess::Color::White => Side::White,
            chess::Color::Black => Side::Black,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Variant {
    pub key: String,
}

impl Default for Variant {
    fn default() -> Self {
        Self {
            key: "standard".to_string(),
        }
    }
}

/// Records on the account-wide event stream (`/api/stream/event`).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IncomingEvent {
    GameStart { game: GameEventInfo },
    GameFinish { game: GameEventInfo },
    Challenge { challenge: Challenge },
    ChallengeCanceled { challenge: Challenge },
    ChallengeDeclined { challenge: Challenge },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GameEventInfo {
    pub game_id: Option<String>,
    pub id: Option<String>,
    pub color: Option<Side>,
    pub fen: Option<String>,
    pub opponent: Opponent,
    pub rated: bool,
    pub speed: String,
    pub variant: Variant,
    pub is_my_turn: bool,
    pub seconds_left: Option<u64>,
}

impl GameEventInfo {
    /// Lichess sends the id as `gameId`, older payloads only as `id`.
    pub fn game_id(&self) -> &str {
        self.game_id
            .as_deref()
            .or(self.id.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Opponent {
    pub id: Option<String>,
    pub username: Option<String>,
    pub rating: Option<u32>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub challenger: ChallengeUser,
    #[serde(default)]
    pub dest_user: Option<ChallengeUser>,
    #[serde(default)]
    pub variant: Variant,
    #[serde(default)]
    pub rated: bool,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub time_control: TimeControl,
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct ChallengeUser {
    pub id: String,
    pub name: String,
    pub rating: Option<u32>,
    pub title: Option<String>,
    pub provisional: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeControl {
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds, for `clock` games.
    pub limit: Option<u32>,
    pub increment: Option<u32>,
    pub days_per_turn: Option<u32>,
}

/// Records on a per-game stream (`/api/bot/game/stream/{id}`).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GameEvent {
    GameFull(GameFull),
    GameState(GameStateRecord),
    #[serde(rename_all = "camelCase")]
    ChatLine {
        username: String,
        text: String,
        room: String,
    },
    #[serde(rename_all = "camelCase")]
    OpponentGone {
        gone: bool,
        #[serde(default)]
        claim_win_in_seconds: Option<u64>,
    },
    #[serde(other)]
    Unknown,
}

/// Full snapshot sent first on every (re)connection of a game stream.
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameFull {
    pub id: String,
    #[serde(default)]
    pub variant: Variant,
    #[serde(default)]
    pub speed: String,
    #[serde(default)]
    pub rated: bool,
    #[serde(default)]
    pub white: GamePlayer,
    #[serde(default)]
    pub black: GamePlayer,
    #[serde(default = "startpos")]
    pub initial_fen: String,
    pub state: GameStateRecord,
}

fn startpos() -> String {
    crate::board::STARTPOS.to_string()
}

#[derive(Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GamePlayer {
    pub id: Option<String>,
    pub name: Option<String>,
    pub rating: Option<u32>,
    pub ai_level: Option<u8>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct GameStateRecord {
    /// Space separated UCI moves from the initial position.
    #[serde(default)]
    pub moves: String,
    #[serde(default)]
    pub wtime: u64,
    #[serde(default)]
    pub btime: u64,
    #[serde(default)]
    pub winc: u64,
    #[serde(default)]
    pub binc: u64,
    pub status: GameStatus,
    #[serde(default)]
    pub winner: Option<Side>,
}

impl GameStateRecord {
    pub fn move_list(&self) -> Vec<String> {
        self.moves.split_whitespace().map(str::to_string).collect()
    }

    pub fn remaining(&self, side: Side) -> Duration {
        Duration::from_millis(match side {
            Side::White => self.wtime,
            Side::Black => self.btime,
        })
    }

    pub fn increment(&self, side: Side) -> Duration {
        Duration::from_millis(match side {
            Side::White => self.winc,
            Side::Black => self.binc,
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GameStatus {
    Created,
    Started,
    Aborted,
    Mate,
    Resign,
    Stalemate,
    Timeout,
    Draw,
    Outoftime,
    Cheat,
    NoStart,
    UnknownFinish,
    VariantEnd,
    #[serde(other)]
    Unknown,
}

impl GameStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            GameStatus::Created | GameStatus::Started | GameStatus::Unknown
        )
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Account {
    pub id: String,
    pub username: String,
}

/// Requests the bot sends. Each maps onto one authenticated POST.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    MakeMove {
        game_id: String,
        uci: String,
    },
    AcceptChallenge {
        challenge_id: String,
    },
    DeclineChallenge {
        challenge_id: String,
        reason: String,
    },
    CancelChallenge {
        challenge_id: String,
    },
    CreateChallenge {
        username: String,
        rated: bool,
        clock_limit: u32,
        clock_increment: u32,
        variant: String,
    },
}

impl Command {
    pub fn path(&self) -> String {
        match self {
            Command::MakeMove { game_id, uci } => format!("/api/bot/game/{}/move/{}", game_id, uci),
            Command::AcceptChallenge { challenge_id } => format!("/api/challenge/{}/accept", challenge_id),
            Command::DeclineChallenge { challenge_id, .. } => {
                format!("/api/challenge/{}/decline", challenge_id)
            }
            Command::CancelChallenge { challenge_id } => format!("/api/challenge/{}/cancel", challenge_id),
            Command::CreateChallenge { username, .. } => format!("/api/challenge/{}", username),
        }
    }

    pub fn form(&self) -> Vec<(&'static str, String)> {
        match self {
            Command::MakeMove { .. } | Command::AcceptChallenge { .. } | Command::CancelChallenge { .. } => {
                Vec::new()
            }
            Command::DeclineChallenge { reason, .. } => vec![("reason", reason.clone())],
            Command::CreateChallenge {
                rated,
                clock_limit,
                clock_increment,
                variant,
                ..
            } => vec![
                ("rated", rated.to_string()),
                ("clock.limit", clock_limit.to_string()),
                ("clock.increment", clock_increment.to_string()),
                ("variant", variant.clone()),
            ],
        }
    }

    pub fn game_id(&self) -> Option<&str> {
        match self {
            Command::MakeMove { game_id, .. } => Some(game_id),
            _ => None,
        }
    }
}

/// Which stream a transport connection serves.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    Events,
    Game(String),
}

impl StreamTarget {
    pub fn path(&self) -> String {
        match self {
            StreamTarget::Events => "/api/stream/event".to_string(),
            StreamTarget::Game(id) => format!("/api/bot/game/stream/{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_game_start() {
        let line = r#"{"type":"gameStart","game":{"gameId":"rCRw1AuO","fullId":"rCRw1AuOvonq",
            "color":"black","fen":"rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1",
            "hasMoved":false,"isMyTurn":false,"lastMove":"",
            "opponent":{"id":"philippe","rating":1790,"username":"Philippe"},
            "perf":"correspondence","rated":false,"secondsLeft":1209600,"source":"friend",
            "speed":"correspondence","variant":{"key":"standard","name":"Standard"},"id":"rCRw1AuO"}}"#;
        let event: IncomingEvent = serde_json::from_str(line).unwrap();
        match event {
            IncomingEvent::GameStart { game } => {
                assert_eq!(game.game_id(), "rCRw1AuO");
                assert_eq!(game.color, Some(Side::Black));
                assert_eq!(game.opponent.rating, Some(1790));
                assert_eq!(game.variant.key, "standard");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parses_challenge() {
        let line = r#"{"type":"challenge","challenge":{"id":"7pGLxJ4F","status":"created",
            "challenger":{"id":"lovlas","name":"Lovlas","title":"IM","rating":2506,"provisional":false,"online":true},
            "destUser":{"id":"thibot","name":"thibot","title":"BOT","rating":1500,"provisional":true},
            "variant":{"key":"standard","name":"Standard","short":"Std"},"rated":true,"speed":"rapid",
            "timeControl":{"type":"clock","limit":600,"increment":0,"show":"10+0"},
            "color":"random","finalColor":"white"}}"#;
        let event: IncomingEvent = serde_json::from_str(line).unwrap();
        let IncomingEvent::Challenge { challenge } = event else {
            panic!("not a challenge");
        };
        assert_eq!(challenge.challenger.rating, Some(2506));
        assert_eq!(challenge.time_control.limit, Some(600));
        assert_eq!(challenge.speed, "rapid");
        assert!(challenge.rated);
    }

    #[test]
    fn unknown_record_types_are_tolerated() {
        let event: IncomingEvent = serde_json::from_str(r#"{"type":"somethingNew","x":1}"#).unwrap();
        assert_eq!(event, IncomingEvent::Unknown);
        let event: GameEvent = serde_json::from_str(r#"{"type":"somethingNew"}"#).unwrap();
        assert_eq!(event, GameEvent::Unknown);
    }

    #[test]
    fn parses_game_full_and_state() {
        let line = r#"{"type":"gameFull","id":"5IrD6Gzz","rated":true,"variant":{"key":"standard"},
            "clock":{"initial":1200000,"increment":10000},"speed":"classical",
            "white":{"id":"lovlas","name":"Lovlas","rating":2500,"title":"IM"},
            "black":{"id":"leela","name":"Leela","rating":2390,"title":"BOT"},
            "initialFen":"startpos",
            "state":{"type":"gameState","moves":"e2e4 c7c5 f2f4 d7d6","wtime":7598040,
                     "btime":8395220,"winc":10000,"binc":10000,"status":"started"}}"#;
        let GameEvent::GameFull(full) = serde_json::from_str(line).unwrap() else {
            panic!("not a snapshot");
        };
        assert_eq!(full.state.move_list().len(), 4);
        assert_eq!(full.state.remaining(Side::Black), Duration::from_millis(8395220));
        assert!(!full.state.status.is_terminal());

        let update: GameEvent = serde_json::from_str(
            r#"{"type":"gameState","moves":"e2e4","wtime":1,"btime":2,"winc":0,"binc":0,
                "status":"mate","winner":"white"}"#,
        )
        .unwrap();
        let GameEvent::GameState(state) = update else {
            panic!("not a state");
        };
        assert!(state.status.is_terminal());
        assert_eq!(state.winner, Some(Side::White));
    }

    #[test]
    fn commands_map_to_endpoints() {
        let decline = Command::DeclineChallenge {
            challenge_id: "abc".to_string(),
            reason: "tooFast".to_string(),
        };
        assert_eq!(decline.path(), "/api/challenge/abc/decline");
        assert_eq!(decline.form(), vec![("reason", "tooFast".to_string())]);
        let cancel = Command::CancelChallenge {
            challenge_id: "abc".to_string(),
        };
        assert_eq!(cancel.path(), "/api/challenge/abc/cancel");
        assert!(cancel.form().is_empty());

        let mv = Command::MakeMove {
            game_id: "g1".to_string(),
            uci: "e2e4".to_string(),
        };
        assert_eq!(mv.path(), "/api/bot/game/g1/move/e2e4");
        assert_eq!(mv.game_id(), Some("g1"));
        assert_eq!(StreamTarget::Game("g1".to_string()).path(), "/api/bot/game/stream/g1");
    }
}
