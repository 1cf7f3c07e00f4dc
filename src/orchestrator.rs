//! The dispatcher: one task that owns every session and processes every
//! inbound record in order.
//!
//! Streams, selector calls and HTTP submissions run on their own tasks and
//! report back through the same channel, so session state only ever changes
//! inside [`Orchestrator::run`].

use chess::ChessMove;
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admission::{self, Decision};
use crate::board::RulesEngine;
use crate::config::BotConfig;
use crate::error::{RegistryError, SelectionError, TransportError};
use crate::game::{EndReason, GameState, SessionAction};
use crate::protocol::{Challenge, Command, GameEvent, GameEventInfo, IncomingEvent, Side, StreamTarget};
use crate::registry::{Occupancy, SessionRegistry, SharedOccupancy};
use crate::scheduler::{ChallengeIntent, ChallengeScheduler};
use crate::selector::MoveSelector;
use crate::transport::{BotApi, RawEvent, StreamTransport};

const WATCHDOG_PERIOD: Duration = Duration::from_secs(30);

/// Structured lifecycle notifications for an outside collector.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        game_id: String,
        our_side: Side,
        opponent: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    SessionEnded {
        game_id: String,
        result: String,
        reason: EndReason,
        moves: usize,
    },
    #[serde(rename_all = "camelCase")]
    MoveSubmitted {
        game_id: String,
        ply: usize,
        uci: String,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeEvaluated {
        challenge_id: String,
        challenger: String,
        decision: Decision,
        reason: Option<String>,
    },
    ChallengeDispatched {
        opponent: String,
        priority: i32,
        attempts: u32,
    },
    TransportReconnected {
        stream: String,
        failures: u32,
    },
}

/// Where lifecycle events go. Always traced; forwarded when a channel is set.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<LifecycleEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn emit(&self, event: LifecycleEvent) {
        debug!(?event, "lifecycle");
        if let Some(tx) = &self.tx {
            // the collector going away must not disturb play
            let _ = tx.send(event);
        }
    }
}

#[derive(Debug)]
enum Inbound {
    Account(RawEvent),
    Game {
        game_id: String,
        event: RawEvent,
    },
    MoveDecided {
        game_id: String,
        ply: usize,
        result: Result<ChessMove, SelectionError>,
    },
    Submitted {
        game_id: String,
        ply: usize,
        uci: String,
        result: Result<(), TransportError>,
    },
}

pub struct Orchestrator {
    config: BotConfig,
    transport: StreamTransport,
    selector: Arc<dyn MoveSelector>,
    registry: SessionRegistry,
    account_id: Option<String>,
    occupancy: SharedOccupancy,
    events: EventSink,
    tx: mpsc::UnboundedSender<Inbound>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    streams: HashMap<String, JoinHandle<()>>,
    scheduler: Option<(ChallengeScheduler, mpsc::UnboundedReceiver<ChallengeIntent>)>,
    intents: mpsc::UnboundedSender<ChallengeIntent>,
}

impl Orchestrator {
    pub fn new(
        config: BotConfig,
        api: Arc<dyn BotApi>,
        selector: Arc<dyn MoveSelector>,
        rules: Arc<dyn RulesEngine>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (intents, intent_rx) = mpsc::unbounded_channel();
        let transport = StreamTransport::new(api, config.backoff.clone()).with_idle_timeout(config.idle_timeout);
        let registry = SessionRegistry::new(config.max_concurrent_games, rules);
        let scheduler = ChallengeScheduler::new(&config);
        Self {
            config,
            transport,
            selector,
            registry,
            account_id: None,
            occupancy: Occupancy::shared(),
            events: EventSink::default(),
            tx,
            rx,
            streams: HashMap::new(),
            scheduler: Some((scheduler, intent_rx)),
            intents,
        }
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<LifecycleEvent>) -> Self {
        self.events = EventSink::new(tx);
        self
    }

    /// Handle for queueing outbound challenges.
    pub fn challenges(&self) -> mpsc::UnboundedSender<ChallengeIntent> {
        self.intents.clone()
    }

    /// Game slots in use, shared with the challenge scheduler.
    pub fn occupancy(&self) -> SharedOccupancy {
        self.occupancy.clone()
    }

    /// Runs until `shutdown` resolves. Games still in progress are left to the
    /// server.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        match self.transport.account().await {
            Ok(account) => {
                info!(account = %account.username, "logged in");
                self.account_id = Some(account.id.to_lowercase());
            }
            Err(e) => warn!(error = %e, "could not fetch account, own challenges will not be recognised"),
        }

        let mut tasks = Vec::new();
        tasks.push(self.forward(StreamTarget::Events, Inbound::Account));
        if let Some((scheduler, intent_rx)) = self.scheduler.take() {
            tasks.push(tokio::spawn(scheduler.run(
                self.transport.clone(),
                self.occupancy.clone(),
                intent_rx,
                self.events.clone(),
                self.config.poll_interval,
            )));
        }

        let mut watchdog = tokio::time::interval(WATCHDOG_PERIOD.min(self.config.stale_after));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(message) = self.rx.recv() => self.handle(message),
                _ = watchdog.tick() => {
                    self.check_stale();
                    self.expire_pending();
                }
            }
        }

        info!(active = self.registry.len(), "shutting down");
        for handle in tasks.into_iter().chain(self.streams.drain().map(|(_, h)| h)) {
            handle.abort();
        }
    }

    fn forward<W>(&self, target: StreamTarget, wrap: W) -> JoinHandle<()>
    where
        W: Fn(RawEvent) -> Inbound + Send + 'static,
    {
        let mut stream = self.transport.connect(target);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if tx.send(wrap(event)).is_err() {
                    break;
                }
            }
        })
    }

    fn handle(&mut self, message: Inbound) {
        match message {
            Inbound::Account(RawEvent::Record(line)) => match serde_json::from_str::<IncomingEvent>(&line) {
                Ok(event) => self.on_incoming(event),
                Err(e) => warn!(error = %decode_error(e), %line, "bad event record"),
            },
            Inbound::Account(RawEvent::Reconnected { failures }) => {
                self.events.emit(LifecycleEvent::TransportReconnected {
                    stream: StreamTarget::Events.path(),
                    failures,
                });
            }
            Inbound::Game {
                game_id,
                event: RawEvent::Record(line),
            } => match serde_json::from_str::<GameEvent>(&line) {
                Ok(event) => self.on_game_event(&game_id, event),
                Err(e) => warn!(%game_id, error = %decode_error(e), %line, "bad game record"),
            },
            Inbound::Game {
                game_id,
                event: RawEvent::Reconnected { failures },
            } => {
                // the server opens every game stream with a full snapshot
                self.events.emit(LifecycleEvent::TransportReconnected {
                    stream: StreamTarget::Game(game_id).path(),
                    failures,
                });
            }
            Inbound::MoveDecided { game_id, ply, result } => {
                let action = match self.registry.get_mut(&game_id) {
                    Ok(session) => session.on_move_decided(ply, result),
                    Err(_) => {
                        debug!(%game_id, ply, "move decided for a finished game, discarded");
                        return;
                    }
                };
                if let Some(action) = action {
                    self.on_action(&game_id, action);
                }
            }
            Inbound::Submitted {
                game_id,
                ply,
                uci,
                result,
            } => {
                if result.is_ok() {
                    info!(%game_id, ply, %uci, "move played");
                    self.events.emit(LifecycleEvent::MoveSubmitted {
                        game_id: game_id.clone(),
                        ply,
                        uci: uci.clone(),
                    });
                }
                let action = match self.registry.get_mut(&game_id) {
                    Ok(session) => session.on_submit_result(ply, &uci, result),
                    Err(_) => return,
                };
                if let Some(action) = action {
                    self.on_action(&game_id, action);
                }
            }
        }
    }

    fn on_incoming(&mut self, event: IncomingEvent) {
        match event {
            IncomingEvent::GameStart { game } => self.on_game_start(&game),
            IncomingEvent::GameFinish { game } => {
                let game_id = game.game_id();
                let action = match self.registry.get_mut(game_id) {
                    Ok(session) => session.end(EndReason::Finished),
                    Err(_) => {
                        debug!(game_id, "finish for a game already closed");
                        return;
                    }
                };
                self.on_action(game_id, action);
            }
            IncomingEvent::Challenge { challenge } => self.on_challenge(challenge),
            IncomingEvent::ChallengeCanceled { challenge } => {
                let challenger = &challenge.challenger;
                let freed = self
                    .occupancy
                    .lock()
                    .release(&challenge.id, &[challenger.id.as_str(), challenger.name.as_str()])
                    .is_some();
                info!(challenge_id = %challenge.id, challenger = %challenger.name, freed, "challenge canceled");
            }
            IncomingEvent::ChallengeDeclined { challenge } => {
                let (opponent_id, opponent) = challenge
                    .dest_user
                    .as_ref()
                    .map(|u| (u.id.as_str(), u.name.as_str()))
                    .unwrap_or(("", "?"));
                let freed = self
                    .occupancy
                    .lock()
                    .release(&challenge.id, &[opponent_id, opponent])
                    .is_some();
                info!(challenge_id = %challenge.id, opponent, freed, "our challenge was declined");
            }
            IncomingEvent::Unknown => debug!("ignoring unknown event type"),
        }
    }

    fn on_game_start(&mut self, game: &GameEventInfo) {
        let game_id = game.game_id().to_string();
        if game_id.is_empty() {
            warn!("gameStart without a game id");
            return;
        }
        let Some(our_side) = game.color else {
            warn!(%game_id, "gameStart without our color, not playing it");
            return;
        };
        let opponent = game.opponent.username.clone().or_else(|| game.opponent.id.clone());
        let names: Vec<&str> = [&game.opponent.id, &game.opponent.username]
            .into_iter()
            .filter_map(|name| name.as_deref())
            .collect();
        if let Some(pending) = self.occupancy.lock().release(&game_id, &names) {
            debug!(%game_id, opponent = %pending.opponent, "pending challenge became a game");
        }
        let created = self
            .registry
            .on_game_start(&game_id, our_side, opponent.clone(), Utc::now())
            .map(|_| ());
        match created {
            Ok(()) => {
                self.sync_active();
                self.events.emit(LifecycleEvent::SessionCreated {
                    game_id: game_id.clone(),
                    our_side,
                    opponent,
                });
                let id = game_id.clone();
                let handle = self.forward(StreamTarget::Game(game_id.clone()), move |event| Inbound::Game {
                    game_id: id.clone(),
                    event,
                });
                self.streams.insert(game_id, handle);
            }
            // replayed when the event stream reconnects
            Err(RegistryError::DuplicateSession(_)) => debug!(%game_id, "game already tracked"),
            Err(e) => warn!(%game_id, error = %e, "game start rejected"),
        }
    }

    fn on_game_event(&mut self, game_id: &str, event: GameEvent) {
        let now = Utc::now();
        let result = match &event {
            GameEvent::GameFull(full) => self.registry.on_snapshot(game_id, full, now),
            GameEvent::GameState(state) => self.registry.on_game_update(game_id, state, now),
            GameEvent::ChatLine { username, text, room } => {
                debug!(game_id, %username, %room, %text, "chat");
                return;
            }
            GameEvent::OpponentGone {
                gone,
                claim_win_in_seconds,
            } => {
                info!(game_id, gone, ?claim_win_in_seconds, "opponent presence changed");
                return;
            }
            GameEvent::Unknown => return,
        };
        match result {
            Ok(Some(action)) => self.on_action(game_id, action),
            Ok(None) => {}
            // the game may have ended just as the update arrived
            Err(e) => debug!(game_id, error = %e, "game record dropped"),
        }
    }

    fn on_action(&mut self, game_id: &str, action: SessionAction) {
        match action {
            SessionAction::RequestMove { ply, state } => self.spawn_selection(game_id, ply, state),
            SessionAction::Submit { ply, uci, fallback } => {
                if fallback {
                    info!(game_id, ply, %uci, "submitting fallback move");
                }
                self.spawn_submit(game_id, ply, uci);
            }
            SessionAction::Ended(reason) => self.finish(game_id, reason),
        }
    }

    fn spawn_selection(&self, game_id: &str, ply: usize, state: GameState) {
        let budget = state.move_budget(self.config.move_time_fraction, self.config.max_think_time);
        debug!(game_id, ply, selector = self.selector.name(), ?budget, "selecting move");
        let selector = self.selector.clone();
        let tx = self.tx.clone();
        let game_id = game_id.to_string();
        tokio::spawn(async move {
            let result = match budget {
                Some(budget) => tokio::time::timeout(budget, selector.select(&state))
                    .await
                    .unwrap_or(Err(SelectionError::TimedOut(budget))),
                None => selector.select(&state).await,
            };
            let _ = tx.send(Inbound::MoveDecided { game_id, ply, result });
        });
    }

    fn spawn_submit(&self, game_id: &str, ply: usize, uci: String) {
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let game_id = game_id.to_string();
        tokio::spawn(async move {
            let command = Command::MakeMove {
                game_id: game_id.clone(),
                uci: uci.clone(),
            };
            let result = transport.submit(&command).await;
            let _ = tx.send(Inbound::Submitted {
                game_id,
                ply,
                uci,
                result,
            });
        });
    }

    fn finish(&mut self, game_id: &str, reason: EndReason) {
        match self.registry.on_game_end(game_id) {
            Ok(session) => {
                let result = session.outcome();
                info!(game_id, result, moves = session.move_count(), ?reason, "session ended");
                self.events.emit(LifecycleEvent::SessionEnded {
                    game_id: game_id.to_string(),
                    result: result.to_string(),
                    reason,
                    moves: session.move_count(),
                });
            }
            Err(e) => debug!(game_id, error = %e, "end for unknown session"),
        }
        if let Some(handle) = self.streams.remove(game_id) {
            handle.abort();
        }
        self.sync_active();
    }

    fn on_challenge(&mut self, challenge: Challenge) {
        let challenger = challenge.challenger.id.to_lowercase();
        if self.account_id.as_deref() == Some(challenger.as_str()) {
            let bound = challenge
                .dest_user
                .as_ref()
                .map_or(false, |dest| self.occupancy.lock().bind(&dest.name, &challenge.id));
            debug!(challenge_id = %challenge.id, bound, "own outgoing challenge");
            return;
        }
        let active = self.occupancy.lock().total();
        let decision = admission::evaluate(&challenge, &self.config.filter, active);
        if decision.is_accept() {
            // the slot is held until gameStart, cancel or expiry
            self.occupancy
                .lock()
                .reserve_accepted(&challenge.id, &challenge.challenger.name, Utc::now());
        }
        let reason = match &decision {
            Decision::Accept => None,
            Decision::Decline(reason) => Some(reason.to_string()),
        };
        info!(
            challenge_id = %challenge.id,
            challenger = %challenge.challenger.name,
            rating = ?challenge.challenger.rating,
            accepted = decision.is_accept(),
            reason = reason.as_deref().unwrap_or(""),
            "challenge evaluated"
        );
        let command = match &decision {
            Decision::Accept => Command::AcceptChallenge {
                challenge_id: challenge.id.clone(),
            },
            Decision::Decline(reason) => Command::DeclineChallenge {
                challenge_id: challenge.id.clone(),
                reason: reason.key().to_string(),
            },
        };
        self.events.emit(LifecycleEvent::ChallengeEvaluated {
            challenge_id: challenge.id,
            challenger: challenge.challenger.name,
            decision,
            reason,
        });
        let transport = self.transport.clone();
        let occupancy = self.occupancy.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.submit(&command).await {
                warn!(?command, error = %e, "challenge response failed");
                if let Command::AcceptChallenge { challenge_id } = &command {
                    occupancy.lock().release(challenge_id, &[]);
                }
            }
        });
    }

    fn check_stale(&self) {
        for game_id in self.registry.stale(Utc::now(), self.config.stale_after) {
            warn!(%game_id, after = ?self.config.stale_after, "no game updates received, session may be stuck");
        }
    }

    /// Frees slots whose challenge never turned into a game. Sent challenges
    /// are withdrawn so a late acceptance cannot overshoot capacity.
    fn expire_pending(&self) {
        let expired = self
            .occupancy
            .lock()
            .expire(Utc::now(), self.config.pending_challenge_timeout);
        for pending in expired {
            warn!(
                challenge_id = pending.challenge_id.as_deref().unwrap_or("?"),
                opponent = %pending.opponent,
                "challenge did not become a game in time, slot freed"
            );
            if let (true, Some(challenge_id)) = (pending.sent, pending.challenge_id) {
                let transport = self.transport.clone();
                tokio::spawn(async move {
                    let command = Command::CancelChallenge { challenge_id };
                    if let Err(e) = transport.submit(&command).await {
                        warn!(?command, error = %e, "challenge cancel failed");
                    }
                });
            }
        }
    }

    fn sync_active(&self) {
        self.occupancy.lock().set_sessions(self.registry.len());
    }
}

fn decode_error(e: serde_json::Error) -> TransportError {
    TransportError::Decode {
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::DeclineReason;
    use crate::board::ChessRules;
    use crate::testing::{ScriptedApi, ScriptedSelector};
    use pretty_assertions::assert_eq;

    fn orchestrator(api: &Arc<ScriptedApi>) -> Orchestrator {
        Orchestrator::new(
            BotConfig::default(),
            api.clone(),
            Arc::new(ScriptedSelector::new()),
            Arc::new(ChessRules),
        )
    }

    fn challenge_line(id: &str, challenger: &str, rating: u32) -> String {
        format!(
            r#"{{"type":"challenge","challenge":{{"id":"{}","challenger":{{"id":"{}","name":"{}","rating":{}}},
            "variant":{{"key":"standard"}},"rated":true,"speed":"blitz","timeControl":{{"type":"clock","limit":180,"increment":2}}}}}}"#,
            id,
            challenger.to_lowercase(),
            challenger,
            rating
        )
    }

    #[test]
    fn lifecycle_events_serialize_with_tag() {
        let event = LifecycleEvent::MoveSubmitted {
            game_id: "g1".to_string(),
            ply: 0,
            uci: "e2e4".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "moveSubmitted", "gameId": "g1", "ply": 0, "uci": "e2e4"})
        );
    }

    #[tokio::test]
    async fn declines_with_reason_key_and_reports() {
        let api = Arc::new(ScriptedApi::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut bot = orchestrator(&api).with_events(tx);
        bot.config.filter.max_rating = 1200;

        bot.handle(Inbound::Account(RawEvent::Record(challenge_line("c1", "Strong", 2300))));

        assert!(
            api.wait_for(Duration::from_secs(1), |c| !c.is_empty()).await,
            "no response sent"
        );
        assert_eq!(
            api.commands(),
            vec![Command::DeclineChallenge {
                challenge_id: "c1".to_string(),
                reason: "generic".to_string(),
            }]
        );
        assert_eq!(
            rx.recv().await,
            Some(LifecycleEvent::ChallengeEvaluated {
                challenge_id: "c1".to_string(),
                challenger: "Strong".to_string(),
                decision: Decision::Decline(DeclineReason::RatingTooHigh(2300)),
                reason: Some("rating too high".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn ignores_own_outgoing_challenges() {
        let api = Arc::new(ScriptedApi::with_account("RivalBot"));
        let mut bot = orchestrator(&api);
        bot.account_id = Some("rivalbot".to_string());

        bot.handle(Inbound::Account(RawEvent::Record(challenge_line("c1", "RivalBot", 1500))));
        bot.handle(Inbound::Account(RawEvent::Record(challenge_line("c2", "Peer", 1500))));

        assert!(api.wait_for(Duration::from_secs(1), |c| !c.is_empty()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            api.commands(),
            vec![Command::AcceptChallenge {
                challenge_id: "c2".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn game_start_without_color_is_refused() {
        let api = Arc::new(ScriptedApi::new());
        let mut bot = orchestrator(&api);
        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"gameStart","game":{"gameId":"g1"}}"#.to_string(),
        )));
        assert_eq!(bot.registry.len(), 0);

        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"gameStart","game":{"gameId":"g1","color":"white"}}"#.to_string(),
        )));
        assert_eq!(bot.registry.len(), 1);
        assert_eq!(bot.occupancy().lock().sessions(), 1);
        assert!(bot.streams.contains_key("g1"));
    }

    #[tokio::test]
    async fn garbage_records_are_skipped() {
        let api = Arc::new(ScriptedApi::new());
        let mut bot = orchestrator(&api);
        bot.handle(Inbound::Account(RawEvent::Record("not json".to_string())));
        bot.handle(Inbound::Game {
            game_id: "nope".to_string(),
            event: RawEvent::Record(r#"{"type":"gameState","moves":"e2e4","status":"started"}"#.to_string()),
        });
        assert!(bot.registry.is_empty());
        assert!(api.commands().is_empty());
    }

    #[tokio::test]
    async fn accepted_challenge_holds_a_slot_until_its_game_starts() {
        let api = Arc::new(ScriptedApi::new());
        let mut bot = orchestrator(&api);
        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"gameStart","game":{"gameId":"g1","color":"white"}}"#.to_string(),
        )));
        bot.handle(Inbound::Account(RawEvent::Record(challenge_line("c2", "Peer", 1500))));
        bot.handle(Inbound::Account(RawEvent::Record(challenge_line("c3", "Other", 1500))));

        assert!(api.wait_for(Duration::from_secs(1), |c| c.len() >= 2).await);
        let commands = api.commands();
        assert!(commands.contains(&Command::AcceptChallenge {
            challenge_id: "c2".to_string()
        }));
        assert!(commands.contains(&Command::DeclineChallenge {
            challenge_id: "c3".to_string(),
            reason: "later".to_string(),
        }));
        assert_eq!(bot.occupancy().lock().total(), 2);

        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"gameStart","game":{"gameId":"c2","color":"black","opponent":{"id":"peer","username":"Peer"}}}"#
                .to_string(),
        )));
        let occupancy = bot.occupancy();
        assert_eq!(occupancy.lock().sessions(), 2);
        assert!(occupancy.lock().pending().is_empty());
    }

    #[tokio::test]
    async fn declined_outgoing_challenge_frees_its_slot() {
        let api = Arc::new(ScriptedApi::new());
        let mut bot = orchestrator(&api);
        bot.account_id = Some("rivalbot".to_string());
        bot.occupancy().lock().reserve_sent("alice", Utc::now());

        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"challenge","challenge":{"id":"c9","challenger":{"id":"rivalbot","name":"RivalBot"},
            "destUser":{"id":"alice","name":"Alice"},"variant":{"key":"standard"},"speed":"blitz"}}"#
                .to_string(),
        )));
        assert_eq!(
            bot.occupancy().lock().pending()[0].challenge_id.as_deref(),
            Some("c9")
        );

        bot.handle(Inbound::Account(RawEvent::Record(
            r#"{"type":"challengeDeclined","challenge":{"id":"c9","challenger":{"id":"rivalbot","name":"RivalBot"},
            "destUser":{"id":"alice","name":"Alice"}}}"#
                .to_string(),
        )));
        assert_eq!(bot.occupancy().lock().total(), 0);
        assert!(api.commands().is_empty());
    }
}
