#![allow(dead_code)]

use rival_bot::board::ChessRules;
use rival_bot::config::{BackoffConfig, BotConfig};
use rival_bot::orchestrator::{LifecycleEvent, Orchestrator};
use rival_bot::protocol::StreamTarget;
use rival_bot::scheduler::ChallengeIntent;
use rival_bot::testing::{ScriptedApi, ScriptedSelector};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn config() -> BotConfig {
    BotConfig {
        token: "test-token".to_string(),
        backoff: BackoffConfig {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(5),
            factor: 2,
        },
        ..Default::default()
    }
}

pub fn game_start(game_id: &str, color: &str, opponent: &str) -> String {
    format!(
        r#"{{"type":"gameStart","game":{{"gameId":"{}","color":"{}","opponent":{{"id":"{}","username":"{}","rating":1500}},"rated":false,"speed":"blitz","variant":{{"key":"standard"}}}}}}"#,
        game_id,
        color,
        opponent.to_lowercase(),
        opponent
    )
}

pub fn game_full(game_id: &str, moves: &str) -> String {
    format!(
        r#"{{"type":"gameFull","id":"{}","rated":false,"variant":{{"key":"standard"}},"speed":"blitz",
        "white":{{"id":"rivalbot","name":"RivalBot"}},"black":{{"id":"peer","name":"Peer"}},"initialFen":"startpos",
        "state":{{"type":"gameState","moves":"{}","wtime":180000,"btime":180000,"winc":2000,"binc":2000,"status":"started"}}}}"#,
        game_id, moves
    )
}

pub fn game_state(moves: &str, status: &str, winner: Option<&str>) -> String {
    let winner = winner
        .map(|w| format!(r#","winner":"{}""#, w))
        .unwrap_or_default();
    format!(
        r#"{{"type":"gameState","moves":"{}","wtime":170000,"btime":175000,"winc":2000,"binc":2000,"status":"{}"{}}}"#,
        moves, status, winner
    )
}

pub fn game(game_id: &str) -> StreamTarget {
    StreamTarget::Game(game_id.to_string())
}

/// A running orchestrator wired to in-memory doubles.
pub struct Harness {
    pub api: Arc<ScriptedApi>,
    pub selector: Arc<ScriptedSelector>,
    pub events: mpsc::UnboundedReceiver<LifecycleEvent>,
    pub challenges: mpsc::UnboundedSender<ChallengeIntent>,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Harness {
    pub fn start(config: BotConfig, selector: ScriptedSelector) -> Self {
        Self::start_with(config, selector, ScriptedApi::new())
    }

    pub fn start_with(config: BotConfig, selector: ScriptedSelector, api: ScriptedApi) -> Self {
        let api = Arc::new(api);
        let selector = Arc::new(selector);
        let (event_tx, events) = mpsc::unbounded_channel();
        let bot = Orchestrator::new(config, api.clone(), selector.clone(), Arc::new(ChessRules)).with_events(event_tx);
        let challenges = bot.challenges();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(bot.run(async move {
            let _ = stopped.await;
        }));
        Self {
            api,
            selector,
            events,
            challenges,
            stop: Some(stop),
            handle,
        }
    }

    /// Next lifecycle event matching `pred`, skipping others.
    pub async fn expect<F>(&mut self, pred: F) -> LifecycleEvent
    where
        F: Fn(&LifecycleEvent) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for lifecycle event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    /// Waits until `count` moves were submitted for `game_id` and returns them.
    pub async fn moves_reach(&self, game_id: &str, count: usize) -> Vec<String> {
        let reached = self
            .api
            .wait_for(WAIT, |commands| {
                commands.iter().filter(|c| c.game_id() == Some(game_id)).count() >= count
            })
            .await;
        let moves = self.api.moves_for(game_id);
        assert!(reached, "only {} of {} moves submitted: {:?}", moves.len(), count, moves);
        moves
    }

    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.handle).await;
    }
}
