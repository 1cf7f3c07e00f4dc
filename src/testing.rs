//! In-memory stand-ins for the server and the move selector, used by the unit
//! tests and the integration tests under `tests/`.

use async_trait::async_trait;
use chess::ChessMove;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::board::parse_uci;
use crate::error::{SelectionError, TransportError};
use crate::game::GameState;
use crate::protocol::{Account, Command, StreamTarget};
use crate::selector::MoveSelector;
use crate::transport::{BotApi, LineStream};

type LineSender = mpsc::UnboundedSender<Result<String, TransportError>>;
type LineReceiver = mpsc::UnboundedReceiver<Result<String, TransportError>>;

struct Channel {
    tx: LineSender,
    rx: Option<LineReceiver>,
}

impl Channel {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Default)]
struct ApiState {
    channels: HashMap<StreamTarget, Channel>,
    connect_failures: HashMap<StreamTarget, u32>,
    connect_drops: HashMap<StreamTarget, u32>,
    connections: HashMap<StreamTarget, u32>,
    commands: Vec<Command>,
    submit_failures: u32,
    rejected_moves: HashSet<String>,
}

/// Fake server. Lines fed to a target are buffered until a connection to that
/// target reads them; `disconnect` ends the current connection.
pub struct ScriptedApi {
    account: Account,
    state: Mutex<ApiState>,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::with_account("rivalbot")
    }

    pub fn with_account(id: &str) -> Self {
        Self {
            account: Account {
                id: id.to_lowercase(),
                username: id.to_string(),
            },
            state: Mutex::new(ApiState::default()),
        }
    }

    pub fn feed(&self, target: &StreamTarget, line: &str) {
        let mut state = self.state.lock();
        let channel = state.channels.entry(target.clone()).or_insert_with(Channel::new);
        // a closed receiver just means nobody listens any more
        let _ = channel.tx.send(Ok(line.to_string()));
    }

    pub fn disconnect(&self, target: &StreamTarget) {
        self.state.lock().channels.remove(target);
    }

    pub fn fail_next_connects(&self, target: StreamTarget, count: u32) {
        self.state.lock().connect_failures.insert(target, count);
    }

    /// The next `count` connections to `target` open and end at once, without
    /// a single line.
    pub fn drop_next_connects(&self, target: StreamTarget, count: u32) {
        self.state.lock().connect_drops.insert(target, count);
    }

    pub fn fail_next_submits(&self, count: u32) {
        self.state.lock().submit_failures = count;
    }

    /// The server refuses this move whenever it is submitted.
    pub fn reject_move(&self, uci: &str) {
        self.state.lock().rejected_moves.insert(uci.to_string());
    }

    /// Successful connections made to `target` so far.
    pub fn connections(&self, target: &StreamTarget) -> u32 {
        self.state.lock().connections.get(target).copied().unwrap_or(0)
    }

    /// Every command submitted, including the refused ones.
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    pub fn moves_for(&self, game_id: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::MakeMove { game_id: g, uci } if g == game_id => Some(uci.clone()),
                _ => None,
            })
            .collect()
    }

    /// Polls until `pred` holds on the recorded commands or `timeout` passes.
    pub async fn wait_for<F>(&self, timeout: Duration, pred: F) -> bool
    where
        F: Fn(&[Command]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.state.lock().commands) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Default for ScriptedApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BotApi for ScriptedApi {
    async fn open_stream(&self, target: &StreamTarget) -> Result<LineStream, TransportError> {
        let mut state = self.state.lock();
        if let Some(failures) = state.connect_failures.get_mut(target) {
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Status {
                    code: 503,
                    body: "unavailable".to_string(),
                });
            }
        }
        if let Some(drops) = state.connect_drops.get_mut(target) {
            if *drops > 0 {
                *drops -= 1;
                *state.connections.entry(target.clone()).or_insert(0) += 1;
                return Ok(stream::empty().boxed());
            }
        }
        let channel = state.channels.entry(target.clone()).or_insert_with(Channel::new);
        let rx = match channel.rx.take() {
            Some(rx) => rx,
            None => {
                *channel = Channel::new();
                channel.rx.take().ok_or(TransportError::Closed)?
            }
        };
        *state.connections.entry(target.clone()).or_insert(0) += 1;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|line| (line, rx)) }).boxed())
    }

    async fn submit(&self, command: &Command) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        state.commands.push(command.clone());
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(TransportError::Status {
                code: 500,
                body: "scripted failure".to_string(),
            });
        }
        if let Command::MakeMove { uci, .. } = command {
            if state.rejected_moves.contains(uci) {
                return Err(TransportError::Status {
                    code: 400,
                    body: format!("Not your turn, or game already over ({})", uci),
                });
            }
        }
        Ok(())
    }

    async fn account(&self) -> Result<Account, TransportError> {
        Ok(self.account.clone())
    }
}

#[derive(Default)]
struct SelectorState {
    answers: VecDeque<Result<String, SelectionError>>,
    calls: Vec<(String, usize)>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

/// Selector that plays scripted answers in order and then the first legal
/// move. Tracks concurrent calls per game.
pub struct ScriptedSelector {
    delay: Duration,
    state: Mutex<SelectorState>,
}

impl ScriptedSelector {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            state: Mutex::new(SelectorState::default()),
        }
    }

    pub fn answer(&self, uci: &str) {
        self.state.lock().answers.push_back(Ok(uci.to_string()));
    }

    pub fn fail(&self, error: SelectionError) {
        self.state.lock().answers.push_back(Err(error));
    }

    /// `(game_id, ply)` of every call, in call order.
    pub fn calls(&self) -> Vec<(String, usize)> {
        self.state.lock().calls.clone()
    }

    pub fn max_in_flight(&self, game_id: &str) -> usize {
        self.state.lock().max_in_flight.get(game_id).copied().unwrap_or(0)
    }
}

impl Default for ScriptedSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MoveSelector for ScriptedSelector {
    async fn select(&self, state: &GameState) -> Result<ChessMove, SelectionError> {
        let answer = {
            let mut s = self.state.lock();
            s.calls.push((state.game_id.clone(), state.ply()));
            let current = {
                let n = s.in_flight.entry(state.game_id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let max = s.max_in_flight.entry(state.game_id.clone()).or_insert(0);
            *max = (*max).max(current);
            s.answers.pop_front()
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(n) = self.state.lock().in_flight.get_mut(&state.game_id) {
            *n -= 1;
        }

        match answer {
            Some(Ok(uci)) => parse_uci(&uci).map_err(|e| SelectionError::Failed(e.to_string())),
            Some(Err(e)) => Err(e),
            None => state.position.legal_moves().next().ok_or(SelectionError::NoMove),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}
