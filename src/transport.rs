//! Streaming connection to the server.
//!
//! [`StreamTransport::connect`] turns a [`BotApi`] into an endless stream of raw
//! records: dropped connections, non-2xx answers, end-of-stream and silent
//! connections are all absorbed by reconnecting with exponential backoff.
//! Submissions are passed straight through and never retried here.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{BackoffConfig, BotConfig, DEFAULT_IDLE_TIMEOUT};
use crate::error::TransportError;
use crate::protocol::{Account, Command, StreamTarget};

pub type LineStream = BoxStream<'static, Result<String, TransportError>>;

const USER_AGENT: &str = concat!("rival-lichess-bot/", env!("CARGO_PKG_VERSION"));

/// The remote platform as the bot sees it.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Opens one streaming connection. Keep-alives come through as empty lines.
    async fn open_stream(&self, target: &StreamTarget) -> Result<LineStream, TransportError>;

    async fn submit(&self, command: &Command) -> Result<(), TransportError>;

    async fn account(&self) -> Result<Account, TransportError>;
}

/// Authenticated client for the Lichess HTTP API.
#[derive(Clone)]
pub struct LichessClient {
    http: reqwest::Client,
    base: String,
    token: String,
    rate_limit_pause: Duration,
}

impl LichessClient {
    pub fn new(config: &BotConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            rate_limit_pause: config.rate_limit_pause,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited {
                pause: self.rate_limit_pause,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl BotApi for LichessClient {
    async fn open_stream(&self, target: &StreamTarget) -> Result<LineStream, TransportError> {
        let response = self
            .http
            .get(self.url(&target.path()))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = self.check(response).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(TransportError::from));
        Ok(split_lines(bytes))
    }

    async fn submit(&self, command: &Command) -> Result<(), TransportError> {
        let response = self
            .http
            .post(self.url(&command.path()))
            .bearer_auth(&self.token)
            .form(&command.form())
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn account(&self) -> Result<Account, TransportError> {
        let response = self
            .http
            .get(self.url("/api/account"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(self.check(response).await?.json().await?)
    }
}

/// Re-chunks a byte stream into trimmed text lines. Blank lines (keep-alives)
/// are yielded as empty strings; a trailing partial line is kept if non-empty.
pub fn split_lines<S>(bytes: S) -> LineStream
where
    S: Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static,
{
    struct State<S> {
        bytes: std::pin::Pin<Box<S>>,
        buffer: Vec<u8>,
        ready: VecDeque<String>,
        done: bool,
    }

    fn line(raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).trim().to_string()
    }

    let state = State {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        ready: VecDeque::new(),
        done: false,
    };
    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(line) = state.ready.pop_front() {
                return Some((Ok(line), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    while let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                        let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                        state.ready.push_back(line(&raw));
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
                None => {
                    state.done = true;
                    let rest = line(&std::mem::take(&mut state.buffer));
                    if !rest.is_empty() {
                        state.ready.push_back(rest);
                    }
                }
            }
        }
    })
    .boxed()
}

/// Exponential reconnect delay with a ceiling.
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    next: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let next = config.initial;
        Self { config, next }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * self.config.factor).min(self.config.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial;
    }
}

/// Items of a transport stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawEvent {
    Record(String),
    /// A fresh connection replaced a lost one, after `failures` failed attempts.
    Reconnected { failures: u32 },
}

#[derive(Clone)]
pub struct StreamTransport {
    api: Arc<dyn BotApi>,
    backoff: BackoffConfig,
    idle_timeout: Duration,
}

impl StreamTransport {
    pub fn new(api: Arc<dyn BotApi>, backoff: BackoffConfig) -> Self {
        Self {
            api,
            backoff,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub async fn submit(&self, command: &Command) -> Result<(), TransportError> {
        self.api.submit(command).await
    }

    pub async fn account(&self) -> Result<Account, TransportError> {
        self.api.account().await
    }

    /// Lazy and endless: nothing is opened until the stream is polled, and it
    /// never ends on its own. Drop it to disconnect.
    ///
    /// The backoff only resets once a connection has delivered data, so a
    /// server that accepts and immediately hangs up still sees growing delays.
    pub fn connect(&self, target: StreamTarget) -> BoxStream<'static, RawEvent> {
        struct State {
            api: Arc<dyn BotApi>,
            target: StreamTarget,
            backoff: Backoff,
            idle_timeout: Duration,
            current: Option<LineStream>,
            connected_before: bool,
            // whether the current connection produced anything yet
            received: bool,
            failures: u32,
        }

        let state = State {
            api: self.api.clone(),
            target,
            backoff: Backoff::new(self.backoff.clone()),
            idle_timeout: self.idle_timeout,
            current: None,
            connected_before: false,
            received: false,
            failures: 0,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                match state.current.as_mut() {
                    None => match state.api.open_stream(&state.target).await {
                        Ok(lines) => {
                            state.current = Some(lines);
                            state.received = false;
                            let failures = std::mem::take(&mut state.failures);
                            if state.connected_before {
                                info!(target_path = %state.target.path(), failures, "stream reconnected");
                                return Some((RawEvent::Reconnected { failures }, state));
                            }
                            state.connected_before = true;
                            debug!(target_path = %state.target.path(), "stream connected");
                        }
                        Err(e) => {
                            state.failures += 1;
                            let delay = match &e {
                                TransportError::RateLimited { pause } => *pause,
                                _ => state.backoff.next_delay(),
                            };
                            warn!(target_path = %state.target.path(), error = %e, ?delay, "stream connect failed");
                            tokio::time::sleep(delay).await;
                        }
                    },
                    Some(lines) => {
                        let error = match tokio::time::timeout(state.idle_timeout, lines.next()).await {
                            Ok(Some(Ok(line))) => {
                                if !state.received {
                                    state.received = true;
                                    state.backoff.reset();
                                }
                                if line.is_empty() {
                                    continue;
                                }
                                return Some((RawEvent::Record(line), state));
                            }
                            Ok(Some(Err(e))) => e,
                            Ok(None) => TransportError::Closed,
                            Err(_) => TransportError::Idle(state.idle_timeout),
                        };
                        let delay = state.backoff.next_delay();
                        warn!(target_path = %state.target.path(), error = %error, ?delay, "stream lost");
                        state.current = None;
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
        .boxed()
    }
}
