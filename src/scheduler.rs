//! Outbound challenges: a priority queue drained on a timer, with a per-opponent
//! cooldown and a bounded number of attempts per entry.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{BotConfig, ChallengeFilter};
use crate::error::DispatchError;
use crate::orchestrator::{EventSink, LifecycleEvent};
use crate::protocol::Command;
use crate::registry::SharedOccupancy;
use crate::transport::StreamTransport;

// attempts remembered per opponent
const COOLDOWN_HISTORY: usize = 10;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockSetting {
    /// Initial time in seconds.
    pub limit: u32,
    pub increment: u32,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ChallengeIntent {
    pub target_opponent: String,
    /// Higher goes first.
    pub priority: i32,
    pub time_control: ClockSetting,
    pub rated: bool,
    pub variant: String,
    /// Free text, only logged.
    pub reason: String,
    pub attempts: u32,
    pub scheduled_not_before: Option<DateTime<Utc>>,
}

impl ChallengeIntent {
    pub fn new(target_opponent: impl Into<String>, priority: i32, limit: u32, increment: u32) -> Self {
        Self {
            target_opponent: target_opponent.into(),
            priority,
            time_control: ClockSetting { limit, increment },
            rated: false,
            variant: "standard".to_string(),
            reason: String::new(),
            attempts: 0,
            scheduled_not_before: None,
        }
    }

    pub fn rated(mut self, rated: bool) -> Self {
        self.rated = rated;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_not_before = Some(at);
        self
    }

    fn command(&self) -> Command {
        Command::CreateChallenge {
            username: self.target_opponent.clone(),
            rated: self.rated,
            clock_limit: self.time_control.limit,
            clock_increment: self.time_control.increment,
            variant: self.variant.clone(),
        }
    }
}

/// Last attempts per opponent, newest at the back.
#[derive(Debug)]
pub struct CooldownTracker {
    period: Duration,
    attempts: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl CooldownTracker {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            attempts: HashMap::new(),
        }
    }

    pub fn record(&mut self, opponent: &str, at: DateTime<Utc>) {
        let history = self.attempts.entry(opponent.to_lowercase()).or_default();
        history.push_back(at);
        while history.len() > COOLDOWN_HISTORY {
            history.pop_front();
        }
    }

    pub fn last_attempt(&self, opponent: &str) -> Option<DateTime<Utc>> {
        self.attempts
            .get(&opponent.to_lowercase())
            .and_then(|h| h.back().copied())
    }

    pub fn history(&self, opponent: &str) -> Vec<DateTime<Utc>> {
        self.attempts
            .get(&opponent.to_lowercase())
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn check(&self, opponent: &str, now: DateTime<Utc>) -> Result<(), DispatchError> {
        let Some(last) = self.last_attempt(opponent) else {
            return Ok(());
        };
        let in_window = match chrono::Duration::from_std(self.period) {
            Ok(period) => now - last < period,
            Err(_) => true,
        };
        if in_window {
            return Err(DispatchError::CooldownActive(opponent.to_string()));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    AtCapacity { active: usize },
    /// Nothing eligible right now.
    Idle,
    Dispatched(ChallengeIntent),
    Retrying { opponent: String, attempts: u32 },
    Dropped { opponent: String, attempts: u32 },
}

struct Entry {
    intent: ChallengeIntent,
    preferred: bool,
    seq: u64,
}

pub struct ChallengeScheduler {
    queue: Vec<Entry>,
    next_seq: u64,
    cooldowns: CooldownTracker,
    filter: ChallengeFilter,
    retry_ceiling: u32,
}

impl ChallengeScheduler {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            queue: Vec::new(),
            next_seq: 0,
            cooldowns: CooldownTracker::new(config.cooldown_period),
            filter: config.filter.clone(),
            retry_ceiling: config.retry_ceiling,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn cooldowns(&self) -> &CooldownTracker {
        &self.cooldowns
    }

    pub fn enqueue(&mut self, intent: ChallengeIntent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.push(intent, seq);
    }

    fn push(&mut self, intent: ChallengeIntent, seq: u64) {
        let preferred = self.filter.is_preferred(&intent.target_opponent);
        debug!(opponent = %intent.target_opponent, priority = intent.priority, preferred, "challenge queued");
        self.queue.push(Entry {
            intent,
            preferred,
            seq,
        });
    }

    /// Queue contents in dispatch order, ignoring eligibility.
    pub fn pending(&self) -> Vec<&ChallengeIntent> {
        let mut entries: Vec<&Entry> = self.queue.iter().collect();
        entries.sort_by_key(|e| Self::rank(e));
        entries.into_iter().map(|e| &e.intent).collect()
    }

    fn rank(entry: &Entry) -> (Reverse<i32>, bool, u64) {
        (Reverse(entry.intent.priority), !entry.preferred, entry.seq)
    }

    fn next_eligible(&self, now: DateTime<Utc>) -> Option<usize> {
        self.queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.intent.scheduled_not_before.map_or(true, |at| at <= now))
            .filter(|(_, e)| self.cooldowns.check(&e.intent.target_opponent, now).is_ok())
            .min_by_key(|(_, e)| Self::rank(e))
            .map(|(i, _)| i)
    }

    /// One timer tick: dispatch at most one challenge.
    pub async fn poll(
        &mut self,
        now: DateTime<Utc>,
        active_sessions: usize,
        transport: &StreamTransport,
    ) -> PollOutcome {
        if active_sessions >= self.filter.max_concurrent_challenges {
            return PollOutcome::AtCapacity {
                active: active_sessions,
            };
        }
        let Some(index) = self.next_eligible(now) else {
            return PollOutcome::Idle;
        };
        let Entry {
            mut intent,
            preferred: _,
            seq,
        } = self.queue.remove(index);

        self.cooldowns.record(&intent.target_opponent, now);
        let result = transport
            .submit(&intent.command())
            .await
            .map_err(|source| DispatchError::Transport {
                opponent: intent.target_opponent.clone(),
                source,
            });

        match result {
            Ok(()) => {
                info!(opponent = %intent.target_opponent, reason = %intent.reason, "challenge sent");
                PollOutcome::Dispatched(intent)
            }
            Err(e) => {
                intent.attempts += 1;
                let opponent = intent.target_opponent.clone();
                let attempts = intent.attempts;
                if attempts >= self.retry_ceiling {
                    warn!(%opponent, attempts, error = %e, "challenge dropped after repeated failures");
                    PollOutcome::Dropped { opponent, attempts }
                } else {
                    warn!(%opponent, attempts, error = %e, "challenge failed, will retry");
                    self.push(intent, seq);
                    PollOutcome::Retrying { opponent, attempts }
                }
            }
        }
    }

    /// Timer loop. New intents arrive on `intents`; the loop keeps draining the
    /// queue after the sender side is gone. A sent challenge holds a slot in
    /// `occupancy` until its game starts or it is answered.
    pub async fn run(
        mut self,
        transport: StreamTransport,
        occupancy: SharedOccupancy,
        mut intents: mpsc::UnboundedReceiver<ChallengeIntent>,
        events: EventSink,
        poll_interval: Duration,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut intents_open = true;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let active = occupancy.lock().total();
                    if let PollOutcome::Dispatched(intent) = self.poll(Utc::now(), active, &transport).await {
                        occupancy.lock().reserve_sent(&intent.target_opponent, Utc::now());
                        events.emit(LifecycleEvent::ChallengeDispatched {
                            opponent: intent.target_opponent,
                            priority: intent.priority,
                            attempts: intent.attempts,
                        });
                    }
                }
                intent = intents.recv(), if intents_open => match intent {
                    Some(intent) => self.enqueue(intent),
                    None => intents_open = false,
                },
            }
        }
    }
}
