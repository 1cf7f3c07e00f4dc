use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_API_BASE: &str = "https://lichess.org";
const DEFAULT_MAX_CONCURRENT_GAMES: usize = 2;
const DEFAULT_COOLDOWN_SECS: u64 = 60 * 60;
const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_RETRY_CEILING: u32 = 3;
const DEFAULT_RATE_LIMIT_PAUSE_SECS: u64 = 60; // Lichess asks clients to wait a full minute after a 429
const DEFAULT_MOVE_TIME_FRACTION: f64 = 0.8;
const DEFAULT_STALE_AFTER_SECS: u64 = 10 * 60;
const DEFAULT_PENDING_CHALLENGE_SECS: u64 = 5 * 60;

/// Lichess writes a keep-alive newline every few seconds; this much silence
/// means the connection is dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(20);

/// Variants the rules engine can play; everything else needs its own move generator.
pub const SUPPORTED_VARIANTS: [&str; 2] = ["standard", "fromPosition"];

/// Accept/decline rules applied to incoming challenges.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ChallengeFilter {
    /// Variant keys as Lichess names them (`standard`, `chess960`, ...).
    pub variants: HashSet<String>,
    /// `None` accepts both rated and casual games.
    pub require_rated: Option<bool>,
    pub min_rating: u32,
    pub max_rating: u32,
    /// Speed categories (`bullet`, `blitz`, `rapid`, `classical`, ...).
    pub time_controls: HashSet<String>,
    pub avoid_list: HashSet<String>,
    pub preferred_list: HashSet<String>,
    pub max_concurrent_challenges: usize,
}

impl Default for ChallengeFilter {
    fn default() -> Self {
        Self {
            variants: ["standard"].iter().map(|v| v.to_string()).collect(),
            require_rated: None,
            min_rating: 0,
            max_rating: 4000,
            time_controls: ["bullet", "blitz", "rapid", "classical"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            avoid_list: HashSet::new(),
            preferred_list: HashSet::new(),
            max_concurrent_challenges: DEFAULT_MAX_CONCURRENT_GAMES,
        }
    }
}

impl ChallengeFilter {
    pub fn is_avoided(&self, opponent: &str) -> bool {
        contains_ignore_case(&self.avoid_list, opponent)
    }

    pub fn is_preferred(&self, opponent: &str) -> bool {
        contains_ignore_case(&self.preferred_list, opponent)
    }
}

// Lichess usernames are case-insensitive.
fn contains_ignore_case(set: &HashSet<String>, name: &str) -> bool {
    set.iter().any(|entry| entry.eq_ignore_ascii_case(name))
}

/// Reconnect delays for the streaming transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "secs")]
    pub initial: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
    pub factor: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    pub api_base: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub max_concurrent_games: usize,
    pub filter: ChallengeFilter,
    #[serde(with = "secs")]
    pub cooldown_period: Duration,
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    pub retry_ceiling: u32,
    pub backoff: BackoffConfig,
    #[serde(with = "secs")]
    pub rate_limit_pause: Duration,
    /// Share of our remaining clock a single move selection may use.
    pub move_time_fraction: f64,
    #[serde(with = "opt_secs")]
    pub max_think_time: Option<Duration>,
    #[serde(with = "secs")]
    pub stale_after: Duration,
    /// Silence after which a stream is dropped and reopened.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// How long an accepted or sent challenge holds a game slot while its
    /// `gameStart` is outstanding.
    #[serde(with = "secs")]
    pub pending_challenge_timeout: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            token: String::new(),
            max_concurrent_games: DEFAULT_MAX_CONCURRENT_GAMES,
            filter: ChallengeFilter::default(),
            cooldown_period: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_SECS),
            retry_ceiling: DEFAULT_RETRY_CEILING,
            backoff: BackoffConfig::default(),
            rate_limit_pause: Duration::from_secs(DEFAULT_RATE_LIMIT_PAUSE_SECS),
            move_time_fraction: DEFAULT_MOVE_TIME_FRACTION,
            max_think_time: None,
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pending_challenge_timeout: Duration::from_secs(DEFAULT_PENDING_CHALLENGE_SECS),
        }
    }
}

impl BotConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::new(format!("bad config file: {}", e)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::new("an API token is required"));
        }
        if self.max_concurrent_games == 0 {
            return Err(ConfigError::new("max_concurrent_games must be at least 1"));
        }
        if self.filter.max_concurrent_challenges > self.max_concurrent_games {
            return Err(ConfigError::new(format!(
                "max_concurrent_challenges {} exceeds max_concurrent_games {}",
                self.filter.max_concurrent_challenges, self.max_concurrent_games
            )));
        }
        if self.filter.min_rating > self.filter.max_rating {
            return Err(ConfigError::new(format!(
                "min_rating {} is above max_rating {}",
                self.filter.min_rating, self.filter.max_rating
            )));
        }
        if self.filter.variants.is_empty() {
            return Err(ConfigError::new("at least one variant must be allowed"));
        }
        if let Some(variant) = self
            .filter
            .variants
            .iter()
            .find(|v| !SUPPORTED_VARIANTS.contains(&v.as_str()))
        {
            return Err(ConfigError::new(format!("variant {} is not supported", variant)));
        }
        if self.retry_ceiling == 0 {
            return Err(ConfigError::new("retry_ceiling must be at least 1"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::new("poll_interval must be positive"));
        }
        if self.backoff.factor == 0 || self.backoff.initial > self.backoff.max {
            return Err(ConfigError::new("backoff must grow from initial up to max"));
        }
        if self.stale_after.is_zero() {
            return Err(ConfigError::new("stale_after must be positive"));
        }
        if self.idle_timeout.is_zero() || self.pending_challenge_timeout.is_zero() {
            return Err(ConfigError::new("idle_timeout and pending_challenge_timeout must be positive"));
        }
        if !(self.move_time_fraction > 0.0 && self.move_time_fraction <= 1.0) {
            return Err(ConfigError::new("move_time_fraction must be in (0, 1]"));
        }
        Ok(())
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(d).map(|v| v.map(Duration::from_secs))
    }
}
