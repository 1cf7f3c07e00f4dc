use std::time::Duration;

/// Failures talking to the remote server. Streaming failures are absorbed by the
/// reconnect loop; submission failures are handed back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server answered {code}: {body}")]
    Status { code: u16, body: String },

    #[error("rate limited by server, pausing for {pause:?}")]
    RateLimited { pause: Duration },

    #[error("failed to decode record: {reason}")]
    Decode { reason: String },

    #[error("stream closed by server")]
    Closed,

    #[error("no data on the stream for {0:?}")]
    Idle(Duration),
}

impl TransportError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, TransportError::RateLimited { .. })
    }

    /// The server understood the request and refused it; sending it again
    /// will not help.
    pub fn is_rejection(&self) -> bool {
        matches!(self, TransportError::Status { code, .. } if (400..500).contains(code))
    }
}

/// The locally held position no longer agrees with the server's move list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DesyncError {
    #[error("move {index} ({uci}) is illegal in the local position")]
    IllegalReplay { index: usize, uci: String },

    #[error("server history diverges at move {index}: local {local}, server {server}")]
    HistoryMismatch {
        index: usize,
        local: String,
        server: String,
    },

    #[error("initial position could not be parsed: {0}")]
    InitialPosition(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("selector produced no move")]
    NoMove,

    #[error("selection exceeded its time budget of {0:?}")]
    TimedOut(Duration),

    #[error("selector failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("capacity reached ({max} concurrent games), refusing game {game_id}")]
    Capacity { game_id: String, max: usize },

    #[error("no session for game {0}")]
    UnknownSession(String),

    #[error("session for game {0} already exists")]
    DuplicateSession(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("challenge to {opponent} failed: {source}")]
    Transport {
        opponent: String,
        #[source]
        source: TransportError,
    },

    #[error("opponent {0} is still cooling down")]
    CooldownActive(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoveError {
    #[error("cannot parse move {0:?}")]
    Parse(String),

    #[error("illegal move {0}")]
    Illegal(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid configuration: {reason}")]
pub struct ConfigError {
    pub reason: String,
}

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let err = RegistryError::Capacity {
            game_id: "g1".to_string(),
            max: 2,
        };
        assert_eq!(
            err.to_string(),
            "capacity reached (2 concurrent games), refusing game g1"
        );

        let err = DesyncError::IllegalReplay {
            index: 3,
            uci: "e2e5".to_string(),
        };
        assert_eq!(err.to_string(), "move 3 (e2e5) is illegal in the local position");
    }

    #[test]
    fn rate_limit_is_recognised() {
        let err = TransportError::RateLimited {
            pause: Duration::from_secs(60),
        };
        assert!(err.is_rate_limit());
        assert!(!TransportError::Closed.is_rate_limit());
    }

    #[test]
    fn only_client_errors_count_as_rejections() {
        let status = |code| TransportError::Status {
            code,
            body: String::new(),
        };
        assert!(status(400).is_rejection());
        assert!(!status(503).is_rejection());
        assert!(!TransportError::Closed.is_rejection());
        assert!(!TransportError::RateLimited {
            pause: Duration::from_secs(60)
        }
        .is_rejection());
    }
}
