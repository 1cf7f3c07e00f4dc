pub mod admission;
pub mod board;
pub mod config;
pub mod error;
pub mod game;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod selector;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use admission::{evaluate as evaluate_challenge, DeclineReason, Decision};
pub use board::{ChessRules, Position, RulesEngine, TerminalStatus};
pub use config::{BackoffConfig, BotConfig, ChallengeFilter};
pub use error::{DesyncError, DispatchError, RegistryError, SelectionError, TransportError};
pub use game::{GameSession, GameState, SessionStatus};
pub use orchestrator::{LifecycleEvent, Orchestrator};
pub use registry::SessionRegistry;
pub use scheduler::{ChallengeIntent, ChallengeScheduler};
pub use selector::{MaterialSelector, MoveSelector, RandomSelector};
pub use transport::{BotApi, LichessClient, StreamTransport};
