//! Accept/decline decisions for incoming challenges.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::config::ChallengeFilter;
use crate::protocol::Challenge;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "decision", content = "reason", rename_all = "camelCase")]
pub enum Decision {
    Accept,
    Decline(DeclineReason),
}

impl Decision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Decision::Accept)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeclineReason {
    Variant(String),
    RatedOnly,
    CasualOnly,
    RatingTooHigh(u32),
    RatingTooLow(u32),
    RatingUnknown,
    Avoided(String),
    TimeControl(String),
    AtCapacity { active: usize, max: usize },
}

impl DeclineReason {
    /// Reason key understood by `POST /api/challenge/{id}/decline`.
    pub fn key(&self) -> &'static str {
        match self {
            DeclineReason::Variant(_) => "variant",
            DeclineReason::RatedOnly => "rated",
            DeclineReason::CasualOnly => "casual",
            DeclineReason::TimeControl(_) => "timeControl",
            DeclineReason::AtCapacity { .. } => "later",
            DeclineReason::RatingTooHigh(_)
            | DeclineReason::RatingTooLow(_)
            | DeclineReason::RatingUnknown
            | DeclineReason::Avoided(_) => "generic",
        }
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::Variant(v) => write!(f, "variant {} not accepted", v),
            DeclineReason::RatedOnly => write!(f, "only rated games accepted"),
            DeclineReason::CasualOnly => write!(f, "only casual games accepted"),
            DeclineReason::RatingTooHigh(_) => write!(f, "rating too high"),
            DeclineReason::RatingTooLow(_) => write!(f, "rating too low"),
            DeclineReason::RatingUnknown => write!(f, "opponent rating unknown"),
            DeclineReason::Avoided(name) => write!(f, "opponent {} is on the avoid list", name),
            DeclineReason::TimeControl(speed) => write!(f, "time control {} not accepted", speed),
            DeclineReason::AtCapacity { active, max } => {
                write!(f, "busy: {} active games, limit {}", active, max)
            }
        }
    }
}

/// Rules are checked top to bottom and the first match decides. Being on the
/// preferred list short-circuits to accept once the hard limits have passed.
pub fn evaluate(challenge: &Challenge, filter: &ChallengeFilter, active_sessions: usize) -> Decision {
    let challenger = &challenge.challenger;

    if !filter.variants.contains(&challenge.variant.key) {
        return Decision::Decline(DeclineReason::Variant(challenge.variant.key.clone()));
    }

    match filter.require_rated {
        Some(true) if !challenge.rated => return Decision::Decline(DeclineReason::RatedOnly),
        Some(false) if challenge.rated => return Decision::Decline(DeclineReason::CasualOnly),
        _ => {}
    }

    match challenger.rating {
        None => return Decision::Decline(DeclineReason::RatingUnknown),
        Some(r) if r > filter.max_rating => return Decision::Decline(DeclineReason::RatingTooHigh(r)),
        Some(r) if r < filter.min_rating => return Decision::Decline(DeclineReason::RatingTooLow(r)),
        Some(_) => {}
    }

    if filter.is_avoided(&challenger.id) || filter.is_avoided(&challenger.name) {
        return Decision::Decline(DeclineReason::Avoided(challenger.name.clone()));
    }

    if !filter.time_controls.contains(&challenge.speed) {
        return Decision::Decline(DeclineReason::TimeControl(challenge.speed.clone()));
    }

    if active_sessions >= filter.max_concurrent_challenges {
        return Decision::Decline(DeclineReason::AtCapacity {
            active: active_sessions,
            max: filter.max_concurrent_challenges,
        });
    }

    if filter.is_preferred(&challenger.id) || filter.is_preferred(&challenger.name) {
        debug!(challenger = %challenger.name, "preferred opponent");
        return Decision::Accept;
    }

    Decision::Accept
}
