//! Event types for debate observation
//!
//! One envelope per event: the session it belongs to, when it happened,
//! and a tagged payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::debate::consensus::ConsensusCheck;
use crate::debate::guardrails::TerminationReason;
use crate::debate::state::{DebateStatus, TurnState};

/// Envelope for every observable debate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DebateEvent {
    pub fn new(session_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        self.kind.event_type()
    }
}

/// All debate events, in the order a session can produce them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Session status moved.
    StatusChanged {
        from: DebateStatus,
        to: DebateStatus,
        reason: String,
    },

    /// A debate was configured and its task spawned.
    DebateStarted {
        topic: String,
        participants: Vec<String>,
        moderator: String,
        max_rounds: u32,
    },

    RoundStarted { round: u32 },

    /// A turn started streaming; `speaker` is now the current speaker.
    TurnOpened { round: u32, speaker: String },

    /// Coalesced text appended to the open turn.
    TurnAppended {
        round: u32,
        speaker: String,
        text: String,
    },

    /// A turn stopped streaming. `content` is authoritative.
    TurnFrozen {
        round: u32,
        speaker: String,
        state: TurnState,
        content: String,
        token_count: u32,
    },

    ConsensusChecked { check: ConsensusCheck },

    Concluded {
        reason: TerminationReason,
        rounds: u32,
        final_score: Option<f64>,
    },

    ConspectusStarted { moderator: String },

    ConspectusAppended { text: String },

    ConspectusReady { conspectus: String },

    /// Conspectus generation failed; the session stays concluded.
    ConspectusFailed { error: String },

    /// Orchestration failed; the session is in `error`.
    Failed { error: String },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::DebateStarted { .. } => "debate_started",
            Self::RoundStarted { .. } => "round_started",
            Self::TurnOpened { .. } => "turn_opened",
            Self::TurnAppended { .. } => "turn_appended",
            Self::TurnFrozen { .. } => "turn_frozen",
            Self::ConsensusChecked { .. } => "consensus_checked",
            Self::Concluded { .. } => "concluded",
            Self::ConspectusStarted { .. } => "conspectus_started",
            Self::ConspectusAppended { .. } => "conspectus_appended",
            Self::ConspectusReady { .. } => "conspectus_ready",
            Self::ConspectusFailed { .. } => "conspectus_failed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Whether this event ends the session's event stream.
    ///
    /// A concluded session may still publish conspectus events afterwards.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::ConspectusReady { .. } | Self::ConspectusFailed { .. } | Self::Failed { .. }
        )
    }
}
