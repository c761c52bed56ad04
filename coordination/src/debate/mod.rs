//! Debate Orchestration — round-robin deliberation with consensus scoring
//!
//! A session moves through a small state machine while a single task drives
//! its rounds. Every round is one pass over the participants in registration
//! order, followed by one consensus check and one evaluation of the
//! termination rules.
//!
//! # Debate Flow
//!
//! ```text
//! Idle → Pending → Running ⇄ Paused
//!                     │
//!   ┌─────────────────┘
//!   ▼
//! round N: speaker 1 → speaker 2 → … → consensus check
//!   │                                        │
//!   │        ┌───────────────────────────────┤
//!   │        ├─ score ≥ threshold     → Concluded (consensus_reached)
//!   │        ├─ 3 stagnant in a row   → Concluded (stagnation_exhausted)
//!   │        ├─ N == max_rounds       → Concluded (rounds_exhausted)
//!   │        └─ otherwise             → round N+1
//!   │
//!   └─ stop at any point → Concluded (stopped)
//!
//! Concluded → conspectus (moderator) ; orchestration failure → Error
//! Concluded / Error ──reset──▶ Idle
//! ```

pub mod aggregator;
pub mod consensus;
pub mod conspectus;
pub mod guardrails;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use aggregator::{StreamDriver, StreamTarget, Streamed, TokenAggregator};
pub use consensus::{
    detect_stagnation, extract_judgment, marker_score, score_round, word_overlap, ConsensusCheck,
    ConsensusEngine, ModeratorJudgment, RoundEvidence, ScoringPolicy, StagnationSource,
};
pub use conspectus::ConspectusGenerator;
pub use guardrails::{TerminationOutcome, TerminationPolicy, TerminationReason};
pub use orchestrator::{DebateEngine, DebateError};
pub use scheduler::{DebateControl, RoundOutcome, TurnScheduler};
pub use state::{
    DebateSession, DebateStatus, Participant, SessionError, SessionHandle, StatusTransition,
    TransitionError, Turn, TurnResolution, TurnState,
};
