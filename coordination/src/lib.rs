//! Agora Coordination Library
//!
//! This library provides the debate orchestration engine:
//! - Round-robin turn scheduling with pause/resume/stop control
//! - Streaming token aggregation with a bounded update rate
//! - Three-signal consensus scoring and termination rules
//! - A closing conspectus written by the moderator
//!
//! Model providers are reached only through the [`agent::AgentCapability`]
//! trait; transport, credentials capture and presentation live elsewhere.
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use agora_coordination::{DebateConfig, DebateEngine, EngineConfig, Participant};
//!
//! let engine = DebateEngine::new(Arc::new(my_capability), EngineConfig::from_env()?);
//! let mut events = engine.subscribe();
//!
//! engine.start(DebateConfig::new(
//!     "Is virtue teachable?",
//!     vec![
//!         Participant::new("anthropic", "claude-sonnet-4-20250514", "Socrates"),
//!         Participant::new("openai", "gpt-4o", "Meno"),
//!     ],
//! ))?;
//!
//! while let Ok(event) = events.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod agent;
pub mod config;
pub mod cost;
pub mod debate;
pub mod events;

// Re-export the engine surface
pub use agent::{
    AgentCapability, AgentError, AgentIdentity, ConspectusRequest, CredentialHandle,
    FragmentSink, JudgeRequest, ProviderRouter, TokenUsage, TranscriptEntry, TurnOutput,
    TurnRequest,
};
pub use config::{ConfigError, ConspectusSettings, DebateConfig, EngineConfig, JudgeSettings};
pub use debate::{
    ConsensusCheck, DebateEngine, DebateError, DebateSession, DebateStatus, ModeratorJudgment,
    Participant, ScoringPolicy, StagnationSource, TerminationReason, Turn, TurnState,
};
pub use events::{DebateEvent, EventBus, EventKind};
