//! Agent capabilities consumed by the debate engine.
//!
//! The engine never speaks a vendor wire protocol. Everything it needs from a
//! model provider goes through [`AgentCapability`]:
//!
//! | Call                   | Streams fragments | Used by                  |
//! |------------------------|-------------------|--------------------------|
//! | `generate_turn`        | yes               | turn scheduler           |
//! | `judge_consensus`      | no                | consensus engine         |
//! | `generate_conspectus`  | yes               | conspectus generator     |
//!
//! Fragments are pushed into a [`FragmentSink`]; the engine drains the other
//! end from the same task that owns the session, so implementations never
//! touch shared debate state.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::debate::consensus::ModeratorJudgment;

pub mod prompts;
mod router;

pub use router::ProviderRouter;

/// Errors surfaced by an agent capability.
///
/// None of these are fatal to a debate: the engine converts each one into
/// the matching non-fatal outcome (error-marked turn, defaulted judgment,
/// absent conspectus).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no credential bound for provider {0}")]
    MissingCredential(String),

    #[error("no capability registered for provider {0}")]
    UnknownProvider(String),

    #[error("request cancelled")]
    Cancelled,
}

impl AgentError {
    /// A panic inside a capability call, reported as a provider failure.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::Provider(format!("capability panicked: {}", panic_message(payload)))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Await one capability call. A panic inside it becomes
/// [`AgentError::Provider`] instead of unwinding into the engine.
pub(crate) async fn catch_panic<T, F>(call: F) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| Err(AgentError::from_panic(payload.as_ref())))
}

/// Opaque per-participant secret handed through to the capability unchanged.
///
/// Never serialised; `Debug` output is redacted.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialHandle(String);

impl CredentialHandle {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for the capability that owns the provider binding.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for CredentialHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "CredentialHandle(<unset>)")
        } else {
            write!(f, "CredentialHandle(<redacted>)")
        }
    }
}

/// Stable identity of a participant as seen by a capability.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Provider binding (e.g. `"anthropic"`, `"openai"`).
    pub provider: String,
    /// Model name at that provider.
    pub model: String,
    /// Name the other speakers see.
    pub display_name: String,
}

/// One finished contribution, as handed to a capability for context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub speaker: String,
    pub round: u32,
    pub content: String,
}

/// Sending half of a fragment stream.
///
/// Capabilities push text fragments here in arrival order. Empty fragments are
/// ignored. Once the engine stops listening (turn frozen, debate stopped),
/// `send` returns `false` and the capability should wind down.
#[derive(Debug, Clone)]
pub struct FragmentSink {
    tx: mpsc::UnboundedSender<String>,
}

impl FragmentSink {
    /// Create a sink and the receiver the engine drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Push one fragment. Returns `false` if nobody is listening any more.
    pub fn send(&self, fragment: impl Into<String>) -> bool {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return !self.tx.is_closed();
        }
        self.tx.send(fragment).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Request for a single speaker turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub topic: String,
    pub speaker: AgentIdentity,
    pub persona: Option<String>,
    pub temperature: f32,
    /// Every frozen turn so far, across all rounds, in speaking order.
    pub transcript: Vec<TranscriptEntry>,
    pub max_tokens: u32,
    pub round: u32,
    pub credential: CredentialHandle,
    /// Fires when the operator stops the debate.
    pub cancel: CancellationToken,
}

/// Authoritative result of a finished turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutput {
    pub content: String,
    pub token_count: u32,
}

/// Request for the moderator's structured consensus judgment.
#[derive(Debug, Clone)]
pub struct JudgeRequest {
    pub topic: String,
    pub round: u32,
    pub round_transcript: Vec<TranscriptEntry>,
    /// Raw responses of the previous round, `None` for round 1.
    pub previous_round: Option<Vec<String>>,
    pub moderator: AgentIdentity,
    pub temperature: f32,
    pub max_tokens: u32,
    pub credential: CredentialHandle,
    pub cancel: CancellationToken,
}

/// Request for the closing conspectus.
#[derive(Debug, Clone)]
pub struct ConspectusRequest {
    pub topic: String,
    pub transcript: Vec<TranscriptEntry>,
    pub participants: Vec<String>,
    pub rounds: u32,
    pub final_score: f64,
    pub moderator: AgentIdentity,
    pub temperature: f32,
    pub max_tokens: u32,
    pub credential: CredentialHandle,
    pub cancel: CancellationToken,
}

/// The provider-facing capability the engine drives.
///
/// Implementations adapt these calls to a vendor protocol. They must be
/// cancel-safe: the engine drops the returned future when the debate is
/// stopped, and also fires `cancel` on the request.
#[async_trait]
pub trait AgentCapability: Send + Sync {
    /// Stream one turn into `fragments`, then return the final content and
    /// token count.
    async fn generate_turn(
        &self,
        request: TurnRequest,
        fragments: FragmentSink,
    ) -> Result<TurnOutput, AgentError>;

    /// Produce a structured judgment of one completed round.
    async fn judge_consensus(&self, request: JudgeRequest) -> Result<ModeratorJudgment, AgentError>;

    /// Stream the five-section conspectus, then return its final text.
    async fn generate_conspectus(
        &self,
        request: ConspectusRequest,
        fragments: FragmentSink,
    ) -> Result<String, AgentError>;
}

/// Token usage keyed by participant display name.
pub type TokenUsage = BTreeMap<String, u64>;
