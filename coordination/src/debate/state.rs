//! Debate state machine — status, transitions, and session data.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::aggregator::StreamTarget;
use super::consensus::ConsensusCheck;
use super::guardrails::TerminationReason;
use crate::agent::{AgentIdentity, CredentialHandle, TokenUsage, TranscriptEntry, TurnOutput};
use crate::config::DebateConfig;

/// Lifecycle status of a debate session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStatus {
    /// No debate configured.
    #[default]
    Idle,
    /// Configured, debate task not yet running.
    Pending,
    /// Rounds in progress.
    Running,
    /// Operator paused; the scheduler holds before the next turn.
    Paused,
    /// Finished — by consensus, stagnation, round limit, or stop.
    Concluded,
    /// Orchestration failed; only a reset recovers.
    Error,
}

impl DebateStatus {
    /// Whether this status ends the session until a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Concluded | Self::Error)
    }

    /// Whether a debate task may be alive in this status.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(self) -> &'static [DebateStatus] {
        match self {
            Self::Idle => &[Self::Pending],
            Self::Pending => &[Self::Running, Self::Paused, Self::Concluded, Self::Error],
            Self::Running => &[Self::Paused, Self::Concluded, Self::Error],
            Self::Paused => &[Self::Running, Self::Concluded, Self::Error],
            Self::Concluded | Self::Error => &[Self::Idle],
        }
    }
}

impl std::fmt::Display for DebateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Concluded => write!(f, "concluded"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A status transition record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: DebateStatus,
    pub to: DebateStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Error for invalid status transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {from} → {to}: {reason}")]
pub struct TransitionError {
    pub from: DebateStatus,
    pub to: DebateStatus,
    pub reason: String,
}

/// Violations of the session's ordering invariants.
///
/// These never come from a capability; they mean the orchestration itself
/// went wrong, and they move the session to [`DebateStatus::Error`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("turn for {speaker} is still streaming")]
    TurnAlreadyOpen { speaker: String },

    #[error("no turn is currently streaming")]
    NoOpenTurn,

    #[error("round {got} started out of order (expected {expected})")]
    RoundOutOfOrder { expected: u32, got: u32 },

    #[error("round {round} exceeds the configured maximum of {max}")]
    RoundLimit { round: u32, max: u32 },

    #[error("consensus check for round {got} out of order (expected {expected})")]
    ConsensusOutOfOrder { expected: u32, got: u32 },

    #[error("no participant at position {0}")]
    UnknownParticipant(usize),
}

fn default_temperature() -> f32 {
    0.7
}

/// A registered debater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Provider binding used to route capability calls.
    pub provider: String,
    pub model: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Environment variable holding this participant's secret, if loaded from a file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
    #[serde(skip)]
    pub credential: CredentialHandle,
}

impl Participant {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            display_name: display_name.into(),
            persona: None,
            temperature: default_temperature(),
            credential_env: None,
            credential: CredentialHandle::default(),
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_credential(mut self, credential: CredentialHandle) -> Self {
        self.credential = credential;
        self
    }

    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            provider: self.provider.clone(),
            model: self.model.clone(),
            display_name: self.display_name.clone(),
        }
    }
}

/// Where a turn is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    /// Fragments still arriving.
    Streaming,
    /// Frozen with the capability's final content.
    Completed,
    /// Frozen with an error marker; the round carried on.
    Failed,
    /// Frozen by a stop; keeps whatever had streamed in.
    Interrupted,
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Streaming => write!(f, "streaming"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One participant's contribution within one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: String,
    pub provider: String,
    pub model: String,
    /// Round number (1-indexed).
    pub round: u32,
    pub content: String,
    pub state: TurnState,
    /// Only meaningful once the turn is no longer streaming.
    pub token_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Turn {
    fn open(participant: &Participant, round: u32) -> Self {
        Self {
            speaker: participant.display_name.clone(),
            provider: participant.provider.clone(),
            model: participant.model.clone(),
            round,
            content: String::new(),
            state: TurnState::Streaming,
            token_count: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state == TurnState::Streaming
    }

    fn entry(&self) -> TranscriptEntry {
        TranscriptEntry {
            speaker: self.speaker.clone(),
            round: self.round,
            content: self.content.clone(),
        }
    }
}

/// How an open turn gets frozen.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResolution {
    Completed(TurnOutput),
    Failed(String),
    Interrupted,
}

/// Full state of one debate session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSession {
    pub id: String,
    pub topic: String,
    /// Fixed speaking order.
    pub participants: Vec<Participant>,
    /// Index into `participants` of the moderator.
    pub moderator: usize,
    pub max_rounds: u32,
    pub max_tokens_per_turn: u32,
    pub consensus_threshold: f64,
    pub status: DebateStatus,
    pub current_round: u32,
    pub current_speaker: Option<String>,
    /// Append-only.
    pub transcript: Vec<Turn>,
    /// Append-only, one per completed round.
    pub consensus_history: Vec<ConsensusCheck>,
    pub token_usage: TokenUsage,
    pub conspectus: Option<String>,
    /// Text streamed so far while the conspectus is being generated.
    pub conspectus_draft: Option<String>,
    pub generating_conspectus: bool,
    pub termination: Option<TerminationReason>,
    pub stop_requested: bool,
    pub error: Option<String>,
    pub transitions: Vec<StatusTransition>,
    pub created_at: DateTime<Utc>,
}

impl Default for DebateSession {
    fn default() -> Self {
        Self::idle()
    }
}

impl DebateSession {
    /// An empty, unconfigured session.
    pub fn idle() -> Self {
        Self {
            id: String::new(),
            topic: String::new(),
            participants: Vec::new(),
            moderator: 0,
            max_rounds: 0,
            max_tokens_per_turn: 0,
            consensus_threshold: 0.0,
            status: DebateStatus::Idle,
            current_round: 0,
            current_speaker: None,
            transcript: Vec::new(),
            consensus_history: Vec::new(),
            token_usage: TokenUsage::new(),
            conspectus: None,
            conspectus_draft: None,
            generating_conspectus: false,
            termination: None,
            stop_requested: false,
            error: None,
            transitions: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// A fresh session for a validated config, still in `Idle`.
    pub fn from_config(config: &DebateConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: config.topic.trim().to_string(),
            participants: config.participants.clone(),
            moderator: config.moderator_index(),
            max_rounds: config.max_rounds,
            max_tokens_per_turn: config.max_tokens_per_turn,
            consensus_threshold: config.consensus_threshold,
            ..Self::idle()
        }
    }

    /// Transition to a new status with a reason.
    pub fn transition(&mut self, to: DebateStatus, reason: &str) -> Result<(), TransitionError> {
        if !self.status.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.status,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.status.valid_transitions()
                ),
            });
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
        });
        self.status = to;
        Ok(())
    }

    /// Record an operator stop. Returns `false` if there is nothing to stop.
    ///
    /// The session concludes immediately; the debate task notices the flag
    /// and stops appending turns or checks.
    pub fn request_stop(&mut self) -> Result<bool, TransitionError> {
        if !self.status.is_active() {
            return Ok(false);
        }
        self.transition(DebateStatus::Concluded, "stopped by operator")?;
        self.stop_requested = true;
        self.termination = Some(TerminationReason::Stopped);
        self.current_speaker = None;
        Ok(true)
    }

    /// Advance to the next round.
    pub fn begin_round(&mut self, round: u32) -> Result<(), SessionError> {
        let expected = self.current_round + 1;
        if round != expected {
            return Err(SessionError::RoundOutOfOrder { expected, got: round });
        }
        if round > self.max_rounds {
            return Err(SessionError::RoundLimit {
                round,
                max: self.max_rounds,
            });
        }
        self.current_round = round;
        Ok(())
    }

    /// Open a streaming turn for the participant at `index`.
    ///
    /// Returns `Ok(None)` once a stop has been requested.
    pub fn open_turn(&mut self, index: usize, round: u32) -> Result<Option<&Turn>, SessionError> {
        if self.stop_requested {
            return Ok(None);
        }
        if let Some(open) = self.transcript.iter().find(|t| t.is_streaming()) {
            return Err(SessionError::TurnAlreadyOpen {
                speaker: open.speaker.clone(),
            });
        }
        let participant = self
            .participants
            .get(index)
            .ok_or(SessionError::UnknownParticipant(index))?;

        self.current_speaker = Some(participant.display_name.clone());
        self.transcript.push(Turn::open(participant, round));
        Ok(self.transcript.last())
    }

    /// Append flushed text to the open stream for `target`.
    ///
    /// Returns the round the text landed in, or `None` when nothing is open
    /// for that target and the text was dropped.
    pub fn apply_fragment(&mut self, target: &StreamTarget, text: &str) -> Option<u32> {
        match target {
            StreamTarget::Speaker(name) => {
                let turn = self
                    .transcript
                    .iter_mut()
                    .rev()
                    .find(|t| t.is_streaming() && &t.speaker == name)?;
                turn.content.push_str(text);
                Some(turn.round)
            }
            StreamTarget::Conspectus => {
                let draft = self.conspectus_draft.as_mut()?;
                draft.push_str(text);
                Some(self.current_round)
            }
        }
    }

    /// Freeze the open turn.
    pub fn freeze_open_turn(&mut self, resolution: TurnResolution) -> Result<Turn, SessionError> {
        let turn = self
            .transcript
            .iter_mut()
            .rev()
            .find(|t| t.is_streaming())
            .ok_or(SessionError::NoOpenTurn)?;

        match resolution {
            TurnResolution::Completed(output) => {
                turn.content = output.content;
                turn.token_count = output.token_count;
                turn.state = TurnState::Completed;
                *self.token_usage.entry(turn.speaker.clone()).or_insert(0) +=
                    u64::from(output.token_count);
            }
            TurnResolution::Failed(message) => {
                turn.content = format!("[Error: {}]", message);
                turn.state = TurnState::Failed;
            }
            TurnResolution::Interrupted => {
                turn.state = TurnState::Interrupted;
            }
        }
        turn.finished_at = Some(Utc::now());
        let frozen = turn.clone();
        self.current_speaker = None;
        Ok(frozen)
    }

    /// Every frozen turn so far, in speaking order.
    pub fn context_transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript
            .iter()
            .filter(|t| !t.is_streaming())
            .map(Turn::entry)
            .collect()
    }

    /// Successfully completed turns of one round, in speaking order.
    pub fn round_transcript(&self, round: u32) -> Vec<TranscriptEntry> {
        self.transcript
            .iter()
            .filter(|t| t.round == round && t.state == TurnState::Completed)
            .map(Turn::entry)
            .collect()
    }

    /// Raw content of one round's completed turns.
    pub fn round_responses(&self, round: u32) -> Vec<String> {
        self.round_transcript(round)
            .into_iter()
            .map(|e| e.content)
            .collect()
    }

    /// Append a consensus check. Returns `false` (and drops it) after a stop.
    pub fn record_consensus(&mut self, check: ConsensusCheck) -> Result<bool, SessionError> {
        if self.stop_requested {
            return Ok(false);
        }
        if check.round != self.current_round
            || self.consensus_history.last().map(|c| c.round) >= Some(check.round)
        {
            return Err(SessionError::ConsensusOutOfOrder {
                expected: self.current_round,
                got: check.round,
            });
        }
        self.consensus_history.push(check);
        Ok(true)
    }

    pub fn moderator(&self) -> Option<&Participant> {
        self.participants.get(self.moderator)
    }

    pub fn participant_names(&self) -> Vec<String> {
        self.participants
            .iter()
            .map(|p| p.display_name.clone())
            .collect()
    }

    /// Score of the latest consensus check.
    pub fn final_score(&self) -> Option<f64> {
        self.consensus_history.last().map(|c| c.score)
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_usage.values().sum()
    }

    /// Compact status line.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] round {}/{} | {} turns | {} checks | speaker={}",
            self.status,
            self.current_round,
            self.max_rounds,
            self.transcript.len(),
            self.consensus_history.len(),
            self.current_speaker.as_deref().unwrap_or("-")
        )
    }
}

/// Shared, lock-guarded session.
///
/// The debate task is the only writer of turns and checks; operator calls
/// (pause, resume, stop) only flip status through the same lock.
#[derive(Debug, Clone, Default)]
pub struct SessionHandle(Arc<Mutex<DebateSession>>);

impl SessionHandle {
    pub fn new(session: DebateSession) -> Self {
        Self(Arc::new(Mutex::new(session)))
    }

    /// Run `f` with exclusive access to the session.
    pub fn with<R>(&self, f: impl FnOnce(&mut DebateSession) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Clone of the current session.
    pub fn snapshot(&self) -> DebateSession {
        self.with(|s| s.clone())
    }
}
