//! Debate orchestrator — the state machine that drives a whole session.
//!
//! Ties together the turn scheduler, consensus engine, termination
//! guardrails and conspectus generator. One [`DebateEngine`] runs at most one
//! session at a time; the session is driven by a single spawned task, and
//! operator calls (pause, resume, stop, reset) only flip status and signals.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::consensus::{ConsensusEngine, RoundEvidence};
use super::conspectus::ConspectusGenerator;
use super::guardrails::{TerminationPolicy, TerminationReason};
use super::scheduler::{DebateControl, RoundOutcome, TurnScheduler};
use super::state::{
    DebateSession, DebateStatus, SessionError, SessionHandle, TransitionError, TurnResolution,
};
use crate::agent::{panic_message, AgentCapability};
use crate::config::{ConfigError, DebateConfig, EngineConfig};
use crate::events::{EventBus, EventKind, SessionEmitter, SharedEventBus, Subscription};

/// Errors from the debate engine's public API and its orchestration.
#[derive(Debug, Error)]
pub enum DebateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("a debate is already {0}; reset before starting another")]
    NotIdle(DebateStatus),

    #[error("no debate is running")]
    NoActiveDebate,

    #[error("debate task panicked: {0}")]
    Panicked(String),
}

struct Runtime {
    control: Arc<DebateControl>,
    task: Option<JoinHandle<()>>,
    /// Cancelled when the debate task has finished, conspectus included.
    finished: CancellationToken,
}

impl Runtime {
    fn idle() -> Self {
        let finished = CancellationToken::new();
        finished.cancel();
        Self {
            control: Arc::new(DebateControl::new()),
            task: None,
            finished,
        }
    }
}

/// Public handle to the debate state machine.
pub struct DebateEngine {
    agent: Arc<dyn AgentCapability>,
    config: EngineConfig,
    session: SessionHandle,
    events: SharedEventBus,
    runtime: Mutex<Runtime>,
}

impl DebateEngine {
    pub fn new(agent: Arc<dyn AgentCapability>, config: EngineConfig) -> Self {
        let events = EventBus::new().shared();
        Self {
            agent,
            config,
            session: SessionHandle::new(DebateSession::idle()),
            events,
            runtime: Mutex::new(Runtime::idle()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Clone of the current session state.
    pub fn snapshot(&self) -> DebateSession {
        self.session.snapshot()
    }

    pub fn status(&self) -> DebateStatus {
        self.session.with(|s| s.status)
    }

    /// Subscribe to every event this engine publishes from now on.
    ///
    /// Nothing is dropped for a subscriber that reads late.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> SharedEventBus {
        self.events.clone()
    }

    fn lock_runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emitter(&self, session_id: &str) -> SessionEmitter {
        SessionEmitter::new(self.events.clone(), session_id)
    }

    /// Configure a new debate and spawn its task. Returns the session id.
    ///
    /// Only allowed while idle. Must be called from within a Tokio runtime.
    pub fn start(&self, config: DebateConfig) -> Result<String, DebateError> {
        config.validate()?;
        self.config.validate()?;

        let mut runtime = self.lock_runtime();
        let fresh = DebateSession::from_config(&config);
        let session_id = fresh.id.clone();
        self.session.with(|s| -> Result<(), DebateError> {
            if s.status != DebateStatus::Idle {
                return Err(DebateError::NotIdle(s.status));
            }
            *s = fresh;
            s.transition(DebateStatus::Pending, "debate configured")?;
            Ok(())
        })?;

        let emitter = self.emitter(&session_id);
        let moderator = config.participants[config.moderator_index()]
            .display_name
            .clone();
        info!(
            session_id = %session_id,
            topic = %config.topic.trim(),
            participants = config.participants.len(),
            moderator = %moderator,
            max_rounds = config.max_rounds,
            "Debate started"
        );
        emitter.emit(EventKind::StatusChanged {
            from: DebateStatus::Idle,
            to: DebateStatus::Pending,
            reason: "debate configured".into(),
        });
        emitter.emit(EventKind::DebateStarted {
            topic: config.topic.trim().to_string(),
            participants: config
                .participants
                .iter()
                .map(|p| p.display_name.clone())
                .collect(),
            moderator,
            max_rounds: config.max_rounds,
        });

        let control = Arc::new(DebateControl::new());
        let finished = CancellationToken::new();
        let ctx = RunContext {
            agent: self.agent.clone(),
            config: self.config.clone(),
            session: self.session.clone(),
            emitter,
            control: control.clone(),
        };
        let done = finished.clone();
        let task = tokio::spawn(async move {
            let _done = done.drop_guard();
            supervise(ctx).await;
        });

        *runtime = Runtime {
            control,
            task: Some(task),
            finished,
        };
        Ok(session_id)
    }

    /// Hold the scheduler before the next turn. In-flight calls continue.
    ///
    /// Also accepted while the debate is still pending: the gate is closed
    /// before the first turn opens.
    pub fn pause(&self) -> Result<(), DebateError> {
        self.operator_transition(
            &[DebateStatus::Pending, DebateStatus::Running],
            DebateStatus::Paused,
            "paused by operator",
            |c| c.pause(),
        )
    }

    /// Release a pause; the next participant speaks immediately.
    pub fn resume(&self) -> Result<(), DebateError> {
        self.operator_transition(
            &[DebateStatus::Paused],
            DebateStatus::Running,
            "resumed by operator",
            |c| c.resume(),
        )
    }

    fn operator_transition(
        &self,
        allowed: &[DebateStatus],
        to: DebateStatus,
        reason: &str,
        signal: impl FnOnce(&DebateControl),
    ) -> Result<(), DebateError> {
        let runtime = self.lock_runtime();
        let (session_id, from) = self.session.with(|s| -> Result<_, DebateError> {
            if !s.status.is_active() {
                return Err(DebateError::NoActiveDebate);
            }
            let from = s.status;
            if !allowed.contains(&from) {
                return Err(TransitionError {
                    from,
                    to,
                    reason: format!("{} is only valid from {:?}", reason, allowed),
                }
                .into());
            }
            s.transition(to, reason)?;
            Ok((s.id.clone(), from))
        })?;
        signal(runtime.control.as_ref());

        info!(session_id = %session_id, from = %from, to = %to, "{}", reason);
        self.emitter(&session_id).emit(EventKind::StatusChanged {
            from,
            to,
            reason: reason.to_string(),
        });
        Ok(())
    }

    /// Conclude the debate now. The in-flight call is cancelled; nothing
    /// further is appended except the conspectus.
    pub fn stop(&self) -> Result<(), DebateError> {
        let runtime = self.lock_runtime();
        let (session_id, from, stopped) = self.session.with(|s| -> Result<_, DebateError> {
            let from = s.status;
            let stopped = s.request_stop()?;
            Ok((s.id.clone(), from, stopped))
        })?;
        if !stopped {
            return Err(DebateError::NoActiveDebate);
        }
        runtime.control.stop();

        info!(session_id = %session_id, from = %from, "Debate stopped by operator");
        self.emitter(&session_id).emit(EventKind::StatusChanged {
            from,
            to: DebateStatus::Concluded,
            reason: "stopped by operator".into(),
        });
        Ok(())
    }

    /// Abort any running task and discard all session data.
    pub async fn reset(&self) {
        let (task, control) = {
            let mut runtime = self.lock_runtime();
            let old = std::mem::replace(&mut *runtime, Runtime::idle());
            (old.task, old.control)
        };

        control.shutdown();
        if let Some(task) = task {
            task.abort();
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(error = %e, "Debate task panicked during reset");
                }
            }
        }

        let (session_id, from) = self.session.with(|s| {
            let previous = (s.id.clone(), s.status);
            *s = DebateSession::idle();
            previous
        });
        if from != DebateStatus::Idle {
            info!(session_id = %session_id, from = %from, "Debate reset");
            self.emitter(&session_id).emit(EventKind::StatusChanged {
                from,
                to: DebateStatus::Idle,
                reason: "reset".into(),
            });
        }
    }

    /// Wait until the debate task (conspectus included) has finished.
    ///
    /// Returns immediately when no debate task exists.
    pub async fn wait(&self) {
        let finished = self.lock_runtime().finished.clone();
        finished.cancelled().await;
    }
}

impl Drop for DebateEngine {
    fn drop(&mut self) {
        let runtime = self.lock_runtime();
        runtime.control.shutdown();
        if let Some(task) = runtime.task.as_ref() {
            task.abort();
        }
    }
}

struct RunContext {
    agent: Arc<dyn AgentCapability>,
    config: EngineConfig,
    session: SessionHandle,
    emitter: SessionEmitter,
    control: Arc<DebateControl>,
}

async fn supervise(ctx: RunContext) {
    let error = match AssertUnwindSafe(run(&ctx)).catch_unwind().await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(payload) => DebateError::Panicked(panic_message(payload.as_ref())),
    };
    fail(&ctx, &error.to_string());
}

/// Move the session to `error`, freezing any turn left open.
fn fail(ctx: &RunContext, message: &str) {
    error!(session_id = %ctx.emitter.session_id(), error = %message, "Debate failed");
    ctx.control.stop();

    let transition = ctx.session.with(|s| {
        if s.transcript.iter().any(|t| t.is_streaming()) {
            let _ = s.freeze_open_turn(TurnResolution::Interrupted);
        }
        s.current_speaker = None;
        s.generating_conspectus = false;
        s.conspectus_draft = None;
        s.error = Some(message.to_string());

        let from = s.status;
        if from.is_active() && s.transition(DebateStatus::Error, message).is_ok() {
            Some(from)
        } else {
            None
        }
    });

    if let Some(from) = transition {
        ctx.emitter.emit(EventKind::StatusChanged {
            from,
            to: DebateStatus::Error,
            reason: message.to_string(),
        });
    }
    ctx.emitter.emit(EventKind::Failed {
        error: message.to_string(),
    });
}

async fn run(ctx: &RunContext) -> Result<(), DebateError> {
    let started = ctx.session.with(|s| -> Result<bool, TransitionError> {
        // An operator pause may already have moved a pending session on.
        if s.stop_requested || s.status != DebateStatus::Pending {
            return Ok(false);
        }
        s.transition(DebateStatus::Running, "debate task started")?;
        Ok(true)
    })?;
    if started {
        ctx.emitter.emit(EventKind::StatusChanged {
            from: DebateStatus::Pending,
            to: DebateStatus::Running,
            reason: "debate task started".into(),
        });
    }

    let reason = run_rounds(ctx).await?;
    conclude(ctx, reason)?;

    let generator = ConspectusGenerator::new(
        ctx.agent.clone(),
        &ctx.session,
        &ctx.emitter,
        &ctx.config.conspectus,
        ctx.config.flush_interval,
    );
    generator.generate(ctx.control.lifetime_token()).await;
    Ok(())
}

async fn run_rounds(ctx: &RunContext) -> Result<TerminationReason, DebateError> {
    let (threshold, max_rounds) = ctx
        .session
        .with(|s| (s.consensus_threshold, s.max_rounds));
    let mut termination =
        TerminationPolicy::new(threshold, max_rounds, ctx.config.scoring.stagnation_limit);
    let scheduler = TurnScheduler::new(
        ctx.agent.clone(),
        &ctx.session,
        &ctx.emitter,
        &ctx.control,
        ctx.config.flush_interval,
    );
    let consensus = ConsensusEngine::new(
        ctx.agent.clone(),
        ctx.config.scoring.clone(),
        ctx.config.judge.clone(),
    );

    loop {
        if ctx.control.is_stopped() || ctx.session.with(|s| s.stop_requested) {
            return Ok(TerminationReason::Stopped);
        }

        let round = ctx.session.with(|s| {
            let round = s.current_round + 1;
            s.begin_round(round).map(|_| round)
        })?;
        info!(session_id = %ctx.emitter.session_id(), round, "Round started");
        ctx.emitter.emit(EventKind::RoundStarted { round });

        if scheduler.run_round(round).await? == RoundOutcome::Stopped {
            return Ok(TerminationReason::Stopped);
        }

        let (evidence, moderator) = ctx.session.with(|s| {
            let evidence = RoundEvidence {
                topic: s.topic.clone(),
                round,
                transcript: s.round_transcript(round),
                previous: (round > 1).then(|| s.round_responses(round - 1)),
            };
            (evidence, s.moderator().cloned())
        });
        let moderator = moderator.ok_or(SessionError::UnknownParticipant(0))?;

        let stop = ctx.control.stop_token();
        let check = tokio::select! {
            biased;
            _ = stop.cancelled() => return Ok(TerminationReason::Stopped),
            check = consensus.evaluate(evidence, &moderator, stop.clone()) => check,
        };

        if !ctx.session.with(|s| s.record_consensus(check.clone()))? {
            return Ok(TerminationReason::Stopped);
        }
        info!(
            round,
            score = check.score,
            stagnation = check.stagnation_detected,
            "Consensus checked"
        );
        ctx.emitter.emit(EventKind::ConsensusChecked {
            check: check.clone(),
        });

        let outcome = termination.evaluate(&check);
        if let Some(reason) = outcome.reason() {
            info!(round, outcome = %outcome, "Termination rule fired");
            return Ok(reason);
        }
    }
}

fn conclude(ctx: &RunContext, reason: TerminationReason) -> Result<(), DebateError> {
    let (from, reason, rounds, final_score) =
        ctx.session.with(|s| -> Result<_, TransitionError> {
            let from = s.status;
            let reason = if s.stop_requested {
                TerminationReason::Stopped
            } else if reason == TerminationReason::Stopped {
                s.request_stop()?;
                reason
            } else {
                s.transition(DebateStatus::Concluded, &reason.to_string())?;
                s.termination = Some(reason);
                reason
            };
            s.current_speaker = None;
            Ok((from, reason, s.current_round, s.final_score()))
        })?;

    info!(
        session_id = %ctx.emitter.session_id(),
        reason = %reason,
        rounds,
        final_score = ?final_score,
        "Debate concluded"
    );
    if from != DebateStatus::Concluded {
        ctx.emitter.emit(EventKind::StatusChanged {
            from,
            to: DebateStatus::Concluded,
            reason: reason.to_string(),
        });
    }
    ctx.emitter.emit(EventKind::Concluded {
        reason,
        rounds,
        final_score,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            DebateError::NotIdle(DebateStatus::Concluded).to_string(),
            "a debate is already concluded; reset before starting another"
        );
        assert_eq!(DebateError::NoActiveDebate.to_string(), "no debate is running");
    }
}
