//! Turn scheduler — one round-robin pass per round.
//!
//! Per participant, in registration order:
//!
//! ```text
//! stop? ──yes──▶ Stopped
//!   │no
//! pause gate (waits, never cancels in-flight calls)
//!   │
//! open turn ─▶ generate_turn ─▶ aggregate fragments
//!   │
//!   ├─ Ok(output)      → freeze Completed, add token usage
//!   ├─ Err(e) / panic  → freeze "[Error: e]", next participant
//!   └─ stop mid-call   → freeze Interrupted ─▶ Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::aggregator::{StreamDriver, StreamTarget, Streamed};
use super::state::{SessionError, SessionHandle, TurnResolution};
use crate::agent::{AgentCapability, FragmentSink, TurnRequest};
use crate::events::{EventKind, SessionEmitter};

/// Pause and stop signals owned by one running debate.
///
/// `stop` is a child of `lifetime`: a reset cancels both, an operator stop
/// only the former.
#[derive(Debug)]
pub struct DebateControl {
    paused: watch::Sender<bool>,
    stop: CancellationToken,
    lifetime: CancellationToken,
}

impl Default for DebateControl {
    fn default() -> Self {
        Self::new()
    }
}

impl DebateControl {
    pub fn new() -> Self {
        let lifetime = CancellationToken::new();
        Self {
            paused: watch::Sender::new(false),
            stop: lifetime.child_token(),
            lifetime,
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Cancel in-flight turn calls and stop scheduling new ones.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    /// Fires only on shutdown; used for work that outlives a stop.
    pub fn lifetime_token(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Cancel everything, including conspectus generation.
    pub fn shutdown(&self) {
        self.lifetime.cancel();
    }

    /// Wait until not paused. Returns `false` if stopped meanwhile.
    pub async fn wait_while_paused(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.stop.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            debug!("Scheduler paused before next turn");
            tokio::select! {
                _ = self.stop.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }
}

/// How a round's pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every participant had their turn.
    Completed,
    /// A stop cut the round short.
    Stopped,
}

/// Drives the speakers of one session through its rounds.
pub struct TurnScheduler<'a> {
    agent: Arc<dyn AgentCapability>,
    session: &'a SessionHandle,
    emitter: &'a SessionEmitter,
    control: &'a DebateControl,
    flush_interval: Duration,
}

impl<'a> TurnScheduler<'a> {
    pub fn new(
        agent: Arc<dyn AgentCapability>,
        session: &'a SessionHandle,
        emitter: &'a SessionEmitter,
        control: &'a DebateControl,
        flush_interval: Duration,
    ) -> Self {
        Self {
            agent,
            session,
            emitter,
            control,
            flush_interval,
        }
    }

    /// Run one pass over all participants for `round`.
    ///
    /// Capability failures never escape; only session invariant violations do.
    pub async fn run_round(&self, round: u32) -> Result<RoundOutcome, SessionError> {
        let speakers = self.session.with(|s| s.participants.len());

        for index in 0..speakers {
            if self.control.is_stopped() || self.session.with(|s| s.stop_requested) {
                return Ok(RoundOutcome::Stopped);
            }
            if !self.control.wait_while_paused().await {
                return Ok(RoundOutcome::Stopped);
            }

            let Some(request) = self.open_turn(index, round)? else {
                return Ok(RoundOutcome::Stopped);
            };
            let speaker = request.speaker.display_name.clone();
            debug!(round, speaker = %speaker, "Turn opened");
            self.emitter.emit(EventKind::TurnOpened {
                round,
                speaker: speaker.clone(),
            });

            let (sink, fragments) = FragmentSink::channel();
            let driver = StreamDriver::new(self.session, self.emitter, self.flush_interval);
            let streamed = driver
                .drive(
                    StreamTarget::Speaker(speaker.clone()),
                    self.agent.generate_turn(request, sink),
                    fragments,
                    self.control.stop_token(),
                )
                .await;

            let (resolution, stopped) = match streamed {
                Streamed::Finished(Ok(output)) => (TurnResolution::Completed(output), false),
                Streamed::Finished(Err(_)) if self.control.is_stopped() => {
                    (TurnResolution::Interrupted, true)
                }
                Streamed::Finished(Err(e)) => {
                    warn!(round, speaker = %speaker, error = %e, "Turn failed, continuing round");
                    (TurnResolution::Failed(e.to_string()), false)
                }
                Streamed::Cancelled => (TurnResolution::Interrupted, true),
            };

            let turn = self.session.with(|s| s.freeze_open_turn(resolution))?;
            info!(
                round,
                speaker = %turn.speaker,
                state = %turn.state,
                tokens = turn.token_count,
                "Turn frozen"
            );
            self.emitter.emit(EventKind::TurnFrozen {
                round,
                speaker: turn.speaker,
                state: turn.state,
                content: turn.content,
                token_count: turn.token_count,
            });

            if stopped {
                return Ok(RoundOutcome::Stopped);
            }
        }

        Ok(RoundOutcome::Completed)
    }

    fn open_turn(&self, index: usize, round: u32) -> Result<Option<TurnRequest>, SessionError> {
        let cancel = self.control.stop_token().clone();
        self.session.with(|s| {
            if s.open_turn(index, round)?.is_none() {
                return Ok(None);
            }
            let participant = s
                .participants
                .get(index)
                .ok_or(SessionError::UnknownParticipant(index))?;
            // The turn just opened is still streaming, so it is not part of
            // the context.
            Ok(Some(TurnRequest {
                topic: s.topic.clone(),
                speaker: participant.identity(),
                persona: participant.persona.clone(),
                temperature: participant.temperature,
                transcript: s.context_transcript(),
                max_tokens: s.max_tokens_per_turn,
                round,
                credential: participant.credential.clone(),
                cancel,
            }))
        })
    }
}
