//! Conspectus generator — the closing five-section summary.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::aggregator::{StreamDriver, StreamTarget, Streamed};
use super::state::SessionHandle;
use crate::agent::{AgentCapability, ConspectusRequest, FragmentSink};
use crate::config::ConspectusSettings;
use crate::events::{EventKind, SessionEmitter};

/// Asks the moderator for a conspectus of a concluded session.
pub struct ConspectusGenerator<'a> {
    agent: Arc<dyn AgentCapability>,
    session: &'a SessionHandle,
    emitter: &'a SessionEmitter,
    settings: &'a ConspectusSettings,
    flush_interval: Duration,
}

impl<'a> ConspectusGenerator<'a> {
    pub fn new(
        agent: Arc<dyn AgentCapability>,
        session: &'a SessionHandle,
        emitter: &'a SessionEmitter,
        settings: &'a ConspectusSettings,
        flush_interval: Duration,
    ) -> Self {
        Self {
            agent,
            session,
            emitter,
            settings,
            flush_interval,
        }
    }

    /// Generate and store the conspectus.
    ///
    /// Skipped for an empty transcript. Failure leaves the conspectus absent
    /// and is reported as an event only.
    pub async fn generate(&self, cancel: &CancellationToken) -> Option<String> {
        let request = self.begin(cancel.clone())?;
        let moderator = request.moderator.display_name.clone();
        info!(moderator = %moderator, rounds = request.rounds, "Generating conspectus");
        self.emitter.emit(EventKind::ConspectusStarted { moderator });

        let (sink, fragments) = FragmentSink::channel();
        let driver = StreamDriver::new(self.session, self.emitter, self.flush_interval);
        let streamed = driver
            .drive(
                StreamTarget::Conspectus,
                self.agent.generate_conspectus(request, sink),
                fragments,
                cancel,
            )
            .await;

        let failure = match streamed {
            Streamed::Finished(Ok(text)) if !text.trim().is_empty() => {
                self.session.with(|s| {
                    s.conspectus = Some(text.clone());
                    s.conspectus_draft = None;
                    s.generating_conspectus = false;
                });
                info!(chars = text.len(), "Conspectus ready");
                self.emitter.emit(EventKind::ConspectusReady {
                    conspectus: text.clone(),
                });
                return Some(text);
            }
            Streamed::Finished(Ok(_)) => "moderator returned an empty conspectus".to_string(),
            Streamed::Finished(Err(e)) => e.to_string(),
            Streamed::Cancelled => "cancelled".to_string(),
        };

        self.session.with(|s| {
            s.conspectus_draft = None;
            s.generating_conspectus = false;
        });
        warn!(error = %failure, "Conspectus generation failed");
        self.emitter
            .emit(EventKind::ConspectusFailed { error: failure });
        None
    }

    fn begin(&self, cancel: CancellationToken) -> Option<ConspectusRequest> {
        self.session.with(|s| {
            if s.transcript.is_empty() {
                return None;
            }
            let moderator = s.moderator()?;
            let request = ConspectusRequest {
                topic: s.topic.clone(),
                transcript: s.context_transcript(),
                participants: s.participant_names(),
                rounds: s.current_round,
                final_score: s.final_score().unwrap_or(0.0),
                moderator: moderator.identity(),
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_tokens,
                credential: moderator.credential.clone(),
                cancel,
            };
            s.generating_conspectus = true;
            s.conspectus_draft = Some(String::new());
            Some(request)
        })
    }
}
