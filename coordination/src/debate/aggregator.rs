//! Token aggregation — coalesces streamed fragments into rate-bounded updates.
//!
//! Fragments from a capability arrive on an mpsc channel and are consumed by
//! the same task that owns the turn, so flushes and freezes of one turn never
//! interleave. The flush timer exists only while a stream is being driven:
//! it is created on the first fragment and dropped after a final forced
//! flush when the call finishes or is cancelled.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::state::SessionHandle;
use crate::agent::{catch_panic, AgentError};
use crate::events::{EventKind, SessionEmitter};

/// What a buffered fragment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StreamTarget {
    /// The open turn of the named speaker.
    Speaker(String),
    /// The conspectus document.
    Conspectus,
}

impl std::fmt::Display for StreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Speaker(name) => write!(f, "speaker:{}", name),
            Self::Conspectus => write!(f, "conspectus"),
        }
    }
}

/// Pending fragment buffers, one per target, in first-arrival order.
#[derive(Debug, Default)]
pub struct TokenAggregator {
    pending: Vec<(StreamTarget, String)>,
}

impl TokenAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a fragment for `target`. Empty fragments are ignored.
    pub fn push(&mut self, target: &StreamTarget, fragment: &str) {
        if fragment.is_empty() {
            return;
        }
        match self.pending.iter_mut().find(|(t, _)| t == target) {
            Some((_, buffer)) => buffer.push_str(fragment),
            None => self.pending.push((target.clone(), fragment.to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take every pending buffer.
    pub fn drain(&mut self) -> Vec<(StreamTarget, String)> {
        std::mem::take(&mut self.pending)
    }

    /// Apply pending text to the session and publish one update per target.
    ///
    /// Text for a target with nothing open is dropped. Returns the number of
    /// updates published; an empty aggregator publishes nothing.
    pub fn flush(&mut self, session: &SessionHandle, emitter: &SessionEmitter) -> usize {
        if self.is_empty() {
            return 0;
        }

        let mut published = 0;
        for (target, text) in self.drain() {
            let Some(round) = session.with(|s| s.apply_fragment(&target, &text)) else {
                debug!(%target, dropped = text.len(), "No open stream, dropping fragments");
                continue;
            };
            debug!(%target, bytes = text.len(), "Flushed fragments");
            let kind = match target {
                StreamTarget::Speaker(speaker) => EventKind::TurnAppended {
                    round,
                    speaker,
                    text,
                },
                StreamTarget::Conspectus => EventKind::ConspectusAppended { text },
            };
            emitter.emit(kind);
            published += 1;
        }
        published
    }
}

/// How a driven stream ended.
#[derive(Debug)]
pub enum Streamed<T> {
    /// The capability call returned.
    Finished(Result<T, AgentError>),
    /// The cancel token fired first; the call future was dropped.
    Cancelled,
}

/// Drives one streaming capability call while aggregating its fragments.
pub struct StreamDriver<'a> {
    session: &'a SessionHandle,
    emitter: &'a SessionEmitter,
    flush_interval: Duration,
}

impl<'a> StreamDriver<'a> {
    pub fn new(session: &'a SessionHandle, emitter: &'a SessionEmitter, flush_interval: Duration) -> Self {
        Self {
            session,
            emitter,
            flush_interval,
        }
    }

    /// Await `call`, flushing fragments from `fragments` into `target` every
    /// flush interval. A final flush always runs before returning.
    ///
    /// A panic inside `call` finishes the stream as a provider error.
    pub async fn drive<T, F>(
        &self,
        target: StreamTarget,
        call: F,
        mut fragments: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> Streamed<T>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        let mut aggregator = TokenAggregator::new();
        let mut ticker: Option<Interval> = None;
        let mut fragments_open = true;
        let call = catch_panic(call);
        tokio::pin!(call);

        let outcome = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break Streamed::Cancelled,

                fragment = fragments.recv(), if fragments_open => match fragment {
                    Some(text) => {
                        if ticker.is_none() {
                            ticker = Some(self.start_ticker());
                        }
                        aggregator.push(&target, &text);
                    }
                    None => fragments_open = false,
                },

                _ = next_tick(&mut ticker) => {
                    aggregator.flush(self.session, self.emitter);
                }

                result = &mut call => break Streamed::Finished(result),
            }
        };

        while let Ok(text) = fragments.try_recv() {
            aggregator.push(&target, &text);
        }
        aggregator.flush(self.session, self.emitter);
        drop(ticker);
        outcome
    }

    fn start_ticker(&self) -> Interval {
        let period = self.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DebateConfig;
    use crate::debate::state::{DebateSession, DebateStatus, Participant};
    use crate::events::{EventBus, Subscription};

    fn setup() -> (SessionHandle, SessionEmitter, Subscription) {
        let config = DebateConfig::new(
            "topic",
            vec![
                Participant::new("p", "m", "S"),
                Participant::new("p", "m", "T"),
            ],
        );
        let mut session = DebateSession::from_config(&config);
        session.transition(DebateStatus::Pending, "test").unwrap();
        session.transition(DebateStatus::Running, "test").unwrap();
        session.begin_round(1).unwrap();
        session.open_turn(0, 1).unwrap();
        let id = session.id.clone();

        let bus = EventBus::new().shared();
        let rx = bus.subscribe();
        (SessionHandle::new(session), SessionEmitter::new(bus, id), rx)
    }

    fn appended(rx: &mut Subscription) -> Vec<String> {
        let mut texts = Vec::new();
        while let Some(event) = rx.try_recv() {
            if let EventKind::TurnAppended { text, .. } = event.kind {
                texts.push(text);
            }
        }
        texts
    }

    #[test]
    fn test_push_concatenates_in_arrival_order() {
        let mut agg = TokenAggregator::new();
        let s = StreamTarget::Speaker("S".into());
        agg.push(&s, "Hel");
        agg.push(&StreamTarget::Conspectus, "doc");
        agg.push(&s, "");
        agg.push(&s, "lo ");
        let drained = agg.drain();
        assert_eq!(
            drained,
            vec![(s, "Hello ".to_string()), (StreamTarget::Conspectus, "doc".to_string())]
        );
        assert!(agg.is_empty());
    }

    #[test]
    fn test_flush_appends_exactly_the_buffered_text() {
        let (session, emitter, mut rx) = setup();
        let mut agg = TokenAggregator::new();
        let s = StreamTarget::Speaker("S".into());
        agg.push(&s, "Hel");
        agg.push(&s, "lo ");

        assert_eq!(agg.flush(&session, &emitter), 1);
        assert_eq!(session.snapshot().transcript[0].content, "Hello ");
        assert_eq!(appended(&mut rx), vec!["Hello "]);

        // Nothing pending: no mutation, no event.
        assert_eq!(agg.flush(&session, &emitter), 0);
        assert_eq!(session.snapshot().transcript[0].content, "Hello ");
        assert!(appended(&mut rx).is_empty());
    }

    #[test]
    fn test_flush_drops_text_without_open_turn() {
        let (session, emitter, mut rx) = setup();
        let mut agg = TokenAggregator::new();
        agg.push(&StreamTarget::Speaker("T".into()), "stale");
        assert_eq!(agg.flush(&session, &emitter), 0);
        assert!(agg.is_empty());
        assert!(session.snapshot().transcript[0].content.is_empty());
        assert!(appended(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_coalesces_bursts_per_interval() {
        let (session, emitter, mut rx) = setup();
        let driver = StreamDriver::new(&session, &emitter, Duration::from_millis(50));
        let (sink, fragments) = crate::agent::FragmentSink::channel();

        let call = async move {
            for word in ["a", "b", "c"] {
                sink.send(word);
            }
            tokio::time::sleep(Duration::from_millis(120)).await;
            sink.send("d");
            Ok::<_, AgentError>("abcd".to_string())
        };

        let cancel = CancellationToken::new();
        let outcome = driver
            .drive(StreamTarget::Speaker("S".into()), call, fragments, &cancel)
            .await;

        assert!(matches!(outcome, Streamed::Finished(Ok(ref s)) if s == "abcd"));
        assert_eq!(session.snapshot().transcript[0].content, "abcd");
        assert_eq!(appended(&mut rx), vec!["abc", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_cancelled_still_flushes() {
        let (session, emitter, _rx) = setup();
        let driver = StreamDriver::new(&session, &emitter, Duration::from_millis(50));
        let (sink, fragments) = crate::agent::FragmentSink::channel();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        let call = async move {
            sink.send("partial");
            trigger.cancel();
            std::future::pending::<Result<(), AgentError>>().await
        };

        let outcome = driver
            .drive(StreamTarget::Speaker("S".into()), call, fragments, &cancel)
            .await;
        assert!(matches!(outcome, Streamed::Cancelled));
        assert_eq!(session.snapshot().transcript[0].content, "partial");
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_contains_capability_panic() {
        let (session, emitter, mut rx) = setup();
        let driver = StreamDriver::new(&session, &emitter, Duration::from_millis(50));
        let (sink, fragments) = crate::agent::FragmentSink::channel();
        let cancel = CancellationToken::new();

        async fn half_then_panic(sink: crate::agent::FragmentSink) -> Result<String, AgentError> {
            sink.send("half ");
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("decoder exploded")
        }
        let outcome = driver
            .drive(
                StreamTarget::Speaker("S".into()),
                half_then_panic(sink),
                fragments,
                &cancel,
            )
            .await;

        assert!(matches!(
            outcome,
            Streamed::Finished(Err(AgentError::Provider(ref m))) if m.contains("decoder exploded")
        ));
        // Text streamed before the panic is still flushed.
        assert_eq!(session.snapshot().transcript[0].content, "half ");
        assert_eq!(appended(&mut rx), vec!["half "]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drive_reports_capability_error() {
        let (session, emitter, _rx) = setup();
        let driver = StreamDriver::new(&session, &emitter, Duration::from_millis(50));
        let (_sink, fragments) = crate::agent::FragmentSink::channel();
        let cancel = CancellationToken::new();

        let call = async { Err::<String, _>(AgentError::Provider("503".into())) };
        let outcome = driver
            .drive(StreamTarget::Speaker("S".into()), call, fragments, &cancel)
            .await;
        assert!(matches!(
            outcome,
            Streamed::Finished(Err(AgentError::Provider(_)))
        ));
    }
}
