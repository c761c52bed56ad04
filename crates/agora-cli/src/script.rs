//! Scripted agent capability for offline rehearsals.
//!
//! A script file pins every provider answer up front:
//!
//! ```toml
//! fragment_delay_ms = 20
//!
//! [[turns]]
//! speaker = "Socrates"
//! round = 1
//! text = "Can virtue be taught at all?"
//!
//! [[turns]]
//! speaker = "Meno"            # no round: used for every round
//! text = "I agree it can be learned."
//!
//! [[judgments]]
//! round = 1
//! consensus_score = 0.4
//! agreed_points = ["virtue matters"]
//!
//! [conspectus]
//! text = "## Overview\n..."
//! ```
//!
//! Turn and conspectus text is streamed word by word. Anything missing from
//! the script fails that call, which exercises the engine's failure paths.
//! The prompts a live provider would have received are logged at debug.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use agora_coordination::agent::prompts;
use agora_coordination::{
    AgentCapability, AgentError, ConspectusRequest, FragmentSink, JudgeRequest, ModeratorJudgment,
    TurnOutput, TurnRequest,
};

fn default_fragment_delay_ms() -> u64 {
    25
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    /// Pause before each streamed word.
    #[serde(default = "default_fragment_delay_ms")]
    pub fragment_delay_ms: u64,
    #[serde(default)]
    pub turns: Vec<ScriptedTurn>,
    #[serde(default)]
    pub judgments: Vec<ScriptedJudgment>,
    #[serde(default)]
    pub conspectus: Option<ScriptedConspectus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedTurn {
    pub speaker: String,
    /// Round this answer belongs to; every round when unset.
    #[serde(default)]
    pub round: Option<u32>,
    #[serde(default)]
    pub text: String,
    /// Reported token count; the word count when unset.
    #[serde(default)]
    pub tokens: Option<u32>,
    /// Fail the turn with this provider error instead of answering.
    #[serde(default)]
    pub fail: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedJudgment {
    pub round: u32,
    #[serde(default)]
    pub fail: Option<String>,
    #[serde(flatten)]
    pub judgment: ModeratorJudgment,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedConspectus {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub fail: Option<String>,
}

impl Script {
    pub fn from_toml_str(body: &str) -> Result<Self> {
        toml::from_str(body).context("invalid rehearsal script")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read script {}", path.display()))?;
        Self::from_toml_str(&body).with_context(|| format!("in {}", path.display()))
    }

    /// Exact round match first, then the speaker's any-round entry.
    pub fn turn(&self, speaker: &str, round: u32) -> Option<&ScriptedTurn> {
        let mut entries = self.turns.iter().filter(|t| t.speaker == speaker);
        let exact = entries.clone().find(|t| t.round == Some(round));
        exact.or_else(|| entries.find(|t| t.round.is_none()))
    }

    pub fn judgment(&self, round: u32) -> Option<&ScriptedJudgment> {
        self.judgments.iter().find(|j| j.round == round)
    }
}

/// Capability that replays a [`Script`].
pub struct ScriptedAgent {
    script: Script,
}

impl ScriptedAgent {
    pub fn new(script: Script) -> Self {
        Self { script }
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.script.fragment_delay_ms)
    }

    async fn stream(&self, text: &str, fragments: &FragmentSink) -> Result<(), AgentError> {
        for word in text.split_inclusive(char::is_whitespace) {
            if self.script.fragment_delay_ms > 0 {
                tokio::time::sleep(self.delay()).await;
            }
            if !fragments.send(word) {
                return Err(AgentError::Cancelled);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AgentCapability for ScriptedAgent {
    async fn generate_turn(
        &self,
        request: TurnRequest,
        fragments: FragmentSink,
    ) -> Result<TurnOutput, AgentError> {
        let speaker = &request.speaker.display_name;
        let turn = self.script.turn(speaker, request.round).ok_or_else(|| {
            AgentError::Provider(format!(
                "no scripted turn for {} in round {}",
                speaker, request.round
            ))
        })?;
        if let Some(message) = &turn.fail {
            return Err(AgentError::Provider(message.clone()));
        }

        debug!(
            speaker = %speaker,
            round = request.round,
            system = %prompts::speaker_system_prompt(speaker, request.persona.as_deref()),
            prompt = %prompts::turn_prompt(&request),
            "Replaying scripted turn"
        );
        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
            streamed = self.stream(&turn.text, &fragments) => streamed?,
        }

        let token_count = turn
            .tokens
            .unwrap_or_else(|| turn.text.split_whitespace().count() as u32);
        Ok(TurnOutput {
            content: turn.text.clone(),
            token_count,
        })
    }

    async fn judge_consensus(&self, request: JudgeRequest) -> Result<ModeratorJudgment, AgentError> {
        debug!(
            round = request.round,
            prompt = %prompts::consensus_prompt(&request),
            "Replaying scripted judgment"
        );
        let entry = self.script.judgment(request.round).ok_or_else(|| {
            AgentError::Provider(format!("no scripted judgment for round {}", request.round))
        })?;
        match &entry.fail {
            Some(message) => Err(AgentError::Provider(message.clone())),
            None => Ok(entry.judgment.clone()),
        }
    }

    async fn generate_conspectus(
        &self,
        request: ConspectusRequest,
        fragments: FragmentSink,
    ) -> Result<String, AgentError> {
        let conspectus = self
            .script
            .conspectus
            .as_ref()
            .ok_or_else(|| AgentError::Provider("no scripted conspectus".into()))?;
        if let Some(message) = &conspectus.fail {
            return Err(AgentError::Provider(message.clone()));
        }

        debug!(
            rounds = request.rounds,
            prompt = %prompts::conspectus_prompt(&request),
            "Replaying scripted conspectus"
        );
        tokio::select! {
            biased;
            _ = request.cancel.cancelled() => return Err(AgentError::Cancelled),
            streamed = self.stream(&conspectus.text, &fragments) => streamed?,
        }
        Ok(conspectus.text.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_coordination::{AgentIdentity, CredentialHandle, TranscriptEntry};
    use tokio_util::sync::CancellationToken;

    const SCRIPT: &str = r###"
fragment_delay_ms = 0

[[turns]]
speaker = "Socrates"
round = 1
text = "Can virtue be taught?"

[[turns]]
speaker = "Socrates"
text = "Then it is knowledge."
tokens = 42

[[turns]]
speaker = "Meno"
round = 2
fail = "rate limited"

[[judgments]]
round = 1
consensus_score = 0.7
agreed_points = ["virtue matters"]

[[judgments]]
round = 2
fail = "timeout"

[conspectus]
text = "## Overview\nDone."
"###;

    fn identity(name: &str) -> AgentIdentity {
        AgentIdentity {
            provider: "script".into(),
            model: "replay".into(),
            display_name: name.into(),
        }
    }

    fn turn_request(speaker: &str, round: u32) -> TurnRequest {
        TurnRequest {
            topic: "Is virtue teachable?".into(),
            speaker: identity(speaker),
            persona: None,
            temperature: 0.7,
            transcript: vec![],
            max_tokens: 512,
            round,
            credential: CredentialHandle::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn judge_request(round: u32) -> JudgeRequest {
        JudgeRequest {
            topic: "Is virtue teachable?".into(),
            round,
            round_transcript: vec![],
            previous_round: None,
            moderator: identity("Socrates"),
            temperature: 0.1,
            max_tokens: 512,
            credential: CredentialHandle::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn agent() -> ScriptedAgent {
        ScriptedAgent::new(Script::from_toml_str(SCRIPT).unwrap())
    }

    #[test]
    fn test_turn_lookup_prefers_exact_round() {
        let script = Script::from_toml_str(SCRIPT).unwrap();
        assert_eq!(
            script.turn("Socrates", 1).unwrap().text,
            "Can virtue be taught?"
        );
        assert_eq!(
            script.turn("Socrates", 7).unwrap().text,
            "Then it is knowledge."
        );
        assert!(script.turn("Meno", 1).is_none());
        assert!(script.turn("Gorgias", 1).is_none());
    }

    #[test]
    fn test_defaults_and_invalid_script() {
        let script = Script::from_toml_str("").unwrap();
        assert_eq!(script.fragment_delay_ms, 25);
        assert!(script.conspectus.is_none());

        assert!(Script::from_toml_str("turns = 3").is_err());
    }

    #[tokio::test]
    async fn test_turn_streams_word_by_word() {
        let (sink, mut rx) = FragmentSink::channel();
        let output = agent()
            .generate_turn(turn_request("Socrates", 1), sink)
            .await
            .unwrap();
        assert_eq!(output.content, "Can virtue be taught?");
        assert_eq!(output.token_count, 4);

        let mut streamed = Vec::new();
        while let Ok(fragment) = rx.try_recv() {
            streamed.push(fragment);
        }
        assert_eq!(streamed, vec!["Can ", "virtue ", "be ", "taught?"]);
    }

    #[tokio::test]
    async fn test_turn_uses_scripted_token_count() {
        let (sink, _rx) = FragmentSink::channel();
        let output = agent()
            .generate_turn(turn_request("Socrates", 3), sink)
            .await
            .unwrap();
        assert_eq!(output.token_count, 42);
    }

    #[tokio::test]
    async fn test_failures_and_missing_entries() {
        let agent = agent();
        let (sink, _rx) = FragmentSink::channel();
        let err = agent
            .generate_turn(turn_request("Meno", 2), sink.clone())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Provider("rate limited".into()));

        let err = agent
            .generate_turn(turn_request("Meno", 1), sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no scripted turn for Meno"));

        assert!(agent.judge_consensus(judge_request(2)).await.is_err());
        assert!(agent.judge_consensus(judge_request(3)).await.is_err());
    }

    #[tokio::test]
    async fn test_judgment_fields_come_from_script() {
        let judgment = agent().judge_consensus(judge_request(1)).await.unwrap();
        assert_eq!(judgment.consensus_score, 0.7);
        assert_eq!(judgment.agreed_points, vec!["virtue matters"]);
        assert!(!judgment.stagnation);
        assert!(judgment.summary.is_empty());
    }

    #[tokio::test]
    async fn test_closed_sink_cancels_stream() {
        let (sink, rx) = FragmentSink::channel();
        drop(rx);
        let err = agent()
            .generate_turn(turn_request("Socrates", 1), sink)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }

    #[tokio::test]
    async fn test_replay_with_debug_logging_renders_prompts() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);
        let agent = agent();

        let mut request = turn_request("Socrates", 2);
        request.persona = Some("a relentless questioner".into());
        request.transcript = vec![TranscriptEntry {
            speaker: "Meno".into(),
            round: 1,
            content: "Virtue is ruling over others.".into(),
        }];
        let (sink, _rx) = FragmentSink::channel();
        assert!(agent.generate_turn(request, sink).await.is_ok());

        assert!(agent.judge_consensus(judge_request(1)).await.is_ok());

        let conspectus = ConspectusRequest {
            topic: "Is virtue teachable?".into(),
            transcript: vec![],
            participants: vec!["Socrates".into(), "Meno".into()],
            rounds: 2,
            final_score: 0.61,
            moderator: identity("Socrates"),
            temperature: 0.3,
            max_tokens: 2048,
            credential: CredentialHandle::default(),
            cancel: CancellationToken::new(),
        };
        let (sink, _rx) = FragmentSink::channel();
        let text = agent.generate_conspectus(conspectus, sink).await.unwrap();
        assert!(text.starts_with("## Overview"));
    }

    #[tokio::test]
    async fn test_cancelled_request_stops_turn() {
        let request = turn_request("Socrates", 1);
        request.cancel.cancel();
        let (sink, _rx) = FragmentSink::channel();
        let mut script = Script::from_toml_str(SCRIPT).unwrap();
        script.fragment_delay_ms = 1_000;
        let err = ScriptedAgent::new(script)
            .generate_turn(request, sink)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
    }
}
