//! Provider routing — one capability per provider binding.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    AgentCapability, AgentError, ConspectusRequest, FragmentSink, JudgeRequest, TurnOutput,
    TurnRequest,
};
use crate::debate::consensus::ModeratorJudgment;

/// Dispatches each call to the capability registered for the caller's
/// provider binding.
///
/// Provider names are matched case-insensitively. A call for an unregistered
/// provider fails with [`AgentError::UnknownProvider`], which the engine
/// treats like any other per-call failure.
#[derive(Clone, Default)]
pub struct ProviderRouter {
    routes: HashMap<String, Arc<dyn AgentCapability>>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with_provider(
        mut self,
        provider: impl AsRef<str>,
        capability: Arc<dyn AgentCapability>,
    ) -> Self {
        self.register(provider, capability);
        self
    }

    /// Register (or replace) the capability for a provider.
    pub fn register(&mut self, provider: impl AsRef<str>, capability: Arc<dyn AgentCapability>) {
        self.routes
            .insert(provider.as_ref().to_ascii_lowercase(), capability);
    }

    /// Registered provider names, sorted.
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn route(&self, provider: &str) -> Result<&Arc<dyn AgentCapability>, AgentError> {
        self.routes
            .get(&provider.to_ascii_lowercase())
            .ok_or_else(|| AgentError::UnknownProvider(provider.to_string()))
    }
}

#[async_trait]
impl AgentCapability for ProviderRouter {
    async fn generate_turn(
        &self,
        request: TurnRequest,
        fragments: FragmentSink,
    ) -> Result<TurnOutput, AgentError> {
        let capability = self.route(&request.speaker.provider)?;
        capability.generate_turn(request, fragments).await
    }

    async fn judge_consensus(&self, request: JudgeRequest) -> Result<ModeratorJudgment, AgentError> {
        let capability = self.route(&request.moderator.provider)?;
        capability.judge_consensus(request).await
    }

    async fn generate_conspectus(
        &self,
        request: ConspectusRequest,
        fragments: FragmentSink,
    ) -> Result<String, AgentError> {
        let capability = self.route(&request.moderator.provider)?;
        capability.generate_conspectus(request, fragments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentIdentity, CredentialHandle};
    use tokio_util::sync::CancellationToken;

    struct Fixed(&'static str);

    #[async_trait]
    impl AgentCapability for Fixed {
        async fn generate_turn(
            &self,
            _request: TurnRequest,
            fragments: FragmentSink,
        ) -> Result<TurnOutput, AgentError> {
            fragments.send(self.0);
            Ok(TurnOutput {
                content: self.0.to_string(),
                token_count: 1,
            })
        }

        async fn judge_consensus(
            &self,
            _request: JudgeRequest,
        ) -> Result<ModeratorJudgment, AgentError> {
            Ok(ModeratorJudgment {
                summary: self.0.to_string(),
                ..ModeratorJudgment::neutral()
            })
        }

        async fn generate_conspectus(
            &self,
            _request: ConspectusRequest,
            _fragments: FragmentSink,
        ) -> Result<String, AgentError> {
            Ok(self.0.to_string())
        }
    }

    fn turn_request(provider: &str) -> TurnRequest {
        TurnRequest {
            topic: "t".into(),
            speaker: AgentIdentity {
                provider: provider.into(),
                model: "m".into(),
                display_name: "Speaker".into(),
            },
            persona: None,
            temperature: 0.7,
            transcript: vec![],
            max_tokens: 256,
            round: 1,
            credential: CredentialHandle::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_provider_case_insensitive() {
        let router = ProviderRouter::new()
            .with_provider("anthropic", Arc::new(Fixed("from-anthropic")))
            .with_provider("OpenAI", Arc::new(Fixed("from-openai")));

        assert_eq!(router.providers(), vec!["anthropic", "openai"]);

        let (sink, _rx) = FragmentSink::channel();
        let out = router
            .generate_turn(turn_request("OPENAI"), sink)
            .await
            .unwrap();
        assert_eq!(out.content, "from-openai");
    }

    #[tokio::test]
    async fn test_unknown_provider_fails_the_call() {
        let router = ProviderRouter::new().with_provider("anthropic", Arc::new(Fixed("x")));
        let (sink, _rx) = FragmentSink::channel();
        let err = router
            .generate_turn(turn_request("kimi"), sink)
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::UnknownProvider("kimi".into()));
    }
}
