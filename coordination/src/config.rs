//! Debate and engine configuration.
//!
//! [`DebateConfig`] describes one debate (topic, participants, limits) and is
//! usually loaded from a TOML file. [`EngineConfig`] holds the policy
//! constants and timings shared by every debate an engine runs; its defaults
//! can be overridden with `AGORA_*` environment variables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::agent::CredentialHandle;
use crate::debate::consensus::{ScoringPolicy, StagnationSource};
use crate::debate::state::Participant;

pub const MAX_ROUNDS_LIMIT: u32 = 50;
pub const MIN_TOKENS_PER_TURN: u32 = 100;
pub const MAX_TOKENS_PER_TURN: u32 = 4096;
pub const MAX_TEMPERATURE: f32 = 2.0;

/// Configuration errors. Any of these keeps the engine idle.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("at least one participant is required")]
    NoParticipants,

    #[error("participant #{0} has an empty display name")]
    EmptyDisplayName(usize),

    #[error("display name '{0}' is used by more than one participant")]
    DuplicateParticipant(String),

    #[error("{field} = {value} is out of range (expected {expected})")]
    OutOfRange {
        field: String,
        value: String,
        expected: &'static str,
    },

    #[error("moderator index {index} is out of range for {participants} participant(s)")]
    ModeratorOutOfRange { index: usize, participants: usize },

    #[error("invalid scoring policy: {0}")]
    InvalidPolicy(String),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: String, reason: String },

    #[error("credential variable {var} for participant '{participant}' is not set")]
    MissingCredential { participant: String, var: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse debate file: {0}")]
    Parse(#[from] toml::de::Error),
}

fn out_of_range(field: impl Into<String>, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::OutOfRange {
        field: field.into(),
        value: value.to_string(),
        expected,
    }
}

fn default_max_rounds() -> u32 {
    10
}

fn default_max_tokens_per_turn() -> u32 {
    1024
}

fn default_consensus_threshold() -> f64 {
    0.8
}

/// One debate's setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateConfig {
    pub topic: String,
    /// Speaking order.
    pub participants: Vec<Participant>,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_max_tokens_per_turn")]
    pub max_tokens_per_turn: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    /// Index of the moderator; the first participant when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moderator: Option<usize>,
}

impl DebateConfig {
    pub fn new(topic: impl Into<String>, participants: Vec<Participant>) -> Self {
        Self {
            topic: topic.into(),
            participants,
            max_rounds: default_max_rounds(),
            max_tokens_per_turn: default_max_tokens_per_turn(),
            consensus_threshold: default_consensus_threshold(),
            moderator: None,
        }
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_max_tokens_per_turn(mut self, max_tokens: u32) -> Self {
        self.max_tokens_per_turn = max_tokens;
        self
    }

    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    pub fn with_moderator(mut self, index: usize) -> Self {
        self.moderator = Some(index);
        self
    }

    pub fn moderator_index(&self) -> usize {
        self.moderator.unwrap_or(0)
    }

    /// Parse a debate file body.
    pub fn from_toml_str(body: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(body)?)
    }

    /// Read and parse a debate file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let body = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&body)
    }

    /// Fill credential handles from each participant's `credential_env`.
    pub fn bind_credentials_from_env(&mut self) -> Result<(), ConfigError> {
        self.bind_credentials_with(|var| std::env::var(var).ok())
    }

    pub fn bind_credentials_with(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        for participant in &mut self.participants {
            let Some(var) = participant.credential_env.as_deref() else {
                continue;
            };
            let secret = lookup(var).ok_or_else(|| ConfigError::MissingCredential {
                participant: participant.display_name.clone(),
                var: var.to_string(),
            })?;
            participant.credential = CredentialHandle::new(secret);
        }
        Ok(())
    }

    /// Check every limit a debate needs before it may start.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topic.trim().is_empty() {
            return Err(ConfigError::EmptyTopic);
        }
        if self.participants.is_empty() {
            return Err(ConfigError::NoParticipants);
        }
        if self.participants.len() == 1 {
            warn!("Debate configured with a single participant");
        }

        let mut names = HashSet::new();
        for (i, p) in self.participants.iter().enumerate() {
            let name = p.display_name.trim();
            if name.is_empty() {
                return Err(ConfigError::EmptyDisplayName(i));
            }
            if !names.insert(name) {
                return Err(ConfigError::DuplicateParticipant(name.to_string()));
            }
            if !(0.0..=MAX_TEMPERATURE).contains(&p.temperature) {
                return Err(out_of_range(
                    format!("participants[{i}].temperature"),
                    p.temperature,
                    "0.0..=2.0",
                ));
            }
        }

        if !(1..=MAX_ROUNDS_LIMIT).contains(&self.max_rounds) {
            return Err(out_of_range("max_rounds", self.max_rounds, "1..=50"));
        }
        if !(MIN_TOKENS_PER_TURN..=MAX_TOKENS_PER_TURN).contains(&self.max_tokens_per_turn) {
            return Err(out_of_range(
                "max_tokens_per_turn",
                self.max_tokens_per_turn,
                "100..=4096",
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err(out_of_range(
                "consensus_threshold",
                self.consensus_threshold,
                "0.0..=1.0",
            ));
        }

        let index = self.moderator_index();
        if index >= self.participants.len() {
            return Err(ConfigError::ModeratorOutOfRange {
                index,
                participants: self.participants.len(),
            });
        }
        Ok(())
    }
}

/// Moderator consensus-judgment call settings.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    /// A judgment that takes longer counts as failed.
    pub timeout: Duration,
}

impl Default for JudgeSettings {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 512,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Moderator conspectus call settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ConspectusSettings {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ConspectusSettings {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Period of the token aggregator's flush.
    pub flush_interval: Duration,
    pub scoring: ScoringPolicy,
    pub judge: JudgeSettings,
    pub conspectus: ConspectusSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(50),
            scoring: ScoringPolicy::default(),
            judge: JudgeSettings::default(),
            conspectus: ConspectusSettings::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| ConfigError::InvalidEnv {
        var: var.to_string(),
        reason: format!("'{}': {}", value, e),
    })
}

impl EngineConfig {
    /// Defaults overlaid with `AGORA_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// | Variable                       | Field                       |
    /// |--------------------------------|-----------------------------|
    /// | `AGORA_FLUSH_INTERVAL_MS`      | `flush_interval`            |
    /// | `AGORA_JUDGE_TIMEOUT_SECS`     | `judge.timeout`             |
    /// | `AGORA_STAGNATION_SOURCE`      | `scoring.stagnation_source` |
    /// | `AGORA_STAGNATION_LIMIT`       | `scoring.stagnation_limit`  |
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("AGORA_FLUSH_INTERVAL_MS") {
            let ms: u64 = parse_env("AGORA_FLUSH_INTERVAL_MS", &v)?;
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(v) = lookup("AGORA_JUDGE_TIMEOUT_SECS") {
            let secs: u64 = parse_env("AGORA_JUDGE_TIMEOUT_SECS", &v)?;
            config.judge.timeout = Duration::from_secs(secs);
        }
        if let Some(v) = lookup("AGORA_STAGNATION_SOURCE") {
            config.scoring.stagnation_source =
                parse_env::<StagnationSource>("AGORA_STAGNATION_SOURCE", &v)?;
        }
        if let Some(v) = lookup("AGORA_STAGNATION_LIMIT") {
            config.scoring.stagnation_limit = parse_env("AGORA_STAGNATION_LIMIT", &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(out_of_range("flush_interval", "0ms", "> 0ms"));
        }
        if self.judge.timeout.is_zero() {
            return Err(out_of_range("judge.timeout", "0s", "> 0s"));
        }
        self.scoring.validate()
    }
}
