//! Consensus engine — three-signal agreement scoring per round.
//!
//! ```text
//! marker score (phrases)      ─┐
//! moderator judgment (LLM)    ─┼─▶ weighted composite ─▶ ConsensusCheck
//! lexical overlap (Jaccard)   ─┘
//! ```

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{catch_panic, AgentCapability, AgentError, JudgeRequest, TranscriptEntry};
use crate::config::{ConfigError, JudgeSettings};
use crate::debate::state::Participant;

const AGREEMENT_MARKERS: &[&str] = &[
    "i agree",
    "i concur",
    "that's correct",
    "building on",
    "exactly right",
    "well said",
    "i share",
    "common ground",
    "we seem to converge",
    "as .* correctly pointed out",
    "aligns with my view",
    "i must acknowledge",
];

const DISAGREEMENT_MARKERS: &[&str] = &[
    "i disagree",
    "i must counter",
    "however",
    "on the contrary",
    "that misses",
    "i take issue",
    "fundamentally flawed",
    "i challenge",
    "that overlooks",
    "insufficient",
];

static AGREEMENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| compile(AGREEMENT_MARKERS));
static DISAGREEMENT_PATTERNS: LazyLock<Vec<Regex>> =
    LazyLock::new(|| compile(DISAGREEMENT_MARKERS));

fn compile(markers: &[&str]) -> Vec<Regex> {
    markers
        .iter()
        .map(|m| Regex::new(m).expect("marker pattern should compile"))
        .collect()
}

fn count_matches(patterns: &[Regex], text: &str) -> usize {
    patterns.iter().map(|p| p.find_iter(text).count()).sum()
}

/// Agreement-phrase ratio across a round's responses.
///
/// Returns `A / (A + D)`, or 0.5 when neither kind of marker occurs.
pub fn marker_score(responses: &[String]) -> f64 {
    let (mut agree, mut disagree) = (0usize, 0usize);
    for response in responses {
        let text = response.to_lowercase();
        agree += count_matches(&AGREEMENT_PATTERNS, &text);
        disagree += count_matches(&DISAGREEMENT_PATTERNS, &text);
    }

    let total = agree + disagree;
    if total == 0 {
        return 0.5;
    }
    agree as f64 / total as f64
}

fn word_set(responses: &[String]) -> HashSet<String> {
    responses
        .iter()
        .flat_map(|r| r.split_whitespace())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard overlap of the lowercase word sets of two rounds.
///
/// `None` when either side has no words.
pub fn word_overlap(current: &[String], previous: &[String]) -> Option<f64> {
    let current = word_set(current);
    let previous = word_set(previous);
    if current.is_empty() || previous.is_empty() {
        return None;
    }
    let shared = current.intersection(&previous).count();
    let union = current.union(&previous).count();
    Some(shared as f64 / union as f64)
}

/// Lexical stagnation test: overlap strictly above `threshold`.
///
/// Always `false` without a previous round.
pub fn detect_stagnation(current: &[String], previous: Option<&[String]>, threshold: f64) -> bool {
    previous
        .and_then(|prev| word_overlap(current, prev))
        .is_some_and(|overlap| overlap > threshold)
}

/// Which signal decides the reported stagnation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagnationSource {
    /// Word-overlap test between consecutive rounds.
    #[default]
    Lexical,
    /// The moderator's own `stagnation` field.
    Moderator,
    /// Either of the two.
    Either,
}

impl std::fmt::Display for StagnationSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexical => write!(f, "lexical"),
            Self::Moderator => write!(f, "moderator"),
            Self::Either => write!(f, "either"),
        }
    }
}

impl FromStr for StagnationSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lexical" => Ok(Self::Lexical),
            "moderator" => Ok(Self::Moderator),
            "either" => Ok(Self::Either),
            other => Err(format!(
                "unknown stagnation source '{other}' (expected lexical, moderator or either)"
            )),
        }
    }
}

/// Calibrated scoring constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    pub marker_weight: f64,
    pub moderator_weight: f64,
    pub stagnation_weight: f64,
    /// Fraction of the stagnation term lost on a stagnant round.
    pub stagnation_penalty: f64,
    /// Word overlap above which a round counts as lexically stagnant.
    pub overlap_threshold: f64,
    /// Consecutive stagnant rounds that end the debate.
    pub stagnation_limit: u32,
    pub stagnation_source: StagnationSource,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            marker_weight: 0.25,
            moderator_weight: 0.60,
            stagnation_weight: 0.15,
            stagnation_penalty: 0.3,
            overlap_threshold: 0.80,
            stagnation_limit: 3,
            stagnation_source: StagnationSource::Lexical,
        }
    }
}

impl ScoringPolicy {
    /// Weighted composite, clamped to `[0, 1]`.
    pub fn composite(&self, marker: f64, moderator: f64, stagnant: bool) -> f64 {
        let penalty = if stagnant { self.stagnation_penalty } else { 0.0 };
        let score = self.marker_weight * marker
            + self.moderator_weight * moderator
            + self.stagnation_weight * (1.0 - penalty);
        score.clamp(0.0, 1.0)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            ("marker_weight", self.marker_weight),
            ("moderator_weight", self.moderator_weight),
            ("stagnation_weight", self.stagnation_weight),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidPolicy(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        let sum: f64 = weights.iter().map(|(_, w)| w).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(ConfigError::InvalidPolicy(format!(
                "weights must sum to 1.0, got {sum}"
            )));
        }
        for (name, value) in [
            ("stagnation_penalty", self.stagnation_penalty),
            ("overlap_threshold", self.overlap_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidPolicy(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.stagnation_limit == 0 {
            return Err(ConfigError::InvalidPolicy(
                "stagnation_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_moderator_score() -> f64 {
    0.5
}

/// Structured judgment returned by the moderator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeratorJudgment {
    #[serde(default = "default_moderator_score")]
    pub consensus_score: f64,
    #[serde(default)]
    pub stagnation: bool,
    #[serde(default)]
    pub agreed_points: Vec<String>,
    #[serde(default)]
    pub contested_points: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

impl ModeratorJudgment {
    /// The judgment assumed when the moderator could not be heard.
    pub fn neutral() -> Self {
        Self {
            consensus_score: default_moderator_score(),
            stagnation: false,
            agreed_points: Vec::new(),
            contested_points: Vec::new(),
            summary: String::new(),
        }
    }

    /// Clamp the score into `[0, 1]` and drop blank points.
    pub fn sanitized(mut self) -> Self {
        self.consensus_score = if self.consensus_score.is_finite() {
            self.consensus_score.clamp(0.0, 1.0)
        } else {
            default_moderator_score()
        };
        let tidy = |points: Vec<String>| -> Vec<String> {
            points
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        };
        self.agreed_points = tidy(self.agreed_points);
        self.contested_points = tidy(self.contested_points);
        self.summary = self.summary.trim().to_string();
        self
    }
}

/// Parse a judgment out of free model text.
///
/// Takes everything from the first `{` to the last `}` and deserialises it.
pub fn extract_judgment(text: &str) -> Result<ModeratorJudgment, AgentError> {
    let start = text
        .find('{')
        .ok_or_else(|| AgentError::Malformed("no JSON object in judgment".into()))?;
    let end = text
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| AgentError::Malformed("unterminated JSON object in judgment".into()))?;

    serde_json::from_str::<ModeratorJudgment>(&text[start..=end])
        .map(ModeratorJudgment::sanitized)
        .map_err(|e| AgentError::Malformed(e.to_string()))
}

/// One round's consensus result. Never mutated after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusCheck {
    pub round: u32,
    /// Composite score in `[0, 1]`.
    pub score: f64,
    pub stagnation_detected: bool,
    pub agreed_points: Vec<String>,
    pub contested_points: Vec<String>,
    pub summary: String,
    pub marker_score: f64,
    pub moderator_score: f64,
    /// Word overlap with the previous round, when computable.
    pub lexical_overlap: Option<f64>,
    /// `false` when the moderator call failed and defaults were used.
    pub moderator_responded: bool,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
impl ConsensusCheck {
    pub(crate) fn for_test(round: u32, score: f64) -> Self {
        Self {
            round,
            score,
            stagnation_detected: false,
            agreed_points: vec![],
            contested_points: vec![],
            summary: String::new(),
            marker_score: 0.5,
            moderator_score: 0.5,
            lexical_overlap: None,
            moderator_responded: true,
            checked_at: Utc::now(),
        }
    }
}

/// Score a completed round from its responses and the moderator's judgment.
///
/// `judgment` is `None` when the moderator call failed. The stagnation term
/// of the composite always follows the lexical test; the reported flag
/// follows `policy.stagnation_source`. Round 1 is never stagnant.
pub fn score_round(
    policy: &ScoringPolicy,
    round: u32,
    responses: &[String],
    previous: Option<&[String]>,
    judgment: Option<&ModeratorJudgment>,
) -> ConsensusCheck {
    let previous = previous.filter(|_| round > 1);
    let markers = marker_score(responses);
    let overlap = previous.and_then(|prev| word_overlap(responses, prev));
    let lexical = overlap.is_some_and(|o| o > policy.overlap_threshold);

    let moderator_responded = judgment.is_some();
    let judgment = judgment.cloned().unwrap_or_else(ModeratorJudgment::neutral);
    let moderator_stagnant = round > 1 && judgment.stagnation;

    let stagnation_detected = match policy.stagnation_source {
        StagnationSource::Lexical => lexical,
        StagnationSource::Moderator => moderator_stagnant,
        StagnationSource::Either => lexical || moderator_stagnant,
    };

    ConsensusCheck {
        round,
        score: policy.composite(markers, judgment.consensus_score, lexical),
        stagnation_detected,
        agreed_points: judgment.agreed_points,
        contested_points: judgment.contested_points,
        summary: judgment.summary,
        marker_score: markers,
        moderator_score: judgment.consensus_score,
        lexical_overlap: overlap,
        moderator_responded,
        checked_at: Utc::now(),
    }
}

/// What the engine knows about a finished round.
#[derive(Debug, Clone)]
pub struct RoundEvidence {
    pub topic: String,
    pub round: u32,
    /// Completed turns of this round, in speaking order.
    pub transcript: Vec<TranscriptEntry>,
    /// Raw responses of the previous round.
    pub previous: Option<Vec<String>>,
}

/// Produces one [`ConsensusCheck`] per round, consulting the moderator.
pub struct ConsensusEngine {
    agent: Arc<dyn AgentCapability>,
    policy: ScoringPolicy,
    judge: JudgeSettings,
}

impl ConsensusEngine {
    pub fn new(agent: Arc<dyn AgentCapability>, policy: ScoringPolicy, judge: JudgeSettings) -> Self {
        Self {
            agent,
            policy,
            judge,
        }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    /// Evaluate a round. Moderator failures are absorbed into defaults.
    pub async fn evaluate(
        &self,
        evidence: RoundEvidence,
        moderator: &Participant,
        cancel: CancellationToken,
    ) -> ConsensusCheck {
        let responses: Vec<String> = evidence
            .transcript
            .iter()
            .map(|e| e.content.clone())
            .collect();

        let request = JudgeRequest {
            topic: evidence.topic,
            round: evidence.round,
            round_transcript: evidence.transcript,
            previous_round: evidence.previous.clone(),
            moderator: moderator.identity(),
            temperature: self.judge.temperature,
            max_tokens: self.judge.max_tokens,
            credential: moderator.credential.clone(),
            cancel,
        };

        let judgment = match tokio::time::timeout(
            self.judge.timeout,
            catch_panic(self.agent.judge_consensus(request)),
        )
        .await
        {
            Ok(Ok(judgment)) => Some(judgment.sanitized()),
            Ok(Err(e)) => {
                warn!(round = evidence.round, error = %e, "Moderator judgment failed, using defaults");
                None
            }
            Err(_) => {
                warn!(
                    round = evidence.round,
                    timeout = ?self.judge.timeout,
                    "Moderator judgment timed out, using defaults"
                );
                None
            }
        };

        let check = score_round(
            &self.policy,
            evidence.round,
            &responses,
            evidence.previous.as_deref(),
            judgment.as_ref(),
        );
        debug!(
            round = check.round,
            score = check.score,
            marker = check.marker_score,
            moderator = check.moderator_score,
            overlap = ?check.lexical_overlap,
            stagnation = check.stagnation_detected,
            "Consensus scored"
        );
        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_marker_score_neutral_without_markers() {
        assert_eq!(marker_score(&texts(&["The sky is blue.", "Water is wet."])), 0.5);
        assert_eq!(marker_score(&[]), 0.5);
    }

    #[test]
    fn test_marker_score_three_to_one() {
        let responses = texts(&[
            "I agree with the premise. Well said, Meno.",
            "I concur, however the evidence is thin.",
        ]);
        assert_eq!(marker_score(&responses), 0.75);
    }

    #[test]
    fn test_marker_score_is_case_insensitive_and_matches_pattern() {
        let responses = texts(&["As Socrates correctly pointed out, virtue is knowledge."]);
        assert_eq!(marker_score(&responses), 1.0);
        assert_eq!(marker_score(&texts(&["I DISAGREE entirely."])), 0.0);
    }

    #[test]
    fn test_word_overlap_example() {
        let current = texts(&["a b", "c d"]);
        let previous = texts(&["A b c e"]);
        let overlap = word_overlap(&current, &previous).unwrap();
        assert!((overlap - 0.6).abs() < 1e-12);
        assert!(!detect_stagnation(&current, Some(&previous), 0.8));
    }

    #[test]
    fn test_word_overlap_empty_sides() {
        assert_eq!(word_overlap(&texts(&["   "]), &texts(&["a"])), None);
        assert!(!detect_stagnation(&texts(&["a"]), None, 0.8));
    }

    #[test]
    fn test_identical_rounds_are_stagnant() {
        let round = texts(&["we keep saying the same thing"]);
        assert!(detect_stagnation(&round, Some(&round), 0.8));
    }

    #[test]
    fn test_composite_full_agreement_is_one() {
        let policy = ScoringPolicy::default();
        assert_eq!(policy.composite(1.0, 1.0, false), 1.0);
    }

    #[test]
    fn test_stagnation_costs_exactly_the_penalty_share() {
        let policy = ScoringPolicy::default();
        let fresh = policy.composite(0.5, 0.5, false);
        let stale = policy.composite(0.5, 0.5, true);
        assert!((fresh - stale - 0.045).abs() < 1e-12);
        assert!((policy.composite(0.0, 0.0, true) - 0.105).abs() < 1e-12);
    }

    #[test]
    fn test_policy_validation() {
        assert!(ScoringPolicy::default().validate().is_ok());

        let skewed = ScoringPolicy {
            marker_weight: 0.5,
            ..Default::default()
        };
        assert!(matches!(skewed.validate(), Err(ConfigError::InvalidPolicy(_))));

        let negative = ScoringPolicy {
            marker_weight: -0.25,
            moderator_weight: 1.1,
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        let zero_limit = ScoringPolicy {
            stagnation_limit: 0,
            ..Default::default()
        };
        assert!(zero_limit.validate().is_err());
    }

    #[test]
    fn test_round_one_never_stagnant() {
        let round = texts(&["same words"]);
        let judgment = ModeratorJudgment {
            stagnation: true,
            ..ModeratorJudgment::neutral()
        };
        let policy = ScoringPolicy {
            stagnation_source: StagnationSource::Either,
            ..Default::default()
        };
        let check = score_round(&policy, 1, &round, Some(&round), Some(&judgment));
        assert!(!check.stagnation_detected);
        assert_eq!(check.lexical_overlap, None);
    }

    #[test]
    fn test_stagnation_source_selects_reported_flag() {
        let current = texts(&["fresh ideas entirely"]);
        let previous = texts(&["old stale arguments"]);
        let judgment = ModeratorJudgment {
            stagnation: true,
            ..ModeratorJudgment::neutral()
        };

        let lexical = ScoringPolicy::default();
        let check = score_round(&lexical, 2, &current, Some(&previous), Some(&judgment));
        assert!(!check.stagnation_detected);

        let moderator = ScoringPolicy {
            stagnation_source: StagnationSource::Moderator,
            ..Default::default()
        };
        let check = score_round(&moderator, 2, &current, Some(&previous), Some(&judgment));
        assert!(check.stagnation_detected);
        // The composite's stagnation term still follows the word overlap.
        assert!((check.score - (0.25 * 0.5 + 0.6 * 0.5 + 0.15)).abs() < 1e-12);
    }

    #[test]
    fn test_failed_judgment_defaults() {
        let check = score_round(&ScoringPolicy::default(), 1, &texts(&["plain"]), None, None);
        assert!(!check.moderator_responded);
        assert_eq!(check.moderator_score, 0.5);
        assert!(check.agreed_points.is_empty());
        assert!(check.summary.is_empty());
        assert!((check.score - 0.575).abs() < 1e-12);
    }

    #[test]
    fn test_extract_judgment_from_chatty_text() {
        let text = r#"Here is my assessment:
{"consensus_score": 0.72, "agreed_points": ["virtue matters", " "], "contested_points": [],
 "stagnation": false, "summary": " Close to agreement. "}
Hope this helps."#;
        let judgment = extract_judgment(text).unwrap();
        assert_eq!(judgment.consensus_score, 0.72);
        assert_eq!(judgment.agreed_points, vec!["virtue matters"]);
        assert_eq!(judgment.summary, "Close to agreement.");
    }

    #[test]
    fn test_extract_judgment_clamps_and_defaults() {
        let judgment = extract_judgment(r#"{"consensus_score": 1.7}"#).unwrap();
        assert_eq!(judgment.consensus_score, 1.0);

        let judgment = extract_judgment(r#"{"summary": "no score"}"#).unwrap();
        assert_eq!(judgment.consensus_score, 0.5);
        assert!(!judgment.stagnation);
    }

    #[test]
    fn test_extract_judgment_rejects_garbage() {
        assert!(matches!(
            extract_judgment("no json here"),
            Err(AgentError::Malformed(_))
        ));
        assert!(matches!(
            extract_judgment("} backwards {"),
            Err(AgentError::Malformed(_))
        ));
        assert!(extract_judgment("{not json}").is_err());
    }

    #[test]
    fn test_stagnation_source_parse_and_display() {
        assert_eq!("Either".parse::<StagnationSource>(), Ok(StagnationSource::Either));
        assert_eq!(StagnationSource::Moderator.to_string(), "moderator");
        assert!("sometimes".parse::<StagnationSource>().is_err());
    }
}
