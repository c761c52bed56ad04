//! Termination guardrails, applied once per scored round.

use serde::{Deserialize, Serialize};

use super::consensus::ConsensusCheck;

/// Why a debate concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Operator stop.
    Stopped,
    ConsensusReached,
    StagnationExhausted,
    RoundsExhausted,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::ConsensusReached => write!(f, "consensus_reached"),
            Self::StagnationExhausted => write!(f, "stagnation_exhausted"),
            Self::RoundsExhausted => write!(f, "rounds_exhausted"),
        }
    }
}

/// Outcome of evaluating the guardrails after a round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TerminationOutcome {
    /// Run the next round.
    Continue,
    ConsensusReached { score: f64, threshold: f64 },
    StagnationExhausted { consecutive_rounds: u32 },
    RoundsExhausted { rounds: u32 },
}

impl TerminationOutcome {
    /// Whether the debate should stop.
    pub fn should_stop(&self) -> bool {
        !matches!(self, Self::Continue)
    }

    pub fn reason(&self) -> Option<TerminationReason> {
        match self {
            Self::Continue => None,
            Self::ConsensusReached { .. } => Some(TerminationReason::ConsensusReached),
            Self::StagnationExhausted { .. } => Some(TerminationReason::StagnationExhausted),
            Self::RoundsExhausted { .. } => Some(TerminationReason::RoundsExhausted),
        }
    }
}

impl std::fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::ConsensusReached { score, threshold } => {
                write!(f, "consensus_reached ({:.3} >= {:.3})", score, threshold)
            }
            Self::StagnationExhausted { consecutive_rounds } => {
                write!(f, "stagnation_exhausted ({} rounds)", consecutive_rounds)
            }
            Self::RoundsExhausted { rounds } => write!(f, "rounds_exhausted ({})", rounds),
        }
    }
}

/// Stateful termination rules for one debate.
///
/// Evaluation order per round: threshold, then the consecutive-stagnation
/// limit, then the round limit. The stagnation streak resets on any
/// non-stagnant round.
#[derive(Debug, Clone)]
pub struct TerminationPolicy {
    threshold: f64,
    max_rounds: u32,
    stagnation_limit: u32,
    stagnant_streak: u32,
}

impl TerminationPolicy {
    pub fn new(threshold: f64, max_rounds: u32, stagnation_limit: u32) -> Self {
        Self {
            threshold,
            max_rounds,
            stagnation_limit,
            stagnant_streak: 0,
        }
    }

    /// Current run of consecutive stagnant rounds.
    pub fn stagnant_streak(&self) -> u32 {
        self.stagnant_streak
    }

    /// Apply the rules to a freshly recorded check.
    pub fn evaluate(&mut self, check: &ConsensusCheck) -> TerminationOutcome {
        if check.stagnation_detected {
            self.stagnant_streak += 1;
        } else {
            self.stagnant_streak = 0;
        }

        if check.score >= self.threshold {
            return TerminationOutcome::ConsensusReached {
                score: check.score,
                threshold: self.threshold,
            };
        }

        if self.stagnant_streak >= self.stagnation_limit {
            return TerminationOutcome::StagnationExhausted {
                consecutive_rounds: self.stagnant_streak,
            };
        }

        if check.round >= self.max_rounds {
            return TerminationOutcome::RoundsExhausted {
                rounds: check.round,
            };
        }

        TerminationOutcome::Continue
    }
}
