//! Threshold matching of a probe embedding against enrolled candidates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{Embedding, ParseEnumError, UserId};

/// Euclidean distance a candidate must stay strictly below to match.
///
/// For L2-normalised ArcFace embeddings `d² = 2 - 2·cos`, so 0.6 means
/// cosine similarity above 0.82. That is strict for ArcFace; 1.0 to 1.1
/// (cosine 0.5 to 0.4) is the usual operating range.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;

/// How a match is chosen among candidates under the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    /// Closest candidate under the threshold; earlier candidate wins a tie.
    #[default]
    #[serde(rename = "best")]
    BestMatch,
    /// First candidate in enrollment order under the threshold.
    #[serde(rename = "first")]
    FirstMatch,
}

impl MatchPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPolicy::BestMatch => "best",
            MatchPolicy::FirstMatch => "first",
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchPolicy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(MatchPolicy::BestMatch),
            "first" => Ok(MatchPolicy::FirstMatch),
            other => Err(ParseEnumError::new("match policy", other)),
        }
    }
}

/// A decrypted enrolled embedding.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub user_id: UserId,
    pub embedding: Embedding,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched { user_id: UserId, distance: f64 },
    /// `closest` is the smallest distance seen, if any candidate was compared.
    NoMatch { closest: Option<f64> },
}

/// Matching seam. Candidates arrive in enrollment order and share the
/// probe's dimension.
pub trait Matcher: Send + Sync {
    fn find_match(&self, probe: &Embedding, candidates: &[Candidate]) -> MatchOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f64,
    policy: MatchPolicy,
}

impl Default for EuclideanMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD, MatchPolicy::default())
    }
}

impl EuclideanMatcher {
    pub fn new(threshold: f64, policy: MatchPolicy) -> Self {
        Self { threshold, policy }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }
}

impl Matcher for EuclideanMatcher {
    fn find_match(&self, probe: &Embedding, candidates: &[Candidate]) -> MatchOutcome {
        let mut closest: Option<f64> = None;
        let mut best: Option<(UserId, f64)> = None;

        for candidate in candidates {
            let distance = probe.euclidean_distance(&candidate.embedding);
            tracing::trace!(user_id = %candidate.user_id, distance, "candidate distance");

            if closest.map_or(true, |c| distance < c) {
                closest = Some(distance);
            }
            if distance >= self.threshold {
                continue;
            }
            match self.policy {
                MatchPolicy::FirstMatch => {
                    return MatchOutcome::Matched {
                        user_id: candidate.user_id,
                        distance,
                    }
                }
                MatchPolicy::BestMatch => {
                    if best.map_or(true, |(_, d)| distance < d) {
                        best = Some((candidate.user_id, distance));
                    }
                }
            }
        }

        match best {
            Some((user_id, distance)) => MatchOutcome::Matched { user_id, distance },
            None => MatchOutcome::NoMatch { closest },
        }
    }
}
