//! Similarity scoring shared by the identity resolver and the library matcher.
//!
//! All scores are in 0.0..=1.0 and are computed on comparison keys, never on
//! display strings.

use serde::Serialize;
use strsim::normalized_levenshtein;

// ============================================================================
// Score Thresholds (defaults, overridable through EngineConfig)
// ============================================================================

/// Minimum name similarity to accept an identity registry candidate.
pub const IDENTITY_ACCEPT_THRESHOLD: f64 = 0.80;

/// Registry candidates between this and the accept threshold are logged as near misses.
pub const IDENTITY_WARN_THRESHOLD: f64 = 0.70;

/// Minimum combined score for the fuzzy library strategy.
pub const FUZZY_ACCEPT_THRESHOLD: f64 = 0.90;

/// Minimum artist similarity for the partial (containment) library strategy.
pub const PARTIAL_ARTIST_THRESHOLD: f64 = 0.90;

/// Title share of the combined score; the artist gets the rest.
pub const TITLE_WEIGHT: f64 = 0.60;

// ============================================================================
// Similarity
// ============================================================================

/// Edit-distance similarity between two comparison keys (0.0 to 1.0).
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(a, b)
}

/// Weighted title/artist score used by every library strategy past Exact.
pub fn combined_score(title_similarity: f64, artist_similarity: f64, title_weight: f64) -> f64 {
    let w = title_weight.clamp(0.0, 1.0);
    w * title_similarity + (1.0 - w) * artist_similarity
}

/// Title containment in either direction. Empty keys never contain anything.
pub fn contains_either(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

// ============================================================================
// Confidence
// ============================================================================

/// Coarse confidence bucket attached to a library match for operator review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchConfidence {
    /// Exact or normalized-exact, or fuzzy at 0.97 and above
    High,
    /// Fuzzy or partial at 0.93 and above
    Medium,
    /// Everything else that still cleared its strategy threshold
    Low,
}

impl MatchConfidence {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.97 {
            MatchConfidence::High
        } else if score >= 0.93 {
            MatchConfidence::Medium
        } else {
            MatchConfidence::Low
        }
    }
}
