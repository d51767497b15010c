//! Collaboration splitting for multi-artist credits.
//!
//! A candidate grouping is an ordered list of names. The resolver attempts
//! each name of a grouping individually and keeps the first that resolves;
//! a joint credit ("Dan + Shay") is therefore a grouping with one name.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::normalize::normalize_artist;
use crate::overrides::OverrideTable;

/// Default cap on whitespace tokens considered by the word-grouping fallback.
pub const DEFAULT_MAX_GROUPING_TOKENS: usize = 5;

// ============================================================================
// REGEX PATTERNS
// ============================================================================

/// "A feat. B", "A featuring B", "A ft. B", "A (feat. B)".
/// Groups: primary, keyword, featured.
pub static FEATURING_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(.+?)\s+[\(\[]?(feat\.?|featuring|ft\.?)\s+(.+?)[\)\]]?$").unwrap()
});

/// Joins between equal partners: "A & B", "A x B", "A + B", "A, B".
pub static JOIN_SEPARATOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s+(?:&|x|×|\+)\s+|\s*,\s*").unwrap());

/// Tokens ignored by the word-grouping fallback.
pub static FILLER_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:[^\p{L}\p{N}]+|feat\.?|ft\.?|featuring|x|×)$").unwrap());

// ============================================================================
// SPLITTING
// ============================================================================

/// True when `s` opens with a join separator ("& B", "x B", ", B").
fn starts_with_join(s: &str) -> bool {
    JOIN_SEPARATOR
        .find(&format!(" {}", s))
        .map_or(false, |m| m.start() == 0)
}

fn non_empty(parts: impl IntoIterator<Item = String>) -> Vec<String> {
    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Ordered candidate groupings for a raw artist credit, most likely first.
///
/// Only the first matching pattern is applied. Names on the override list
/// are never split.
pub fn split_collaboration(raw_artist: &str, overrides: &OverrideTable) -> Vec<Vec<String>> {
    let normalized = normalize_artist(raw_artist);
    if normalized.is_empty() {
        return Vec::new();
    }
    let display = normalized.display;

    if overrides.is_protected(&normalized.comparison_key) {
        return vec![vec![display]];
    }

    if let Some(caps) = FEATURING_SPLIT.captures(&display) {
        let primary = caps[1].trim().to_string();
        let featured = caps[3].trim().to_string();
        // "Little Feat & Lowell George": the keyword is part of a band name
        let band_key = normalize_artist(&format!("{} {}", primary, &caps[2])).comparison_key;
        let keyword_in_name = starts_with_join(&featured) || overrides.is_protected(&band_key);
        if !primary.is_empty() && !featured.is_empty() && !keyword_in_name {
            return vec![vec![primary.clone()], vec![primary, featured]];
        }
    }

    let parts = non_empty(JOIN_SEPARATOR.split(&display).map(str::to_string));
    if parts.len() >= 2 {
        let mut candidates = Vec::with_capacity(parts.len() + 1);
        candidates.push(vec![display.clone()]);
        candidates.extend(parts.into_iter().map(|p| vec![p]));
        return candidates;
    }

    vec![vec![display]]
}

/// Contiguous word groupings for credits with no explicit separator.
///
/// Two-way splits come first, most balanced first, ties broken toward the
/// longer first part (3 tokens: 2+1, 1+2, then 1+1+1). Strings with more than
/// `max_tokens` usable tokens produce no groupings and stay PENDING.
pub fn word_groupings(raw_artist: &str, max_tokens: usize) -> Vec<Vec<String>> {
    let credit = normalize_artist(raw_artist).display;
    let tokens: Vec<&str> = credit
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty() && !FILLER_TOKEN.is_match(t))
        .collect();
    let n = tokens.len();
    if n < 2 {
        return Vec::new();
    }
    if n > max_tokens {
        debug!(tokens = n, max_tokens, artist = %credit, "too many tokens for word grouping");
        return Vec::new();
    }

    let mut cuts: Vec<usize> = (1..n).collect();
    cuts.sort_by_key(|&cut| {
        let left = cut as isize;
        let right = (n - cut) as isize;
        ((left - right).abs(), -left)
    });

    let mut groupings: Vec<Vec<String>> = cuts
        .into_iter()
        .map(|cut| vec![tokens[..cut].join(" "), tokens[cut..].join(" ")])
        .collect();

    if n == 3 {
        groupings.push(tokens.iter().map(|t| t.to_string()).collect());
    }
    groupings
}

// ============================================================================
// TESTS
// ============================================================================
