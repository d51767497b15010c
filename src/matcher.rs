//! Multi-strategy matching of catalog songs against a media library.
//!
//! Strategies run in a fixed order and the first one that clears its
//! threshold wins: Exact, Normalized, Fuzzy, Partial. Below threshold the
//! matcher reports NotFound with the best score each strategy reached; it
//! never guesses.

use serde::Serialize;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{ExternalError, Result};
use crate::models::{LibraryTrack, MatchResult, MatchStrategy, NotFoundReason, StrategyAttempt};
use crate::normalize::{normalize_artist, normalize_title, simple_key};
use crate::registry::{retry_transient, RetryPolicy};
use crate::scoring::{
    combined_score, contains_either, similarity, MatchConfidence, FUZZY_ACCEPT_THRESHOLD,
    PARTIAL_ARTIST_THRESHOLD, TITLE_WEIGHT,
};

// ============================================================================
// Library Contract
// ============================================================================

/// Media library search. Returns raw, unranked candidates.
pub trait LibrarySearch: Send + Sync {
    fn search_tracks(&self, title: &str, artist: &str) -> std::result::Result<Vec<LibraryTrack>, ExternalError>;
}

/// Library backed by a JSON export (array of `{library_id, title, artist}`).
pub struct JsonLibrary {
    tracks: Vec<LibraryTrack>,
}

/// Most candidates a `JsonLibrary` search returns.
const JSON_SEARCH_LIMIT: usize = 50;

impl JsonLibrary {
    pub fn new(tracks: Vec<LibraryTrack>) -> Self {
        Self { tracks }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let tracks: Vec<LibraryTrack> = serde_json::from_str(&text)?;
        Ok(Self { tracks })
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

impl LibrarySearch for JsonLibrary {
    /// Title search: any track whose title shares a word of 3+ characters
    /// with the query title. The artist is not used, like a media server's
    /// title search.
    fn search_tracks(&self, title: &str, _artist: &str) -> std::result::Result<Vec<LibraryTrack>, ExternalError> {
        let query_key = normalize_title(title).comparison_key;
        let words: Vec<&str> = query_key
            .split_whitespace()
            .filter(|w| w.chars().count() >= 3)
            .collect();
        Ok(self
            .tracks
            .iter()
            .filter(|t| {
                let key = normalize_title(&t.title).comparison_key;
                key == query_key || key.split_whitespace().any(|w| words.contains(&w))
            })
            .take(JSON_SEARCH_LIMIT)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Matcher
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MatcherSettings {
    pub fuzzy_threshold: f64,
    pub partial_artist_threshold: f64,
    pub title_weight: f64,
    #[serde(skip)]
    pub retry: RetryPolicy,
}

impl Default for MatcherSettings {
    fn default() -> Self {
        Self {
            fuzzy_threshold: FUZZY_ACCEPT_THRESHOLD,
            partial_artist_threshold: PARTIAL_ARTIST_THRESHOLD,
            title_weight: TITLE_WEIGHT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Candidate with every key and score precomputed once.
struct Scored {
    track: LibraryTrack,
    exact: bool,
    normalized: bool,
    contains: bool,
    artist_similarity: f64,
    combined: f64,
}

#[derive(Default)]
pub struct LibraryMatcher {
    settings: MatcherSettings,
}

impl LibraryMatcher {
    pub fn new(settings: MatcherSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MatcherSettings {
        &self.settings
    }

    /// Search with the title as given, then with its normalized form if it
    /// differs. Candidates are de-duplicated by library id, first seen kept.
    fn gather(
        &self,
        title: &str,
        artist: &str,
        library: &dyn LibrarySearch,
    ) -> std::result::Result<Vec<LibraryTrack>, ExternalError> {
        let norm_title = normalize_title(title).display;
        let norm_artist = normalize_artist(artist).display;
        let mut queries = vec![(title.to_string(), artist.to_string())];
        if norm_title != title || norm_artist != artist {
            queries.push((norm_title, norm_artist));
        }

        let mut found: Vec<LibraryTrack> = Vec::new();
        let mut last_error = None;
        let mut any_ok = false;
        for (t, a) in &queries {
            match retry_transient(self.settings.retry, "library search", || library.search_tracks(t, a)) {
                Ok(tracks) => {
                    any_ok = true;
                    for track in tracks {
                        if !found.iter().any(|f| f.library_id == track.library_id) {
                            found.push(track);
                        }
                    }
                }
                Err(e) => {
                    warn!(title = %t, artist = %a, error = %e, "library search failed");
                    last_error = Some(e);
                }
            }
        }
        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(found),
        }
    }

    fn score(&self, title: &str, artist: &str, candidates: Vec<LibraryTrack>) -> Vec<Scored> {
        let q_simple_title = simple_key(title);
        let q_simple_artist = simple_key(artist);
        let q_title = normalize_title(title).comparison_key;
        let q_artist = normalize_artist(artist).comparison_key;

        candidates
            .into_iter()
            .map(|track| {
                let l_title = normalize_title(&track.title).comparison_key;
                let l_artist = normalize_artist(&track.artist).comparison_key;
                let title_similarity = similarity(&q_title, &l_title);
                let artist_similarity = similarity(&q_artist, &l_artist);
                Scored {
                    exact: simple_key(&track.title) == q_simple_title
                        && simple_key(&track.artist) == q_simple_artist,
                    normalized: !l_title.is_empty() && l_title == q_title && l_artist == q_artist,
                    contains: contains_either(&l_title, &q_title),
                    artist_similarity,
                    combined: combined_score(title_similarity, artist_similarity, self.settings.title_weight),
                    track,
                }
            })
            .collect()
    }

    /// Match a catalog song against the library.
    pub fn match_song(&self, title: &str, artist: &str, library: &dyn LibrarySearch) -> MatchResult {
        let candidates = match self.gather(title, artist, library) {
            Ok(c) => c,
            Err(e) => {
                return MatchResult::NotFound {
                    attempts: Vec::new(),
                    reason: NotFoundReason::LibraryUnavailable(e.to_string()),
                }
            }
        };

        if candidates.is_empty() {
            debug!(title, artist, "no library candidates");
            return MatchResult::NotFound {
                attempts: MatchStrategy::ALL
                    .iter()
                    .map(|&strategy| StrategyAttempt {
                        strategy,
                        best_score: None,
                    })
                    .collect(),
                reason: NotFoundReason::NoCandidates,
            };
        }

        let candidate_count = candidates.len();
        let scored = self.score(title, artist, candidates);
        let mut attempts = Vec::with_capacity(MatchStrategy::ALL.len());

        for strategy in MatchStrategy::ALL {
            let (best, best_score, accepted) = self.evaluate(strategy, &scored);
            attempts.push(StrategyAttempt {
                strategy,
                best_score,
            });
            if accepted {
                if let Some(hit) = best {
                    let score = match strategy {
                        MatchStrategy::Exact | MatchStrategy::Normalized => 1.0,
                        _ => hit.combined,
                    };
                    debug!(
                        title,
                        artist,
                        strategy = strategy.as_str(),
                        score,
                        library_id = %hit.track.library_id,
                        "library match"
                    );
                    return MatchResult::Matched {
                        track: hit.track.clone(),
                        strategy,
                        score,
                        confidence: MatchConfidence::from_score(score),
                    };
                }
            }
        }

        debug!(title, artist, candidate_count, "no strategy cleared its threshold");
        MatchResult::NotFound {
            attempts,
            reason: NotFoundReason::BelowThreshold { candidate_count },
        }
    }

    /// Best candidate for one strategy, the score reported for diagnostics,
    /// and whether the strategy accepts it.
    fn evaluate<'a>(&self, strategy: MatchStrategy, scored: &'a [Scored]) -> (Option<&'a Scored>, Option<f64>, bool) {
        match strategy {
            MatchStrategy::Exact => {
                let hit = scored.iter().find(|s| s.exact);
                (hit, Some(if hit.is_some() { 1.0 } else { 0.0 }), hit.is_some())
            }
            MatchStrategy::Normalized => {
                let hit = scored.iter().find(|s| s.normalized);
                (hit, Some(if hit.is_some() { 1.0 } else { 0.0 }), hit.is_some())
            }
            MatchStrategy::Fuzzy => {
                let best = best_by_combined(scored.iter());
                let score = best.map(|b| b.combined);
                let accepted = score.is_some_and(|s| s >= self.settings.fuzzy_threshold);
                (best, score, accepted)
            }
            MatchStrategy::Partial => {
                let best_any = best_by_combined(scored.iter().filter(|s| s.contains));
                let best_ok = best_by_combined(
                    scored
                        .iter()
                        .filter(|s| s.contains && s.artist_similarity >= self.settings.partial_artist_threshold),
                );
                match best_ok {
                    Some(hit) => (Some(hit), Some(hit.combined), true),
                    None => (None, best_any.map(|b| b.combined), false),
                }
            }
        }
    }
}

/// Highest combined score; the earliest candidate wins ties.
fn best_by_combined<'a>(iter: impl Iterator<Item = &'a Scored>) -> Option<&'a Scored> {
    iter.fold(None, |best: Option<&Scored>, s| match best {
        Some(b) if b.combined >= s.combined => Some(b),
        _ => Some(s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Returns the same tracks for every query.
    struct FixedLibrary(Vec<LibraryTrack>);

    impl LibrarySearch for FixedLibrary {
        fn search_tracks(&self, _t: &str, _a: &str) -> std::result::Result<Vec<LibraryTrack>, ExternalError> {
            Ok(self.0.clone())
        }
    }

    struct DownLibrary(AtomicU32);

    impl LibrarySearch for DownLibrary {
        fn search_tracks(&self, _t: &str, _a: &str) -> std::result::Result<Vec<LibraryTrack>, ExternalError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(ExternalError::Transient("connection refused".into()))
        }
    }

    fn track(id: &str, title: &str, artist: &str) -> LibraryTrack {
        LibraryTrack {
            library_id: id.into(),
            title: title.into(),
            artist: artist.into(),
        }
    }

    fn matcher() -> LibraryMatcher {
        LibraryMatcher::new(MatcherSettings {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
            },
            ..MatcherSettings::default()
        })
    }

    fn strategy_of(result: &MatchResult) -> Option<(MatchStrategy, String)> {
        match result {
            MatchResult::Matched { track, strategy, .. } => Some((*strategy, track.library_id.clone())),
            MatchResult::NotFound { .. } => None,
        }
    }

    #[test]
    fn test_exact_match_first() {
        let lib = FixedLibrary(vec![
            track("1", "Bohemian  Rhapsody", "queen"),
            track("2", "Bohemian Rhapsody", "Queen"),
        ]);
        let result = matcher().match_song("Bohemian Rhapsody", "Queen", &lib);
        assert_eq!(strategy_of(&result), Some((MatchStrategy::Exact, "1".into())));
    }

    #[test]
    fn test_normalized_match_handles_apostrophes_and_noise() {
        let lib = FixedLibrary(vec![track("7", "Don\u{2019}t Stop Me Now (Remastered 2011)", "Queen")]);
        let result = matcher().match_song("DON'T STOP ME NOW", "QUEEN", &lib);
        assert_eq!(strategy_of(&result), Some((MatchStrategy::Normalized, "7".into())));
    }

    #[test]
    fn test_wrong_artist_exact_title_loses_to_fuzzy() {
        let lib = FixedLibrary(vec![
            track("cover", "Anti-Hero", "Some Cover Band"),
            track("real", "Anti Hero", "Taylor Swift"),
        ]);
        let result = matcher().match_song("Anti-Hero", "Taylor Swift", &lib);
        assert_eq!(strategy_of(&result), Some((MatchStrategy::Fuzzy, "real".into())));
    }

    #[test]
    fn test_wrong_artist_alone_is_rejected() {
        let lib = FixedLibrary(vec![track("cover", "Anti-Hero", "Some Cover Band")]);
        match matcher().match_song("Anti-Hero", "Taylor Swift", &lib) {
            MatchResult::NotFound { attempts, reason } => {
                assert_eq!(reason, NotFoundReason::BelowThreshold { candidate_count: 1 });
                assert_eq!(attempts.len(), 4);
                let fuzzy = attempts[2].best_score.unwrap();
                assert!(fuzzy < FUZZY_ACCEPT_THRESHOLD);
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_containment_with_matching_artist() {
        let lib = FixedLibrary(vec![track("9", "Hello (From the Adele Live Sessions)", "Adele")]);
        let result = matcher().match_song("Hello", "Adele", &lib);
        assert_eq!(strategy_of(&result), Some((MatchStrategy::Partial, "9".into())));
    }

    #[test]
    fn test_partial_requires_artist_similarity() {
        let lib = FixedLibrary(vec![track("9", "Hello (Piano Version)", "Lionel Richie")]);
        assert!(!matcher().match_song("Hello", "Adele", &lib).is_matched());
    }

    #[test]
    fn test_no_candidates_lists_all_strategies() {
        let lib = FixedLibrary(vec![]);
        match matcher().match_song("Totally Unknown Song XYZ123", "Unknown Artist", &lib) {
            MatchResult::NotFound { attempts, reason } => {
                assert_eq!(reason, NotFoundReason::NoCandidates);
                let tried: Vec<_> = attempts.iter().map(|a| a.strategy).collect();
                assert_eq!(tried, MatchStrategy::ALL.to_vec());
            }
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_library_down_degrades_to_not_found() {
        let lib = DownLibrary(AtomicU32::new(0));
        let result = matcher().match_song("Hello", "Adele", &lib);
        assert!(matches!(
            result,
            MatchResult::NotFound {
                reason: NotFoundReason::LibraryUnavailable(_),
                ..
            }
        ));
        assert_eq!(lib.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_json_library_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(
            &path,
            r#"[{"library_id":"1","title":"Anti-Hero","artist":"Taylor Swift"},
                {"library_id":"2","title":"Shake It Off","artist":"Taylor Swift"}]"#,
        )
        .unwrap();
        let lib = JsonLibrary::load(&path).unwrap();
        assert_eq!(lib.len(), 2);
        let hits = lib.search_tracks("ANTI-HERO", "").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].library_id, "1");
        let result = matcher().match_song("Anti-Hero", "Taylor Swift", &lib);
        assert_eq!(strategy_of(&result), Some((MatchStrategy::Exact, "1".into())));
    }
}
