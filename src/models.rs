//! Core data models for the resolution engine.
//!
//! Catalog entities (`CanonicalArtist`, `CatalogSong`, play buckets), the
//! ephemeral inputs and outputs of the pipeline, and the stats structs
//! reported by sweeps.

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::scoring::MatchConfidence;

// ============================================================================
// Artist Identity
// ============================================================================

/// Prefix of the storage form of a placeholder identity.
pub const PENDING_PREFIX: &str = "PENDING-";

/// Canonical artist identity: a registry id, or a placeholder awaiting resolution.
///
/// The `PENDING-<hash>` string only exists at the storage boundary
/// (`storage_key` / `from_storage`); in memory the variant is explicit.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ArtistId {
    Resolved(String),
    Pending(String),
}

impl ArtistId {
    /// Placeholder id derived from an artist comparison key, so every
    /// spelling that normalizes to the same key shares one placeholder.
    pub fn pending_for(comparison_key: &str) -> Self {
        ArtistId::Pending(format!("{:x}", md5::compute(comparison_key.as_bytes())))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ArtistId::Pending(_))
    }

    pub fn storage_key(&self) -> String {
        match self {
            ArtistId::Resolved(id) => id.clone(),
            ArtistId::Pending(hash) => format!("{}{}", PENDING_PREFIX, hash),
        }
    }

    pub fn from_storage(key: &str) -> Self {
        match key.strip_prefix(PENDING_PREFIX) {
            Some(hash) => ArtistId::Pending(hash.to_string()),
            None => ArtistId::Resolved(key.to_string()),
        }
    }
}

impl fmt::Display for ArtistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Whether the artist still has to be pushed to the music-management service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ImportStatus {
    NeedsImport,
    Imported,
    NotApplicable,
}

impl ImportStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportStatus::NeedsImport => "needs_import",
            ImportStatus::Imported => "imported",
            ImportStatus::NotApplicable => "not_applicable",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "imported" => ImportStatus::Imported,
            "not_applicable" => ImportStatus::NotApplicable,
            _ => ImportStatus::NeedsImport,
        }
    }
}

// ============================================================================
// Catalog Models
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct CanonicalArtist {
    pub id: ArtistId,
    pub name: String,
    pub name_key: String,
    pub first_seen_station: Option<String>,
    pub first_seen_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
    pub import_status: ImportStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatalogSong {
    pub id: i64,
    pub artist_id: ArtistId,
    pub title: String,
    pub title_key: String,
    pub play_count: i64,
    pub first_seen_at: NaiveDateTime,
    pub last_seen_at: NaiveDateTime,
}

/// Catalog song joined with its artist's display name, as read for playlist builds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SongWithArtist {
    pub song_id: i64,
    pub title: String,
    pub artist_name: String,
    pub plays: i64,
}

// ============================================================================
// Plays
// ============================================================================

/// How precise an observation timestamp is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimePrecision {
    #[default]
    Minute,
    Hour,
}

/// One report of a song airing on a station. Folded into a play bucket, never stored as-is.
#[derive(Clone, Debug)]
pub struct PlayObservation {
    pub song_id: i64,
    pub station_id: String,
    pub observed_at: NaiveDateTime,
    pub precision: TimePrecision,
}

impl PlayObservation {
    pub fn new(song_id: i64, station_id: &str, observed_at: NaiveDateTime) -> Self {
        Self {
            song_id,
            station_id: station_id.to_string(),
            observed_at,
            precision: TimePrecision::Minute,
        }
    }

    /// Minute of the hour, when the source reported one.
    pub fn minute(&self) -> Option<u32> {
        match self.precision {
            TimePrecision::Minute => Some(self.observed_at.minute()),
            TimePrecision::Hour => None,
        }
    }
}

/// Composite identity of a play bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub date: NaiveDate,
    pub hour: u32,
    pub song_id: i64,
    pub station_id: String,
}

impl BucketKey {
    pub fn for_play(song_id: i64, station_id: &str, at: NaiveDateTime) -> Self {
        Self {
            date: at.date(),
            hour: at.hour(),
            song_id,
            station_id: station_id.to_string(),
        }
    }
}

/// Outcome of recording one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PlayOutcome {
    NewBucket,
    IncrementedExisting,
    SuppressedDuplicate,
}

/// Raw now-playing entry as produced by a station scraper.
#[derive(Clone, Debug, Deserialize)]
pub struct ScrapedPlay {
    pub station_id: String,
    pub artist: String,
    pub title: String,
    pub played_at: NaiveDateTime,
    #[serde(default)]
    pub precision: TimePrecision,
    /// Registry id supplied by the station feed itself, trusted over lookups.
    #[serde(default)]
    pub artist_id: Option<String>,
}

// ============================================================================
// Library Matching
// ============================================================================

/// Track as returned by the media library search. Unranked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LibraryTrack {
    pub library_id: String,
    pub title: String,
    pub artist: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    Exact,
    Normalized,
    Fuzzy,
    Partial,
}

impl MatchStrategy {
    /// Strategies in the order they are attempted.
    pub const ALL: [MatchStrategy; 4] = [
        MatchStrategy::Exact,
        MatchStrategy::Normalized,
        MatchStrategy::Fuzzy,
        MatchStrategy::Partial,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Normalized => "normalized",
            MatchStrategy::Fuzzy => "fuzzy",
            MatchStrategy::Partial => "partial",
        }
    }
}

/// Best score a strategy reached, `None` when it had nothing to score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: MatchStrategy,
    pub best_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NotFoundReason {
    /// The library search returned nothing for any query form
    NoCandidates,
    /// Candidates came back but none cleared a strategy threshold
    BelowThreshold { candidate_count: usize },
    /// The library could not be reached after retries
    LibraryUnavailable(String),
}

impl NotFoundReason {
    pub fn label(&self) -> &'static str {
        match self {
            NotFoundReason::NoCandidates => "no_candidates",
            NotFoundReason::BelowThreshold { .. } => "below_threshold",
            NotFoundReason::LibraryUnavailable(_) => "library_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum MatchResult {
    Matched {
        track: LibraryTrack,
        strategy: MatchStrategy,
        score: f64,
        confidence: MatchConfidence,
    },
    NotFound {
        attempts: Vec<StrategyAttempt>,
        reason: NotFoundReason,
    },
}

impl MatchResult {
    pub fn is_matched(&self) -> bool {
        matches!(self, MatchResult::Matched { .. })
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Rows touched by a PENDING → resolved merge.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Songs that only changed owner
    pub songs_repointed: usize,
    /// Songs folded into an existing song of the resolved artist
    pub songs_folded: usize,
    /// Play buckets combined with an existing bucket during a fold
    pub buckets_folded: usize,
}

/// Statistics for one PENDING retry sweep.
#[derive(Default, Debug, Clone, Serialize)]
pub struct SweepReport {
    pub total: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub merged_songs: usize,
    pub errors: usize,
    pub cancelled: bool,
}

/// Statistics and output of one playlist build.
#[derive(Default, Debug, Clone, Serialize)]
pub struct PlaylistBuild {
    pub requested: usize,
    pub matched: Vec<(i64, LibraryTrack)>,
    pub missing: Vec<i64>,
    pub by_strategy: Vec<(MatchStrategy, usize)>,
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_artist_id_storage_form() {
        let pending = ArtistId::pending_for("taylor swift feat. sza");
        let key = pending.storage_key();
        assert!(key.starts_with(PENDING_PREFIX));
        assert_eq!(key.len(), PENDING_PREFIX.len() + 32);
        assert_eq!(ArtistId::from_storage(&key), pending);

        let resolved = ArtistId::Resolved("20244d07-534f-4eff-b4d4-930878889970".into());
        assert_eq!(ArtistId::from_storage(&resolved.storage_key()), resolved);
        assert!(!resolved.is_pending());
    }

    #[test]
    fn test_pending_id_stable_per_key() {
        assert_eq!(ArtistId::pending_for("abc"), ArtistId::pending_for("abc"));
        assert_ne!(ArtistId::pending_for("abc"), ArtistId::pending_for("abd"));
    }

    #[test]
    fn test_bucket_key_and_minute() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(14, 10, 42).unwrap();
        let key = BucketKey::for_play(7, "kiss", at);
        assert_eq!(key.hour, 14);
        assert_eq!(key.date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        let mut obs = PlayObservation::new(7, "kiss", at);
        assert_eq!(obs.minute(), Some(10));
        obs.precision = TimePrecision::Hour;
        assert_eq!(obs.minute(), None);
    }

    #[test]
    fn test_import_status_round_trip() {
        for status in [ImportStatus::NeedsImport, ImportStatus::Imported, ImportStatus::NotApplicable] {
            assert_eq!(ImportStatus::parse(status.as_str()), status);
        }
    }
}
