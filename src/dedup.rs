//! Time-windowed play deduplication.
//!
//! Overlapping scrape passes report the same airplay more than once. An
//! observation earlier than `window` after the last genuine play of the
//! same (song, station) is suppressed, including late reports older than
//! that play; anything at or past the window is a new play and is folded
//! into its hourly bucket.
//!
//! Recording is serialized per station: the last-seen check, the last-seen
//! update and the bucket write happen under one per-station lock.

use chrono::{Duration, NaiveDateTime};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{EngineError, Result};
use crate::models::{BucketKey, PlayObservation, PlayOutcome};

/// Default dedup window in minutes.
pub const DEFAULT_WINDOW_MINUTES: i64 = 20;

// ============================================================================
// Collaborators
// ============================================================================

/// What a bucket upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWrite {
    Inserted,
    Incremented,
}

/// Persistent side of play recording.
pub trait PlaySink: Send + Sync {
    /// Follow merge redirects to the song id that currently holds the plays.
    fn canonical_song_id(&self, song_id: i64) -> Result<i64>;

    /// Song ids that were folded into `song_id` by merges.
    fn merged_from(&self, _song_id: i64) -> Result<Vec<i64>> {
        Ok(Vec::new())
    }

    /// Count one genuine play: upsert the bucket and bump song/artist counters atomically.
    fn apply_play(&self, key: &BucketKey, minute: Option<u32>, at: NaiveDateTime) -> Result<BucketWrite>;
}

/// Keyed store of the last genuine play per (song, station).
pub trait LastSeenStore: Send + Sync {
    fn get(&self, song_id: i64, station_id: &str) -> Result<Option<NaiveDateTime>>;
    fn set(&self, song_id: i64, station_id: &str, at: NaiveDateTime) -> Result<()>;
}

/// In-process last-seen map.
#[derive(Default)]
pub struct MemoryLastSeen {
    entries: Mutex<FxHashMap<(i64, String), NaiveDateTime>>,
}

impl MemoryLastSeen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from persisted minute-precise buckets so a restart does not
    /// double count the airplay that was on when the process stopped.
    pub fn warm_from(catalog: &Catalog, since: NaiveDateTime) -> Result<Self> {
        let store = Self::new();
        for (song_id, station_id, at) in catalog.last_plays_since(since)? {
            store.set(song_id, &station_id, at)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LastSeenStore for MemoryLastSeen {
    fn get(&self, song_id: i64, station_id: &str) -> Result<Option<NaiveDateTime>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::LockPoisoned("last seen"))?;
        Ok(entries.get(&(song_id, station_id.to_string())).copied())
    }

    fn set(&self, song_id: i64, station_id: &str, at: NaiveDateTime) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| EngineError::LockPoisoned("last seen"))?;
        entries.insert((song_id, station_id.to_string()), at);
        Ok(())
    }
}

// ============================================================================
// Deduplicator
// ============================================================================

pub struct PlayDeduplicator {
    window: Duration,
    last_seen: Arc<dyn LastSeenStore>,
    station_locks: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl PlayDeduplicator {
    pub fn new(window: Duration, last_seen: Arc<dyn LastSeenStore>) -> Self {
        Self {
            window,
            last_seen,
            station_locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn station_lock(&self, station_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .station_locks
            .lock()
            .map_err(|_| EngineError::LockPoisoned("station locks"))?;
        Ok(Arc::clone(
            locks
                .entry(station_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Latest genuine play of the song on the station, including plays
    /// recorded against songs that have since been folded into it.
    fn last_genuine(
        &self,
        song_id: i64,
        station_id: &str,
        sink: &dyn PlaySink,
    ) -> Result<Option<NaiveDateTime>> {
        let mut last = self.last_seen.get(song_id, station_id)?;
        for folded in sink.merged_from(song_id)? {
            if let Some(at) = self.last_seen.get(folded, station_id)? {
                last = Some(last.map_or(at, |l| l.max(at)));
            }
        }
        Ok(last)
    }

    /// Decide whether `obs` is a genuine play and, if so, count it.
    ///
    /// Suppressed when `observed_at - last < window`. The difference is
    /// signed, so a report older than the last genuine play is always a
    /// duplicate and last-seen only ever moves forward.
    pub fn record_play(&self, obs: &PlayObservation, sink: &dyn PlaySink) -> Result<PlayOutcome> {
        let lock = self.station_lock(&obs.station_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| EngineError::LockPoisoned("station"))?;

        let song_id = sink.canonical_song_id(obs.song_id)?;
        if let Some(last) = self.last_genuine(song_id, &obs.station_id, sink)? {
            let gap = obs.observed_at - last;
            if gap < self.window {
                debug!(
                    song_id,
                    station = %obs.station_id,
                    gap_secs = gap.num_seconds(),
                    "suppressed duplicate play"
                );
                return Ok(PlayOutcome::SuppressedDuplicate);
            }
        }

        let key = BucketKey::for_play(song_id, &obs.station_id, obs.observed_at);
        let write = sink.apply_play(&key, obs.minute(), obs.observed_at)?;
        self.last_seen.set(song_id, &obs.station_id, obs.observed_at)?;

        Ok(match write {
            BucketWrite::Inserted => PlayOutcome::NewBucket,
            BucketWrite::Incremented => PlayOutcome::IncrementedExisting,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArtistId, TimePrecision};
    use crate::normalize::normalize_title;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap().and_hms_opt(h, m, s).unwrap()
    }

    fn setup() -> (Arc<Catalog>, i64, PlayDeduplicator) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let artist = ArtistId::Resolved("mbid-1".into());
        catalog.upsert_artist(&artist, "Queen", None, t(0, 0, 0)).unwrap();
        let song = catalog
            .insert_song(&artist, &normalize_title("Radio Ga Ga"), t(0, 0, 0))
            .unwrap();
        let dedup = PlayDeduplicator::new(
            Duration::minutes(DEFAULT_WINDOW_MINUTES),
            Arc::new(MemoryLastSeen::new()),
        );
        (catalog, song.id, dedup)
    }

    #[test]
    fn test_window_boundary_is_new_play() {
        let (catalog, song, dedup) = setup();
        let first = PlayObservation::new(song, "kiss", t(14, 0, 0));
        let at_window = PlayObservation::new(song, "kiss", t(14, 20, 0));
        assert_eq!(dedup.record_play(&first, catalog.as_ref()).unwrap(), PlayOutcome::NewBucket);
        assert_eq!(
            dedup.record_play(&at_window, catalog.as_ref()).unwrap(),
            PlayOutcome::IncrementedExisting
        );
    }

    #[test]
    fn test_one_second_under_window_suppressed() {
        let (catalog, song, dedup) = setup();
        let first = PlayObservation::new(song, "kiss", t(14, 0, 0));
        let under = PlayObservation::new(song, "kiss", t(14, 19, 59));
        dedup.record_play(&first, catalog.as_ref()).unwrap();
        assert_eq!(
            dedup.record_play(&under, catalog.as_ref()).unwrap(),
            PlayOutcome::SuppressedDuplicate
        );
        let key = BucketKey::for_play(song, "kiss", t(14, 0, 0));
        assert_eq!(catalog.bucket_count(&key).unwrap(), Some(1));
    }

    #[test]
    fn test_stations_are_independent() {
        let (catalog, song, dedup) = setup();
        dedup.record_play(&PlayObservation::new(song, "kiss", t(14, 0, 0)), catalog.as_ref()).unwrap();
        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(song, "wxyz", t(14, 1, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::NewBucket
        );
    }

    #[test]
    fn test_new_hour_gets_new_bucket() {
        let (catalog, song, dedup) = setup();
        dedup.record_play(&PlayObservation::new(song, "kiss", t(14, 50, 0)), catalog.as_ref()).unwrap();
        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(song, "kiss", t(15, 15, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::NewBucket
        );
    }

    #[test]
    fn test_late_older_reports_are_duplicates() {
        let (catalog, song, dedup) = setup();
        let mut outcomes = Vec::new();
        for m in [30, 5, 10] {
            let obs = PlayObservation::new(song, "kiss", t(14, m, 0));
            outcomes.push(dedup.record_play(&obs, catalog.as_ref()).unwrap());
        }
        assert_eq!(
            outcomes,
            vec![
                PlayOutcome::NewBucket,
                PlayOutcome::SuppressedDuplicate,
                PlayOutcome::SuppressedDuplicate
            ]
        );
        assert_eq!(catalog.get_song(song).unwrap().unwrap().play_count, 1);
        // The window still runs from 14:30
        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(song, "kiss", t(14, 45, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::SuppressedDuplicate
        );
        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(song, "kiss", t(14, 50, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::IncrementedExisting
        );
    }

    #[test]
    fn test_last_seen_follows_folded_song() {
        let (catalog, kept, dedup) = setup();
        let pending = ArtistId::pending_for("queen");
        catalog.upsert_artist(&pending, "QUEEN", None, t(0, 0, 0)).unwrap();
        let doomed = catalog
            .insert_song(&pending, &normalize_title("RADIO GA GA"), t(0, 0, 0))
            .unwrap();

        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(doomed.id, "kiss", t(14, 0, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::NewBucket
        );
        let merge = catalog
            .merge_pending(&pending, &ArtistId::Resolved("mbid-1".into()), "Queen")
            .unwrap();
        assert_eq!(merge.songs_folded, 1);
        assert_eq!(catalog.merged_from(kept).unwrap(), vec![doomed.id]);

        assert_eq!(
            dedup
                .record_play(&PlayObservation::new(kept, "kiss", t(14, 5, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::SuppressedDuplicate
        );
        assert_eq!(catalog.bucket_total(kept).unwrap(), 1);
    }

    #[test]
    fn test_poisoned_last_seen_is_an_error() {
        let store = Arc::new(MemoryLastSeen::new());
        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.entries.lock().unwrap();
            panic!("poison the map");
        })
        .join();
        assert!(matches!(store.get(1, "kiss"), Err(EngineError::LockPoisoned(_))));
        assert!(matches!(
            store.set(1, "kiss", t(14, 0, 0)),
            Err(EngineError::LockPoisoned(_))
        ));
    }

    #[test]
    fn test_hour_precision_has_no_minute() {
        let (catalog, song, dedup) = setup();
        let mut obs = PlayObservation::new(song, "kiss", t(14, 0, 0));
        obs.precision = TimePrecision::Hour;
        dedup.record_play(&obs, catalog.as_ref()).unwrap();
        assert!(catalog.last_plays_since(t(0, 0, 0)).unwrap().is_empty());
    }

    #[test]
    fn test_warm_start_suppresses_replayed_observation() {
        let (catalog, song, dedup) = setup();
        dedup.record_play(&PlayObservation::new(song, "kiss", t(14, 10, 0)), catalog.as_ref()).unwrap();

        let warmed = MemoryLastSeen::warm_from(&catalog, t(12, 0, 0)).unwrap();
        assert_eq!(warmed.len(), 1);
        let restarted = PlayDeduplicator::new(Duration::minutes(20), Arc::new(warmed));
        assert_eq!(
            restarted
                .record_play(&PlayObservation::new(song, "kiss", t(14, 15, 0)), catalog.as_ref())
                .unwrap(),
            PlayOutcome::SuppressedDuplicate
        );
    }

    #[test]
    fn test_concurrent_same_station_counts_once() {
        let (catalog, song, dedup) = setup();
        let dedup = Arc::new(dedup);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let catalog = Arc::clone(&catalog);
                let dedup = Arc::clone(&dedup);
                std::thread::spawn(move || {
                    let obs = PlayObservation::new(song, "kiss", t(14, 0, i));
                    dedup.record_play(&obs, catalog.as_ref()).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let counted = outcomes
            .iter()
            .filter(|o| **o != PlayOutcome::SuppressedDuplicate)
            .count();
        assert_eq!(counted, 1);
        assert_eq!(catalog.get_song(song).unwrap().unwrap().play_count, 1);
    }
}
