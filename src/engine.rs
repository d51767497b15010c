//! Engine: the operations a scheduler or request handler triggers.
//!
//! - `ingest`: one scraped now-playing entry through filter, resolver and dedup
//! - `retry_pending`: sweep every PENDING artist through the resolver again
//! - `build_playlist`: match the most played songs against a media library
//! - `cleanup_stale_pending`: drop placeholders nobody has played in a while
//!
//! Sweeps check a `CancelToken` between units of work. Each unit commits on
//! its own, so stopping early never leaves a half-applied artist or song.

use chrono::{Duration, NaiveDateTime};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, SongQuery};
use crate::config::EngineConfig;
use crate::dedup::{LastSeenStore, MemoryLastSeen, PlayDeduplicator};
use crate::error::{EngineError, Result};
use crate::matcher::{LibraryMatcher, LibrarySearch};
use crate::models::{
    ArtistId, MatchResult, MatchStrategy, NotFoundReason, PlayObservation, PlayOutcome, PlaylistBuild,
    ScrapedPlay, SweepReport,
};
use crate::musicbrainz::{MusicBrainzClient, DEFAULT_BASE_URL};
use crate::normalize::{normalize_artist, normalize_title, should_skip_play};
use crate::overrides::SharedOverrides;
use crate::progress::{create_progress_bar, log_progress};
use crate::registry::{IdentityRegistry, RateLimitedRegistry, RegistryGate};
use crate::resolver::{IdentityResolver, Resolution, ResolutionSource, RetryOutcome};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative stop signal shared between a sweep and whoever may stop it.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Ingest
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub enum IngestOutcome {
    /// Dropped before resolution: too short, or an ad / station ID
    Skipped,
    Recorded {
        artist_id: String,
        song_id: i64,
        source: ResolutionSource,
        outcome: PlayOutcome,
    },
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    catalog: Arc<Catalog>,
    overrides: Arc<SharedOverrides>,
    resolver: IdentityResolver,
    dedup: PlayDeduplicator,
    matcher: LibraryMatcher,
    pending_max_age: Duration,
}

impl Engine {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<dyn IdentityRegistry>,
        overrides: Arc<SharedOverrides>,
        last_seen: Arc<dyn LastSeenStore>,
        config: &EngineConfig,
    ) -> Self {
        let resolver = IdentityResolver::new(
            Arc::clone(&catalog),
            registry,
            Arc::clone(&overrides),
            config.resolver_settings(),
        );
        Self {
            dedup: PlayDeduplicator::new(config.dedup_window(), last_seen),
            matcher: LibraryMatcher::new(config.matcher_settings()),
            pending_max_age: Duration::days(config.catalog.pending_max_age_days),
            catalog,
            overrides,
            resolver,
        }
    }

    /// Production wiring: SQLite catalog at `db_path`, override file from
    /// the config, MusicBrainz behind the shared rate limit, and a last-seen
    /// map warmed from recent buckets.
    pub fn open(db_path: &Path, config: &EngineConfig, now: NaiveDateTime) -> Result<Self> {
        config.validate()?;
        let catalog = Arc::new(Catalog::open(db_path)?);

        let overrides = Arc::new(match &config.resolver.overrides_path {
            Some(path) => SharedOverrides::from_file(path.clone()),
            None => SharedOverrides::new(Default::default()),
        });

        let client = MusicBrainzClient::with_base_url(
            config.resolver.registry_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
            &config.resolver.user_agent,
            config.request_timeout(),
        );
        let gate = RegistryGate::new(config.registry_min_interval())?;
        let registry: Arc<dyn IdentityRegistry> =
            Arc::new(RateLimitedRegistry::new(client, gate, config.registry_retry()));

        let since = now - Duration::hours(config.catalog.warm_start_hours);
        let last_seen = MemoryLastSeen::warm_from(&catalog, since)?;
        info!(entries = last_seen.len(), "warmed dedup state from recent plays");

        Ok(Self::new(catalog, registry, overrides, Arc::new(last_seen), config))
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    /// Re-read the override file. Returns the number of entries in effect.
    pub fn reload_overrides(&self) -> Result<usize> {
        self.overrides.reload()
    }

    fn resolve_play(&self, play: &ScrapedPlay) -> Result<Resolution> {
        match play.artist_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                self.resolver
                    .adopt_supplied(id, &play.artist, Some(&play.station_id), play.played_at)
            }
            _ => self
                .resolver
                .resolve_with_source(&play.artist, Some(&play.station_id), play.played_at),
        }
    }

    /// Record one scraped play.
    pub fn ingest(&self, play: &ScrapedPlay) -> Result<IngestOutcome> {
        let artist = normalize_artist(&play.artist);
        let title = normalize_title(&play.title);
        if should_skip_play(&artist, &title) {
            debug!(station = %play.station_id, artist = %play.artist, title = %play.title, "skipped non-song entry");
            return Ok(IngestOutcome::Skipped);
        }

        let mut resolution = self.resolve_play(play)?;
        let song = match self
            .catalog
            .get_or_create_song(&resolution.artist.id, &title, play.played_at)
        {
            Ok(song) => song,
            // The placeholder was merged away between resolve and insert;
            // resolving again finds the merged artist.
            Err(EngineError::DataIntegrity(msg)) if resolution.artist.id.is_pending() => {
                debug!(artist = %resolution.artist.id, %msg, "pending artist merged mid-ingest, resolving again");
                resolution = self.resolve_play(play)?;
                self.catalog
                    .get_or_create_song(&resolution.artist.id, &title, play.played_at)?
            }
            Err(e) => return Err(e),
        };

        let observation = PlayObservation {
            song_id: song.id,
            station_id: play.station_id.clone(),
            observed_at: play.played_at,
            precision: play.precision,
        };
        let outcome = self.dedup.record_play(&observation, self.catalog.as_ref())?;
        Ok(IngestOutcome::Recorded {
            artist_id: resolution.artist.id.storage_key(),
            song_id: song.id,
            source: resolution.source,
            outcome,
        })
    }

    /// Re-resolve PENDING artists, oldest first, merging each one that now
    /// resolves. Stops between artists when `cancel` fires.
    pub fn retry_pending(&self, cancel: &CancelToken, limit: Option<usize>) -> Result<SweepReport> {
        let mut pending = self.catalog.pending_artists()?;
        if let Some(limit) = limit {
            pending.truncate(limit);
        }
        let mut report = SweepReport {
            total: pending.len(),
            ..Default::default()
        };
        info!(total = report.total, "retrying pending artists");

        let pb = create_progress_bar(report.total as u64, "Retrying pending");
        for (i, artist) in pending.iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(done = i, total = report.total, "pending sweep cancelled");
                break;
            }
            match self.resolver.retry_pending(artist) {
                Ok(RetryOutcome::Resolved { artist: resolved, merge, .. }) => {
                    report.resolved += 1;
                    report.merged_songs += merge.songs_repointed + merge.songs_folded;
                    info!(from = %artist.id, to = %resolved.id, name = %resolved.name, "pending artist resolved");
                }
                Ok(RetryOutcome::StillPending) => report.still_pending += 1,
                Err(e) => {
                    report.errors += 1;
                    warn!(artist = %artist.id, error = %e, "pending retry failed");
                }
            }
            pb.inc(1);
            log_progress("retry-pending", i as u64 + 1, report.total as u64, 50);
        }
        pb.finish_and_clear();

        info!(
            resolved = report.resolved,
            still_pending = report.still_pending,
            errors = report.errors,
            "pending sweep finished"
        );
        Ok(report)
    }

    /// Match the most played songs against the library. NotFound results
    /// are persisted for review; earlier failures of songs that now match
    /// are closed.
    pub fn build_playlist(
        &self,
        query: &SongQuery,
        library: &dyn LibrarySearch,
        cancel: &CancelToken,
        now: NaiveDateTime,
    ) -> Result<PlaylistBuild> {
        let songs = self.catalog.top_songs(query)?;
        let mut build = PlaylistBuild {
            requested: songs.len(),
            ..Default::default()
        };
        info!(songs = build.requested, since = %query.since, "building playlist");

        let pb = create_progress_bar(songs.len() as u64, "Matching");
        let results: Vec<Option<MatchResult>> = songs
            .par_iter()
            .map(|song| {
                if cancel.is_cancelled() {
                    return None;
                }
                let result = self.matcher.match_song(&song.title, &song.artist_name, library);
                pb.inc(1);
                Some(result)
            })
            .collect();
        pb.finish_and_clear();

        let mut counts = [0usize; MatchStrategy::ALL.len()];
        for (song, result) in songs.iter().zip(results) {
            let Some(result) = result else {
                build.cancelled = true;
                continue;
            };
            match result {
                MatchResult::Matched { track, strategy, .. } => {
                    if let Some(slot) = MatchStrategy::ALL.iter().position(|s| *s == strategy) {
                        counts[slot] += 1;
                    }
                    self.catalog.resolve_match_failures(song.song_id, now)?;
                    build.matched.push((song.song_id, track));
                }
                MatchResult::NotFound { attempts, reason } => {
                    let detail = match &reason {
                        NotFoundReason::LibraryUnavailable(msg) => Some(msg.clone()),
                        NotFoundReason::BelowThreshold { candidate_count } => {
                            Some(format!("{} candidates", candidate_count))
                        }
                        NotFoundReason::NoCandidates => None,
                    };
                    debug!(song = song.song_id, title = %song.title, artist = %song.artist_name, reason = reason.label(), "no library match");
                    self.catalog.record_match_failure(
                        song.song_id,
                        reason.label(),
                        detail.as_deref(),
                        &attempts,
                        now,
                    )?;
                    build.missing.push(song.song_id);
                }
            }
        }
        build.by_strategy = MatchStrategy::ALL.iter().copied().zip(counts).collect();

        info!(
            requested = build.requested,
            matched = build.matched.len(),
            missing = build.missing.len(),
            cancelled = build.cancelled,
            "playlist build finished"
        );
        Ok(build)
    }

    /// Delete PENDING artists not seen within the configured age.
    pub fn cleanup_stale_pending(&self, now: NaiveDateTime) -> Result<usize> {
        let cutoff = now - self.pending_max_age;
        let deleted = self.catalog.delete_stale_pending(cutoff)?;
        if deleted > 0 {
            info!(deleted, %cutoff, "removed stale pending artists");
        }
        Ok(deleted)
    }
}

/// Placeholder id a raw artist credit would get, for operator tooling.
pub fn pending_id_for(raw_artist: &str) -> ArtistId {
    ArtistId::pending_for(&normalize_artist(raw_artist).comparison_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExternalError;
    use crate::models::{BucketKey, LibraryTrack, TimePrecision};
    use crate::overrides::OverrideTable;
    use crate::registry::RegistryArtist;
    use chrono::NaiveDate;
    use rustc_hash::FxHashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistry {
        artists: Mutex<FxHashMap<String, RegistryArtist>>,
    }

    impl FakeRegistry {
        fn add(&self, id: &str, name: &str) {
            self.artists.lock().unwrap().insert(
                normalize_artist(name).comparison_key,
                RegistryArtist {
                    id: id.into(),
                    display_name: name.into(),
                    similarity: 1.0,
                },
            );
        }
    }

    impl IdentityRegistry for FakeRegistry {
        fn lookup_artist(&self, name: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
            let key = normalize_artist(name).comparison_key;
            Ok(self.artists.lock().unwrap().get(&key).cloned())
        }

        fn lookup_artist_by_id(&self, _id: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
            Ok(None)
        }
    }

    struct FixedLibrary(Vec<LibraryTrack>);

    impl LibrarySearch for FixedLibrary {
        fn search_tracks(&self, _t: &str, _a: &str) -> std::result::Result<Vec<LibraryTrack>, ExternalError> {
            Ok(self.0.clone())
        }
    }

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn engine(registry: Arc<FakeRegistry>) -> Engine {
        Engine::new(
            Arc::new(Catalog::open_in_memory().unwrap()),
            registry,
            Arc::new(SharedOverrides::new(OverrideTable::empty())),
            Arc::new(MemoryLastSeen::new()),
            &EngineConfig::default(),
        )
    }

    fn play(station: &str, artist: &str, title: &str, played_at: NaiveDateTime) -> ScrapedPlay {
        ScrapedPlay {
            station_id: station.into(),
            artist: artist.into(),
            title: title.into(),
            played_at,
            precision: TimePrecision::Minute,
            artist_id: None,
        }
    }

    fn recorded(outcome: IngestOutcome) -> (String, i64, PlayOutcome) {
        match outcome {
            IngestOutcome::Recorded {
                artist_id,
                song_id,
                outcome,
                ..
            } => (artist_id, song_id, outcome),
            IngestOutcome::Skipped => panic!("play was skipped"),
        }
    }

    #[test]
    fn test_end_to_end_featuring_clean_edit() {
        let registry = Arc::new(FakeRegistry::default());
        registry.add("mb-taylor", "Taylor Swift");
        let engine = engine(registry);

        let (artist, song, outcome) = recorded(
            engine
                .ingest(&play("x", "TAYLOR SWIFT FEAT. SZA", "ANTI-HERO (CLEAN)", at(1, 14, 0)))
                .unwrap(),
        );
        assert_eq!(artist, "mb-taylor");
        assert_eq!(outcome, PlayOutcome::NewBucket);
        let stored = engine.catalog().get_song(song).unwrap().unwrap();
        assert_eq!(stored.title, "Anti-Hero");
        let key = BucketKey::for_play(song, "x", at(1, 14, 0));
        assert_eq!(engine.catalog().bucket_count(&key).unwrap(), Some(1));

        let (_, _, second) = recorded(
            engine
                .ingest(&play("x", "TAYLOR SWIFT FEAT. SZA", "ANTI-HERO (CLEAN)", at(1, 14, 5)))
                .unwrap(),
        );
        assert_eq!(second, PlayOutcome::SuppressedDuplicate);
        assert_eq!(engine.catalog().bucket_count(&key).unwrap(), Some(1));

        let (_, third_song, third) = recorded(
            engine
                .ingest(&play("x", "Taylor Swift", "Anti-Hero", at(1, 14, 25)))
                .unwrap(),
        );
        assert_eq!(third_song, song);
        assert_eq!(third, PlayOutcome::IncrementedExisting);
        assert_eq!(engine.catalog().bucket_count(&key).unwrap(), Some(2));
    }

    #[test]
    fn test_play_crossing_hour_gets_new_bucket() {
        let registry = Arc::new(FakeRegistry::default());
        registry.add("mb-adele", "Adele");
        let engine = engine(registry);
        engine.ingest(&play("x", "Adele", "Hello", at(1, 14, 40))).unwrap();
        let (_, song, outcome) = recorded(engine.ingest(&play("x", "Adele", "Hello", at(1, 15, 5))).unwrap());
        assert_eq!(outcome, PlayOutcome::NewBucket);
        assert_eq!(engine.catalog().bucket_total(song).unwrap(), 2);
    }

    #[test]
    fn test_non_song_entries_skipped() {
        let engine = engine(Arc::new(FakeRegistry::default()));
        let ad = engine
            .ingest(&play("x", "KISS 108", "You're listening to Kiss 108", at(1, 9, 0)))
            .unwrap();
        assert!(matches!(ad, IngestOutcome::Skipped));
        let short = engine.ingest(&play("x", "ZZ", "Hi", at(1, 9, 0))).unwrap();
        assert!(matches!(short, IngestOutcome::Skipped));
        assert_eq!(engine.catalog().stats().unwrap().songs, 0);
    }

    #[test]
    fn test_station_supplied_id_is_trusted() {
        let engine = engine(Arc::new(FakeRegistry::default()));
        let mut entry = play("x", "Some Indie Act", "Debut", at(1, 9, 0));
        entry.artist_id = Some("mb-indie".into());
        match engine.ingest(&entry).unwrap() {
            IngestOutcome::Recorded { artist_id, source, .. } => {
                assert_eq!(artist_id, "mb-indie");
                assert_eq!(source, ResolutionSource::Station);
            }
            IngestOutcome::Skipped => panic!("play was skipped"),
        }
        // Later plays without the id land on the same artist through the alias
        let (artist, _, _) = recorded(engine.ingest(&play("y", "SOME INDIE ACT", "Debut", at(1, 10, 0))).unwrap());
        assert_eq!(artist, "mb-indie");
    }

    #[test]
    fn test_concurrent_plays_survive_merge() {
        const THREADS: usize = 6;
        const PLAYS: usize = 10;

        let registry = Arc::new(FakeRegistry::default());
        let engine = Arc::new(engine(Arc::clone(&registry)));
        let (pending_id, song, _) = recorded(
            engine
                .ingest(&play("init", "Midnight Static", "Neon Hearts", at(1, 0, 0)))
                .unwrap(),
        );
        assert!(pending_id.starts_with("PENDING-"));

        let writers: Vec<_> = (0..THREADS)
            .map(|t| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    let station = format!("s{}", t);
                    for p in 0..PLAYS {
                        let when = at(2, 0, 0) + Duration::minutes(30 * p as i64);
                        engine
                            .ingest(&play(&station, "Midnight Static", "Neon Hearts", when))
                            .unwrap();
                    }
                })
            })
            .collect();

        registry.add("mb-static", "Midnight Static");
        let report = engine.retry_pending(&CancelToken::new(), None).unwrap();
        for w in writers {
            w.join().unwrap();
        }

        assert_eq!(report.resolved + report.still_pending, report.total);
        // Whatever raced, a final sweep leaves nothing pending.
        engine.retry_pending(&CancelToken::new(), None).unwrap();
        let catalog = engine.catalog();
        assert!(catalog.pending_artists().unwrap().is_empty());

        let owned = catalog.songs_for_artist(&ArtistId::Resolved("mb-static".into())).unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, song);
        let expected = (1 + THREADS * PLAYS) as i64;
        assert_eq!(owned[0].play_count, expected);
        assert_eq!(catalog.bucket_total(song).unwrap(), expected);
    }

    #[test]
    fn test_cancelled_sweep_does_nothing() {
        let registry = Arc::new(FakeRegistry::default());
        let engine = engine(Arc::clone(&registry));
        engine.ingest(&play("x", "Unknown Band", "Song One", at(1, 9, 0))).unwrap();
        registry.add("mb-unknown", "Unknown Band");

        let cancel = CancelToken::new();
        cancel.cancel();
        let report = engine.retry_pending(&cancel, None).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.resolved, 0);
        assert_eq!(engine.catalog().pending_artists().unwrap().len(), 1);

        let report = engine.retry_pending(&CancelToken::new(), Some(10)).unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.merged_songs, 1);
    }

    #[test]
    fn test_playlist_build_records_and_resolves_failures() {
        let registry = Arc::new(FakeRegistry::default());
        registry.add("mb-adele", "Adele");
        registry.add("mb-queen", "Queen");
        let engine = engine(registry);
        engine.ingest(&play("x", "Adele", "Hello", at(1, 9, 0))).unwrap();
        engine.ingest(&play("x", "Adele", "Hello", at(1, 10, 0))).unwrap();
        engine.ingest(&play("x", "Queen", "Radio Ga Ga", at(1, 9, 0))).unwrap();

        let query = SongQuery {
            since: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            station_id: None,
            min_plays: 1,
            limit: 10,
        };
        let partial = FixedLibrary(vec![LibraryTrack {
            library_id: "lib-1".into(),
            title: "Hello".into(),
            artist: "Adele".into(),
        }]);
        let build = engine
            .build_playlist(&query, &partial, &CancelToken::new(), at(2, 0, 0))
            .unwrap();
        assert_eq!(build.requested, 2);
        assert_eq!(build.matched.len(), 1);
        assert_eq!(build.matched[0].1.library_id, "lib-1");
        assert_eq!(build.missing.len(), 1);
        assert_eq!(build.by_strategy[0], (MatchStrategy::Exact, 1));

        let failures = engine.catalog().unresolved_failures().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].title, "Radio Ga Ga");
        assert_eq!(failures[0].reason, "below_threshold");

        let full = FixedLibrary(vec![
            LibraryTrack {
                library_id: "lib-1".into(),
                title: "Hello".into(),
                artist: "Adele".into(),
            },
            LibraryTrack {
                library_id: "lib-2".into(),
                title: "Radio Ga Ga".into(),
                artist: "Queen".into(),
            },
        ]);
        engine
            .build_playlist(&query, &full, &CancelToken::new(), at(3, 0, 0))
            .unwrap();
        assert!(engine.catalog().unresolved_failures().unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_removes_only_stale_pending() {
        let registry = Arc::new(FakeRegistry::default());
        registry.add("mb-adele", "Adele");
        let engine = engine(registry);
        engine.ingest(&play("x", "Forgotten Act", "Old Tune", at(1, 9, 0))).unwrap();
        engine.ingest(&play("x", "Adele", "Hello", at(1, 9, 0))).unwrap();

        let now = at(1, 9, 0) + Duration::days(29);
        assert_eq!(engine.cleanup_stale_pending(now).unwrap(), 0);
        let now = at(1, 9, 0) + Duration::days(31);
        assert_eq!(engine.cleanup_stale_pending(now).unwrap(), 1);
        let stats = engine.catalog().stats().unwrap();
        assert_eq!(stats.pending_artists, 0);
        assert_eq!(stats.resolved_artists, 1);
        assert_eq!(stats.songs, 1);
    }

    #[test]
    fn test_pending_id_is_spelling_insensitive() {
        assert_eq!(pending_id_for("AIN\u{2019}T IT FUN"), pending_id_for("ain't it fun"));
    }
}
