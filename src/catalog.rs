//! SQLite catalog: artists, songs, play buckets, match failures.
//!
//! Uniqueness invariants live in the schema:
//! - one artist row per id (registry id or `PENDING-<hash>`)
//! - one song per (artist_id, title_key)
//! - one play bucket per (date, hour, song_id, station_id)
//!
//! The connection sits behind a mutex and every write is one short
//! transaction, so a PENDING merge and a concurrent play write are strictly
//! ordered. No network call ever runs while the lock is held.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::dedup::{BucketWrite, PlaySink};
use crate::error::{EngineError, Result};
use crate::models::{
    ArtistId, BucketKey, CanonicalArtist, CatalogSong, ImportStatus, MergeReport, SongWithArtist,
    StrategyAttempt,
};
use crate::normalize::{normalize_artist, NormalizedText};

/// Bumped whenever the schema below changes.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS artists (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        name_key TEXT NOT NULL,
        first_seen_station TEXT,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        import_status TEXT NOT NULL DEFAULT 'needs_import'
    );
    CREATE INDEX IF NOT EXISTS idx_artists_name_key ON artists(name_key);

    CREATE TABLE IF NOT EXISTS artist_aliases (
        alias_key TEXT PRIMARY KEY,
        artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE
    );
    CREATE INDEX IF NOT EXISTS idx_artist_aliases_artist ON artist_aliases(artist_id);

    CREATE TABLE IF NOT EXISTS songs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artist_id TEXT NOT NULL REFERENCES artists(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        title_key TEXT NOT NULL,
        play_count INTEGER NOT NULL DEFAULT 0,
        first_seen_at TEXT NOT NULL,
        last_seen_at TEXT NOT NULL,
        UNIQUE(artist_id, title_key)
    );

    CREATE TABLE IF NOT EXISTS song_redirects (
        from_id INTEGER PRIMARY KEY,
        to_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE
    );

    CREATE TABLE IF NOT EXISTS play_buckets (
        date TEXT NOT NULL,
        hour INTEGER NOT NULL CHECK (hour BETWEEN 0 AND 23),
        minute INTEGER CHECK (minute BETWEEN 0 AND 59),
        song_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
        station_id TEXT NOT NULL,
        play_count INTEGER NOT NULL CHECK (play_count >= 1),
        PRIMARY KEY (date, hour, song_id, station_id)
    );
    CREATE INDEX IF NOT EXISTS idx_play_buckets_song ON play_buckets(song_id);

    CREATE TABLE IF NOT EXISTS match_failures (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        song_id INTEGER NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
        failed_at TEXT NOT NULL,
        reason TEXT NOT NULL,
        detail TEXT,
        attempts_json TEXT NOT NULL,
        resolved INTEGER NOT NULL DEFAULT 0,
        resolved_at TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_match_failures_song ON match_failures(song_id);
";

const ARTIST_COLUMNS: &str =
    "id, name, name_key, first_seen_station, first_seen_at, last_seen_at, import_status";

const SONG_COLUMNS: &str = "id, artist_id, title, title_key, play_count, first_seen_at, last_seen_at";

fn artist_from_row(row: &Row<'_>) -> rusqlite::Result<CanonicalArtist> {
    let id: String = row.get(0)?;
    let status: String = row.get(6)?;
    Ok(CanonicalArtist {
        id: ArtistId::from_storage(&id),
        name: row.get(1)?,
        name_key: row.get(2)?,
        first_seen_station: row.get(3)?,
        first_seen_at: row.get(4)?,
        last_seen_at: row.get(5)?,
        import_status: ImportStatus::parse(&status),
    })
}

fn song_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogSong> {
    let artist_id: String = row.get(1)?;
    Ok(CatalogSong {
        id: row.get(0)?,
        artist_id: ArtistId::from_storage(&artist_id),
        title: row.get(2)?,
        title_key: row.get(3)?,
        play_count: row.get(4)?,
        first_seen_at: row.get(5)?,
        last_seen_at: row.get(6)?,
    })
}

/// Filter for selecting playlist candidates.
#[derive(Debug, Clone)]
pub struct SongQuery {
    pub since: NaiveDate,
    pub station_id: Option<String>,
    pub min_plays: i64,
    pub limit: usize,
}

/// Persisted NotFound result awaiting operator review.
#[derive(Debug, Clone, Serialize)]
pub struct MatchFailure {
    pub id: i64,
    pub song_id: i64,
    pub title: String,
    pub artist: String,
    pub failed_at: NaiveDateTime,
    pub reason: String,
    pub detail: Option<String>,
    pub attempts_json: String,
}

#[derive(Default, Debug, Clone, Serialize)]
pub struct CatalogStats {
    pub resolved_artists: i64,
    pub pending_artists: i64,
    pub songs: i64,
    pub play_buckets: i64,
    pub total_plays: i64,
    pub unresolved_failures: i64,
}

pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA temp_store = MEMORY;",
        )?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(EngineError::Config(format!(
                "catalog schema version {} is newer than supported {}",
                version, SCHEMA_VERSION
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| EngineError::LockPoisoned("catalog"))
    }

    // ========================================================================
    // Artists
    // ========================================================================

    pub fn get_artist(&self, id: &ArtistId) -> Result<Option<CanonicalArtist>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM artists WHERE id = ?1", ARTIST_COLUMNS);
        Ok(conn
            .query_row(&sql, [id.storage_key()], artist_from_row)
            .optional()?)
    }

    /// Resolved artist for a comparison key, by its own name or a remembered alias.
    pub fn find_resolved(&self, name_key: &str) -> Result<Option<CanonicalArtist>> {
        let conn = self.conn()?;
        let by_name = format!(
            "SELECT {} FROM artists WHERE name_key = ?1 AND id NOT LIKE 'PENDING-%'
             ORDER BY first_seen_at LIMIT 1",
            ARTIST_COLUMNS
        );
        if let Some(artist) = conn.query_row(&by_name, [name_key], artist_from_row).optional()? {
            return Ok(Some(artist));
        }
        let by_alias = format!(
            "SELECT {} FROM artists WHERE id = (SELECT artist_id FROM artist_aliases WHERE alias_key = ?1)
             AND id NOT LIKE 'PENDING-%'",
            ARTIST_COLUMNS
        );
        Ok(conn.query_row(&by_alias, [name_key], artist_from_row).optional()?)
    }

    /// Remember that a raw comparison key resolved to this artist.
    pub fn remember_alias(&self, alias_key: &str, id: &ArtistId) -> Result<()> {
        if alias_key.is_empty() {
            return Ok(());
        }
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO artist_aliases (alias_key, artist_id) VALUES (?1, ?2)
             ON CONFLICT(alias_key) DO UPDATE SET artist_id = excluded.artist_id",
            params![alias_key, id.storage_key()],
        )
        .map_err(|e| EngineError::from_write(e, "remember alias"))?;
        Ok(())
    }

    /// Insert the artist if unknown, otherwise bump its last-seen time.
    pub fn upsert_artist(
        &self,
        id: &ArtistId,
        name: &str,
        station: Option<&str>,
        seen_at: NaiveDateTime,
    ) -> Result<CanonicalArtist> {
        let conn = self.conn()?;
        let name_key = normalize_artist(name).comparison_key;
        conn.execute(
            "INSERT INTO artists (id, name, name_key, first_seen_station, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET last_seen_at = MAX(last_seen_at, excluded.last_seen_at)",
            params![id.storage_key(), name, name_key, station, seen_at],
        )
        .map_err(|e| EngineError::from_write(e, "upsert artist"))?;
        let sql = format!("SELECT {} FROM artists WHERE id = ?1", ARTIST_COLUMNS);
        Ok(conn.query_row(&sql, [id.storage_key()], artist_from_row)?)
    }

    /// Bump last-seen on an existing artist. `None` when the row is gone,
    /// e.g. a placeholder merged away by a concurrent sweep.
    pub fn touch_artist(&self, id: &ArtistId, seen_at: NaiveDateTime) -> Result<Option<CanonicalArtist>> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE artists SET last_seen_at = MAX(last_seen_at, ?2) WHERE id = ?1",
            params![id.storage_key(), seen_at],
        )?;
        let sql = format!("SELECT {} FROM artists WHERE id = ?1", ARTIST_COLUMNS);
        Ok(conn
            .query_row(&sql, [id.storage_key()], artist_from_row)
            .optional()?)
    }

    pub fn pending_artists(&self) -> Result<Vec<CanonicalArtist>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM artists WHERE id LIKE 'PENDING-%' ORDER BY first_seen_at",
            ARTIST_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], artist_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_import_status(&self, id: &ArtistId, status: ImportStatus) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE artists SET import_status = ?2 WHERE id = ?1",
            params![id.storage_key(), status.as_str()],
        )?;
        if changed == 0 {
            return Err(EngineError::not_found("artist", id.storage_key()));
        }
        Ok(())
    }

    /// Explicit user deletion. Cascades to songs, buckets, aliases and failures.
    pub fn delete_artist(&self, id: &ArtistId) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM artists WHERE id = ?1", [id.storage_key()])?;
        if deleted > 0 {
            info!(artist = %id, "deleted artist and its play history");
        }
        Ok(deleted > 0)
    }

    /// Delete PENDING artists not seen since `cutoff`, with everything they own.
    pub fn delete_stale_pending(&self, cutoff: NaiveDateTime) -> Result<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM artists WHERE id LIKE 'PENDING-%' AND last_seen_at < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Re-point everything owned by a PENDING artist onto a resolved id and
    /// delete the PENDING row, in one immediate transaction.
    ///
    /// Songs whose title key already exists under the resolved artist are
    /// folded into that song; a redirect row keeps late writers holding the
    /// old song id on the surviving row.
    pub fn merge_pending(
        &self,
        pending: &ArtistId,
        resolved: &ArtistId,
        display_name: &str,
    ) -> Result<MergeReport> {
        if !pending.is_pending() || resolved.is_pending() {
            return Err(EngineError::DataIntegrity(format!(
                "merge must go from a placeholder to a resolved id ({} -> {})",
                pending, resolved
            )));
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let from = pending.storage_key();
        let to = resolved.storage_key();

        let sql = format!("SELECT {} FROM artists WHERE id = ?1", ARTIST_COLUMNS);
        let source = tx
            .query_row(&sql, [&from], artist_from_row)
            .optional()?
            .ok_or_else(|| EngineError::not_found("artist", from.clone()))?;

        tx.execute(
            "INSERT INTO artists (id, name, name_key, first_seen_station, first_seen_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 first_seen_at = MIN(first_seen_at, excluded.first_seen_at),
                 last_seen_at = MAX(last_seen_at, excluded.last_seen_at)",
            params![
                to,
                display_name,
                normalize_artist(display_name).comparison_key,
                source.first_seen_station,
                source.first_seen_at,
                source.last_seen_at
            ],
        )
        .map_err(|e| EngineError::from_write(e, "merge target artist"))?;

        let songs: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, title_key FROM songs WHERE artist_id = ?1")?;
            let rows = stmt.query_map([&from], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut report = MergeReport::default();
        for (song_id, title_key) in songs {
            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM songs WHERE artist_id = ?1 AND title_key = ?2",
                    params![to, title_key],
                    |r| r.get(0),
                )
                .optional()?;
            match existing {
                Some(target) => {
                    report.buckets_folded += fold_song(&tx, song_id, target)?;
                    report.songs_folded += 1;
                }
                None => {
                    tx.execute(
                        "UPDATE songs SET artist_id = ?2 WHERE id = ?1",
                        params![song_id, to],
                    )?;
                    report.songs_repointed += 1;
                }
            }
        }

        // Aliases of the placeholder now point at the resolved artist, plus its own key.
        tx.execute(
            "UPDATE artist_aliases SET artist_id = ?2 WHERE artist_id = ?1",
            params![from, to],
        )?;
        tx.execute(
            "INSERT INTO artist_aliases (alias_key, artist_id) VALUES (?1, ?2)
             ON CONFLICT(alias_key) DO UPDATE SET artist_id = excluded.artist_id",
            params![source.name_key, to],
        )?;
        tx.execute("DELETE FROM artists WHERE id = ?1", [&from])?;
        tx.commit()?;

        info!(
            from = %pending,
            to = %resolved,
            repointed = report.songs_repointed,
            folded = report.songs_folded,
            "merged pending artist"
        );
        Ok(report)
    }

    // ========================================================================
    // Songs
    // ========================================================================

    /// Insert a new song. A second song with the same title key under the
    /// same artist is a `DataIntegrity` error.
    pub fn insert_song(
        &self,
        artist_id: &ArtistId,
        title: &NormalizedText,
        seen_at: NaiveDateTime,
    ) -> Result<CatalogSong> {
        let conn = self.conn()?;
        insert_song_locked(&conn, artist_id, title, seen_at)
    }

    /// Song for (artist, title key), created on first sight.
    pub fn get_or_create_song(
        &self,
        artist_id: &ArtistId,
        title: &NormalizedText,
        seen_at: NaiveDateTime,
    ) -> Result<CatalogSong> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM songs WHERE artist_id = ?1 AND title_key = ?2",
            SONG_COLUMNS
        );
        if let Some(song) = conn
            .query_row(&sql, params![artist_id.storage_key(), title.comparison_key], song_from_row)
            .optional()?
        {
            return Ok(song);
        }
        insert_song_locked(&conn, artist_id, title, seen_at)
    }

    pub fn get_song(&self, id: i64) -> Result<Option<CatalogSong>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM songs WHERE id = ?1", SONG_COLUMNS);
        Ok(conn.query_row(&sql, [id], song_from_row).optional()?)
    }

    pub fn songs_for_artist(&self, artist_id: &ArtistId) -> Result<Vec<CatalogSong>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM songs WHERE artist_id = ?1 ORDER BY id",
            SONG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([artist_id.storage_key()], song_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most played songs since a date, optionally for one station.
    pub fn top_songs(&self, query: &SongQuery) -> Result<Vec<SongWithArtist>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT s.id, s.title, a.name, SUM(b.play_count) AS plays
             FROM play_buckets b
             JOIN songs s ON s.id = b.song_id
             JOIN artists a ON a.id = s.artist_id
             WHERE b.date >= ?1 AND (?2 IS NULL OR b.station_id = ?2)
             GROUP BY s.id
             HAVING plays >= ?3
             ORDER BY plays DESC, s.id ASC
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![query.since, query.station_id, query.min_plays, query.limit as i64],
            |r| {
                Ok(SongWithArtist {
                    song_id: r.get(0)?,
                    title: r.get(1)?,
                    artist_name: r.get(2)?,
                    plays: r.get(3)?,
                })
            },
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // ========================================================================
    // Play buckets
    // ========================================================================

    /// Plain bucket insert outside the dedup path. A key collision is a
    /// `DataIntegrity` error rather than a silent increment.
    pub fn insert_bucket(&self, key: &BucketKey, minute: Option<u32>, count: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO play_buckets (date, hour, minute, song_id, station_id, play_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![key.date, key.hour, minute, key.song_id, key.station_id, count],
        )
        .map_err(|e| EngineError::from_write(e, "insert play bucket"))?;
        Ok(())
    }

    pub fn bucket_count(&self, key: &BucketKey) -> Result<Option<i64>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT play_count FROM play_buckets
                 WHERE date = ?1 AND hour = ?2 AND song_id = ?3 AND station_id = ?4",
                params![key.date, key.hour, key.song_id, key.station_id],
                |r| r.get(0),
            )
            .optional()?)
    }

    /// Sum of all bucket counts for a song.
    pub fn bucket_total(&self, song_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(play_count), 0) FROM play_buckets WHERE song_id = ?1",
            [song_id],
            |r| r.get(0),
        )?)
    }

    /// Latest minute-precise play per (song, station) on or after `since`.
    pub fn last_plays_since(&self, since: NaiveDateTime) -> Result<Vec<(i64, String, NaiveDateTime)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT song_id, station_id, date, hour, minute FROM play_buckets
             WHERE minute IS NOT NULL AND date >= ?1",
        )?;
        let rows = stmt.query_map([since.date()], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, NaiveDate>(2)?,
                r.get::<_, u32>(3)?,
                r.get::<_, u32>(4)?,
            ))
        })?;

        let mut latest: FxHashMap<(i64, String), NaiveDateTime> = FxHashMap::default();
        for row in rows {
            let (song_id, station_id, date, hour, minute) = row?;
            let Some(time) = NaiveTime::from_hms_opt(hour, minute, 0) else {
                continue;
            };
            let at = date.and_time(time);
            if at < since {
                continue;
            }
            let slot = latest.entry((song_id, station_id)).or_insert(at);
            if at > *slot {
                *slot = at;
            }
        }
        Ok(latest
            .into_iter()
            .map(|((song, station), at)| (song, station, at))
            .collect())
    }

    // ========================================================================
    // Match failures
    // ========================================================================

    pub fn record_match_failure(
        &self,
        song_id: i64,
        reason: &str,
        detail: Option<&str>,
        attempts: &[StrategyAttempt],
        at: NaiveDateTime,
    ) -> Result<i64> {
        let attempts_json = serde_json::to_string(attempts)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO match_failures (song_id, failed_at, reason, detail, attempts_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![song_id, at, reason, detail, attempts_json],
        )
        .map_err(|e| EngineError::from_write(e, "record match failure"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark open failures for a song resolved. Returns how many were closed.
    pub fn resolve_match_failures(&self, song_id: i64, at: NaiveDateTime) -> Result<usize> {
        let conn = self.conn()?;
        Ok(conn.execute(
            "UPDATE match_failures SET resolved = 1, resolved_at = ?2
             WHERE song_id = ?1 AND resolved = 0",
            params![song_id, at],
        )?)
    }

    pub fn unresolved_failures(&self) -> Result<Vec<MatchFailure>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT f.id, f.song_id, s.title, a.name, f.failed_at, f.reason, f.detail, f.attempts_json
             FROM match_failures f
             JOIN songs s ON s.id = f.song_id
             JOIN artists a ON a.id = s.artist_id
             WHERE f.resolved = 0
             ORDER BY f.failed_at DESC, f.id DESC",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(MatchFailure {
                id: r.get(0)?,
                song_id: r.get(1)?,
                title: r.get(2)?,
                artist: r.get(3)?,
                failed_at: r.get(4)?,
                reason: r.get(5)?,
                detail: r.get(6)?,
                attempts_json: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(CatalogStats {
            resolved_artists: count("SELECT COUNT(*) FROM artists WHERE id NOT LIKE 'PENDING-%'")?,
            pending_artists: count("SELECT COUNT(*) FROM artists WHERE id LIKE 'PENDING-%'")?,
            songs: count("SELECT COUNT(*) FROM songs")?,
            play_buckets: count("SELECT COUNT(*) FROM play_buckets")?,
            total_plays: count("SELECT COALESCE(SUM(play_count), 0) FROM play_buckets")?,
            unresolved_failures: count("SELECT COUNT(*) FROM match_failures WHERE resolved = 0")?,
        })
    }
}

fn insert_song_locked(
    conn: &Connection,
    artist_id: &ArtistId,
    title: &NormalizedText,
    seen_at: NaiveDateTime,
) -> Result<CatalogSong> {
    if title.is_empty() {
        return Err(EngineError::DataIntegrity("song title is empty".to_string()));
    }
    conn.execute(
        "INSERT INTO songs (artist_id, title, title_key, play_count, first_seen_at, last_seen_at)
         VALUES (?1, ?2, ?3, 0, ?4, ?4)",
        params![artist_id.storage_key(), title.display, title.comparison_key, seen_at],
    )
    .map_err(|e| EngineError::from_write(e, "insert song"))?;
    let id = conn.last_insert_rowid();
    debug!(song_id = id, artist = %artist_id, title = %title.display, "new catalog song");
    Ok(CatalogSong {
        id,
        artist_id: artist_id.clone(),
        title: title.display.clone(),
        title_key: title.comparison_key.clone(),
        play_count: 0,
        first_seen_at: seen_at,
        last_seen_at: seen_at,
    })
}

fn resolve_redirect(conn: &Connection, song_id: i64) -> rusqlite::Result<i64> {
    Ok(conn
        .query_row(
            "SELECT to_id FROM song_redirects WHERE from_id = ?1",
            [song_id],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(song_id))
}

/// Move plays, counters and failure records from one song onto another and
/// delete the source. Returns how many buckets collided and were summed.
fn fold_song(tx: &Transaction<'_>, from: i64, to: i64) -> Result<usize> {
    let buckets: Vec<(NaiveDate, u32, Option<u32>, String, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT date, hour, minute, station_id, play_count FROM play_buckets WHERE song_id = ?1",
        )?;
        let rows = stmt.query_map([from], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let mut collided = 0;
    for (date, hour, minute, station_id, count) in buckets {
        let changed = tx.execute(
            "UPDATE play_buckets
             SET play_count = play_count + ?5, minute = MAX(COALESCE(minute, ?3), COALESCE(?3, minute))
             WHERE date = ?1 AND hour = ?2 AND song_id = ?4 AND station_id = ?6",
            params![date, hour, minute, to, count, station_id],
        )?;
        if changed > 0 {
            collided += 1;
        } else {
            tx.execute(
                "INSERT INTO play_buckets (date, hour, minute, song_id, station_id, play_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![date, hour, minute, to, station_id, count],
            )?;
        }
    }
    tx.execute("DELETE FROM play_buckets WHERE song_id = ?1", [from])?;

    tx.execute(
        "UPDATE songs SET
             play_count = play_count + (SELECT play_count FROM songs WHERE id = ?1),
             first_seen_at = MIN(first_seen_at, (SELECT first_seen_at FROM songs WHERE id = ?1)),
             last_seen_at = MAX(last_seen_at, (SELECT last_seen_at FROM songs WHERE id = ?1))
         WHERE id = ?2",
        params![from, to],
    )?;
    tx.execute(
        "UPDATE match_failures SET song_id = ?2 WHERE song_id = ?1",
        params![from, to],
    )?;
    tx.execute(
        "UPDATE song_redirects SET to_id = ?2 WHERE to_id = ?1",
        params![from, to],
    )?;
    tx.execute(
        "INSERT INTO song_redirects (from_id, to_id) VALUES (?1, ?2)
         ON CONFLICT(from_id) DO UPDATE SET to_id = excluded.to_id",
        params![from, to],
    )?;
    tx.execute("DELETE FROM songs WHERE id = ?1", [from])?;
    Ok(collided)
}

impl PlaySink for Catalog {
    fn canonical_song_id(&self, song_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        Ok(resolve_redirect(&conn, song_id)?)
    }

    fn merged_from(&self, song_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT from_id FROM song_redirects WHERE to_id = ?1 ORDER BY from_id")?;
        let rows = stmt.query_map([song_id], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
    }

    fn apply_play(&self, key: &BucketKey, minute: Option<u32>, at: NaiveDateTime) -> Result<BucketWrite> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // A merge may have folded the song since the caller looked it up.
        let song_id = resolve_redirect(&tx, key.song_id)?;

        let exists: bool = tx
            .query_row(
                "SELECT 1 FROM play_buckets
                 WHERE date = ?1 AND hour = ?2 AND song_id = ?3 AND station_id = ?4",
                params![key.date, key.hour, song_id, key.station_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();

        let write = if exists {
            tx.execute(
                "UPDATE play_buckets SET play_count = play_count + 1, minute = COALESCE(?5, minute)
                 WHERE date = ?1 AND hour = ?2 AND song_id = ?3 AND station_id = ?4",
                params![key.date, key.hour, song_id, key.station_id, minute],
            )?;
            BucketWrite::Incremented
        } else {
            tx.execute(
                "INSERT INTO play_buckets (date, hour, minute, song_id, station_id, play_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![key.date, key.hour, minute, song_id, key.station_id],
            )
            .map_err(|e| EngineError::from_write(e, "insert play bucket"))?;
            BucketWrite::Inserted
        };

        let touched = tx.execute(
            "UPDATE songs SET play_count = play_count + 1, last_seen_at = MAX(last_seen_at, ?2)
             WHERE id = ?1",
            params![song_id, at],
        )?;
        if touched == 0 {
            return Err(EngineError::not_found("song", song_id.to_string()));
        }
        tx.execute(
            "UPDATE artists SET last_seen_at = MAX(last_seen_at, ?2)
             WHERE id = (SELECT artist_id FROM songs WHERE id = ?1)",
            params![song_id, at],
        )?;
        tx.commit()?;
        Ok(write)
    }
}
