//! Identity resolution: raw scraped artist credit -> canonical artist.
//!
//! Lookup order: override table, local catalog (names and remembered
//! aliases), the external registry, the collaboration splitter, then the
//! word-grouping fallback. Anything that survives all of that becomes
//! PENDING, reusing the placeholder row if the name already has one.
//! Registry failures degrade to no-match; resolution failure is never an
//! error.
//!
//! The catalog lock is never held across a registry call: every catalog
//! method takes and releases it on its own.

use chrono::NaiveDateTime;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::collab::{split_collaboration, word_groupings, DEFAULT_MAX_GROUPING_TOKENS};
use crate::error::{EngineError, Result};
use crate::models::{ArtistId, CanonicalArtist, MergeReport};
use crate::normalize::{normalize_artist, NormalizedText};
use crate::overrides::{OverrideTable, OverrideTarget, SharedOverrides};
use crate::registry::IdentityRegistry;
use crate::scoring::{similarity, IDENTITY_ACCEPT_THRESHOLD, IDENTITY_WARN_THRESHOLD};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResolverSettings {
    /// Minimum similarity between the queried name and a registry hit
    pub identity_threshold: f64,
    /// Hits scoring between this and `identity_threshold` are logged as near misses
    pub warn_threshold: f64,
    pub max_grouping_tokens: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            identity_threshold: IDENTITY_ACCEPT_THRESHOLD,
            warn_threshold: IDENTITY_WARN_THRESHOLD,
            max_grouping_tokens: DEFAULT_MAX_GROUPING_TOKENS,
        }
    }
}

/// Which step produced the canonical identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    /// Id pinned by the override file
    Override,
    /// Registry id supplied by the station feed
    Station,
    /// Already resolved in the catalog, by name or alias
    Catalog,
    /// Registry hit for the whole credit
    Registry,
    /// Registry hit for one name of a collaboration split
    Collaboration,
    /// Every name of a word grouping resolved; the first one owns the play
    WordGrouping,
    /// Nothing resolved
    Pending,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub artist: CanonicalArtist,
    pub source: ResolutionSource,
    /// Rows moved off a PENDING placeholder for the same name, if one existed
    pub merge: MergeReport,
}

/// Result of re-resolving one PENDING artist.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    Resolved {
        artist: CanonicalArtist,
        source: ResolutionSource,
        merge: MergeReport,
    },
    StillPending,
}

/// Resolved identity before it is written to the catalog.
struct Candidate {
    id: ArtistId,
    display: String,
}

/// Per-call state: the override snapshot and names the registry already missed.
struct Lookup {
    overrides: Arc<OverrideTable>,
    misses: FxHashSet<String>,
}

pub struct IdentityResolver {
    catalog: Arc<Catalog>,
    registry: Arc<dyn IdentityRegistry>,
    overrides: Arc<SharedOverrides>,
    settings: ResolverSettings,
}

impl IdentityResolver {
    pub fn new(
        catalog: Arc<Catalog>,
        registry: Arc<dyn IdentityRegistry>,
        overrides: Arc<SharedOverrides>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            catalog,
            registry,
            overrides,
            settings,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn resolve(&self, raw: &str, station: Option<&str>, seen_at: NaiveDateTime) -> Result<CanonicalArtist> {
        Ok(self.resolve_with_source(raw, station, seen_at)?.artist)
    }

    /// Resolve a raw artist credit, recording the artist as seen.
    pub fn resolve_with_source(
        &self,
        raw: &str,
        station: Option<&str>,
        seen_at: NaiveDateTime,
    ) -> Result<Resolution> {
        let raw_norm = normalize_artist(raw);
        if raw_norm.is_empty() {
            return Err(EngineError::InvalidInput(format!("artist name {:?} is empty after normalization", raw)));
        }
        let mut lookup = Lookup {
            overrides: self.overrides.snapshot()?,
            misses: FxHashSet::default(),
        };

        let target = match self.apply_override(&raw_norm, &lookup)? {
            OverrideStep::Pinned(candidate) => {
                return self.adopt(candidate, &raw_norm, &raw_norm, None, station, seen_at, ResolutionSource::Override)
            }
            OverrideStep::Redirect(target) => target,
            OverrideStep::None => raw_norm.clone(),
        };

        if let Some(candidate) = self.cached(&raw_norm, &target)? {
            return self.adopt(candidate, &raw_norm, &target, None, station, seen_at, ResolutionSource::Catalog);
        }

        // A known placeholder is searched again on every sighting; a hit
        // merges it in `adopt`.
        let pending = ArtistId::pending_for(&raw_norm.comparison_key);
        match self.search(&target, &mut lookup) {
            Some((candidate, source)) => self.adopt(candidate, &raw_norm, &target, None, station, seen_at, source),
            None => {
                if let Some(artist) = self.catalog.touch_artist(&pending, seen_at)? {
                    debug!(artist = %artist.name, id = %pending, "still unresolved, reusing pending artist");
                    return Ok(Resolution {
                        artist,
                        source: ResolutionSource::Pending,
                        merge: MergeReport::default(),
                    });
                }
                info!(artist = %target.display, id = %pending, "artist unresolved, recorded as pending");
                let artist = self.catalog.upsert_artist(&pending, &target.display, station, seen_at)?;
                Ok(Resolution {
                    artist,
                    source: ResolutionSource::Pending,
                    merge: MergeReport::default(),
                })
            }
        }
    }

    /// Accept a registry id that came with the scraped play. The scraped
    /// name is only used if the id is new to the catalog.
    pub fn adopt_supplied(
        &self,
        id: &str,
        raw: &str,
        station: Option<&str>,
        seen_at: NaiveDateTime,
    ) -> Result<Resolution> {
        let raw_norm = normalize_artist(raw);
        let id = id.trim();
        if id.is_empty() || raw_norm.is_empty() {
            return Err(EngineError::InvalidInput(format!("station supplied id {:?} for {:?}", id, raw)));
        }
        let candidate = Candidate {
            id: ArtistId::Resolved(id.to_string()),
            display: raw_norm.display.clone(),
        };
        self.adopt(candidate, &raw_norm, &raw_norm, None, station, seen_at, ResolutionSource::Station)
    }

    /// Re-run resolution for a PENDING artist. On success the placeholder
    /// is merged into the resolved id.
    pub fn retry_pending(&self, artist: &CanonicalArtist) -> Result<RetryOutcome> {
        if !artist.id.is_pending() {
            return Err(EngineError::InvalidInput(format!("{} is not a pending artist", artist.id)));
        }
        let raw_norm = normalize_artist(&artist.name);
        if raw_norm.is_empty() {
            return Ok(RetryOutcome::StillPending);
        }
        let mut lookup = Lookup {
            overrides: self.overrides.snapshot()?,
            misses: FxHashSet::default(),
        };
        let seen_at = artist.last_seen_at;
        let station = artist.first_seen_station.as_deref();

        let found = match self.apply_override(&raw_norm, &lookup)? {
            OverrideStep::Pinned(candidate) => Some((candidate, raw_norm.clone(), ResolutionSource::Override)),
            step => {
                let target = match step {
                    OverrideStep::Redirect(target) => target,
                    _ => raw_norm.clone(),
                };
                match self.cached(&raw_norm, &target)? {
                    Some(candidate) => Some((candidate, target, ResolutionSource::Catalog)),
                    None => self
                        .search(&target, &mut lookup)
                        .map(|(candidate, source)| (candidate, target, source)),
                }
            }
        };

        let Some((candidate, target, source)) = found else {
            debug!(artist = %artist.name, "still pending");
            return Ok(RetryOutcome::StillPending);
        };
        let resolution = self.adopt(candidate, &raw_norm, &target, Some(&artist.id), station, seen_at, source)?;
        Ok(RetryOutcome::Resolved {
            artist: resolution.artist,
            source: resolution.source,
            merge: resolution.merge,
        })
    }

    // ========================================================================
    // Steps
    // ========================================================================

    fn apply_override(&self, raw: &NormalizedText, lookup: &Lookup) -> Result<OverrideStep> {
        match lookup.overrides.lookup(&raw.comparison_key) {
            Some(OverrideTarget::Id(id)) => {
                let resolved = ArtistId::Resolved(id.clone());
                if let Some(known) = self.catalog.get_artist(&resolved)? {
                    return Ok(OverrideStep::Pinned(Candidate {
                        id: resolved,
                        display: known.name,
                    }));
                }
                let display = match self.registry.lookup_artist_by_id(&id) {
                    Ok(Some(hit)) => hit.display_name,
                    Ok(None) => {
                        warn!(id = %id, "override id unknown to registry, using scraped name");
                        raw.display.clone()
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "registry id lookup failed, using scraped name");
                        raw.display.clone()
                    }
                };
                debug!(artist = %raw.display, id = %id, "override pins registry id");
                Ok(OverrideStep::Pinned(Candidate { id: resolved, display }))
            }
            Some(OverrideTarget::Name(name)) => {
                debug!(artist = %raw.display, target = %name, "override redirects name");
                Ok(OverrideStep::Redirect(normalize_artist(&name)))
            }
            None => Ok(OverrideStep::None),
        }
    }

    /// Already-resolved artist for the raw key or the override target key.
    fn cached(&self, raw: &NormalizedText, target: &NormalizedText) -> Result<Option<Candidate>> {
        let mut keys = vec![raw.comparison_key.as_str()];
        if target.comparison_key != raw.comparison_key {
            keys.push(target.comparison_key.as_str());
        }
        for key in keys {
            if let Some(artist) = self.catalog.find_resolved(key)? {
                return Ok(Some(Candidate {
                    id: artist.id,
                    display: artist.name,
                }));
            }
        }
        Ok(None)
    }

    /// Registry, then collaboration candidates, then word groupings.
    fn search(&self, target: &NormalizedText, lookup: &mut Lookup) -> Option<(Candidate, ResolutionSource)> {
        if let Some(hit) = self.resolve_name(&target.display, lookup) {
            return Some((hit, ResolutionSource::Registry));
        }

        let overrides = Arc::clone(&lookup.overrides);
        for grouping in split_collaboration(&target.display, &overrides) {
            for name in &grouping {
                if let Some(hit) = self.resolve_name(name, lookup) {
                    debug!(credit = %target.display, name = %name, "resolved via collaboration split");
                    return Some((hit, ResolutionSource::Collaboration));
                }
            }
        }

        for grouping in word_groupings(&target.display, self.settings.max_grouping_tokens) {
            let mut resolved = Vec::with_capacity(grouping.len());
            for name in &grouping {
                match self.resolve_name(name, lookup) {
                    Some(hit) => resolved.push(hit),
                    None => break,
                }
            }
            if resolved.len() == grouping.len() && !resolved.is_empty() {
                debug!(credit = %target.display, grouping = ?grouping, "resolved via word grouping");
                return Some((resolved.swap_remove(0), ResolutionSource::WordGrouping));
            }
        }
        None
    }

    /// One name against the catalog and then the registry. Registry
    /// errors count as no-match.
    fn resolve_name(&self, name: &str, lookup: &mut Lookup) -> Option<Candidate> {
        let norm = normalize_artist(name);
        let key = norm.comparison_key;
        if key.is_empty() || lookup.misses.contains(&key) {
            return None;
        }

        match self.catalog.find_resolved(&key) {
            Ok(Some(artist)) => {
                return Some(Candidate {
                    id: artist.id,
                    display: artist.name,
                })
            }
            Ok(None) => {}
            Err(e) => warn!(name, error = %e, "catalog lookup failed"),
        }

        let hit = match self.registry.lookup_artist(&norm.display) {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                debug!(name, "registry has no candidate");
                lookup.misses.insert(key);
                return None;
            }
            Err(e) => {
                warn!(name, error = %e, "registry lookup failed, treating as no match");
                lookup.misses.insert(key);
                return None;
            }
        };

        let hit_key = normalize_artist(&hit.display_name).comparison_key;
        let score = if hit_key == key { 1.0 } else { similarity(&key, &hit_key) };
        if score >= self.settings.identity_threshold {
            debug!(name, id = %hit.id, registry_name = %hit.display_name, score, "registry match accepted");
            return Some(Candidate {
                id: ArtistId::Resolved(hit.id),
                display: hit.display_name,
            });
        }
        if score >= self.settings.warn_threshold {
            warn!(name, registry_name = %hit.display_name, score, "registry near miss rejected");
        } else {
            debug!(name, registry_name = %hit.display_name, score, "registry match rejected");
        }
        lookup.misses.insert(key);
        None
    }

    /// Write a resolved identity: upsert the artist, remember the raw and
    /// target keys as aliases, and merge a placeholder for the raw key if
    /// one exists.
    #[allow(clippy::too_many_arguments)]
    fn adopt(
        &self,
        candidate: Candidate,
        raw: &NormalizedText,
        target: &NormalizedText,
        pending: Option<&ArtistId>,
        station: Option<&str>,
        seen_at: NaiveDateTime,
        source: ResolutionSource,
    ) -> Result<Resolution> {
        let artist = self
            .catalog
            .upsert_artist(&candidate.id, &candidate.display, station, seen_at)?;
        self.catalog.remember_alias(&raw.comparison_key, &artist.id)?;
        if target.comparison_key != raw.comparison_key {
            self.catalog.remember_alias(&target.comparison_key, &artist.id)?;
        }

        let placeholder = pending
            .cloned()
            .unwrap_or_else(|| ArtistId::pending_for(&raw.comparison_key));
        let mut merge = MergeReport::default();
        if self.catalog.get_artist(&placeholder)?.is_some() {
            merge = match self.catalog.merge_pending(&placeholder, &artist.id, &artist.name) {
                Ok(report) => report,
                // A concurrent resolve merged it first.
                Err(EngineError::NotFound { .. }) => MergeReport::default(),
                Err(e) => return Err(e),
            };
        }

        let artist = self
            .catalog
            .get_artist(&artist.id)?
            .ok_or_else(|| EngineError::not_found("artist", artist.id.storage_key()))?;
        Ok(Resolution { artist, source, merge })
    }
}

enum OverrideStep {
    Pinned(Candidate),
    Redirect(NormalizedText),
    None,
}
