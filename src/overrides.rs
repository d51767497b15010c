//! User-supplied artist mapping overrides.
//!
//! File format (JSON):
//!
//! ```json
//! {
//!   "mappings": { "brooks dunn": "Brooks & Dunn" },
//!   "ids": { "pink": "f4d5cc07-3bc9-4836-9b15-88a08359bc63" }
//! }
//! ```
//!
//! Keys are matched on the artist comparison key, so lookups are
//! case-insensitive and apostrophe-insensitive. A malformed file is logged
//! and treated as empty; discovery keeps running.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::normalize::normalize_artist;

#[derive(Debug, Default, Deserialize)]
struct OverrideFile {
    #[serde(default)]
    mappings: FxHashMap<String, String>,
    #[serde(default)]
    ids: FxHashMap<String, String>,
}

/// Where an override sends a raw artist name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverrideTarget {
    /// Resolve this display name instead of the raw string
    Name(String),
    /// Use this registry id directly
    Id(String),
}

/// Immutable override table keyed by artist comparison key.
#[derive(Debug, Default, Clone)]
pub struct OverrideTable {
    names: FxHashMap<String, String>,
    ids: FxHashMap<String, String>,
    /// Comparison keys of every source and target name, for the splitter
    protected: FxHashSet<String>,
}

impl OverrideTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut table = Self::default();
        for (raw, target) in pairs {
            table.insert_name(raw, target);
        }
        table
    }

    fn insert_name(&mut self, raw: &str, target: &str) {
        let key = normalize_artist(raw).comparison_key;
        let target = target.trim();
        if key.is_empty() || target.is_empty() {
            return;
        }
        self.protected.insert(key.clone());
        self.protected.insert(normalize_artist(target).comparison_key);
        self.names.insert(key, target.to_string());
    }

    fn insert_id(&mut self, raw: &str, id: &str) {
        let key = normalize_artist(raw).comparison_key;
        let id = id.trim();
        if key.is_empty() || id.is_empty() {
            return;
        }
        self.protected.insert(key.clone());
        self.ids.insert(key, id.to_string());
    }

    pub fn parse(json: &str) -> Result<Self> {
        let file: OverrideFile = serde_json::from_str(json)?;
        let mut table = Self::default();
        for (raw, target) in &file.mappings {
            table.insert_name(raw, target);
        }
        for (raw, id) in &file.ids {
            table.insert_id(raw, id);
        }
        Ok(table)
    }

    pub fn try_load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load the override file. Missing or malformed files yield an empty table.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            info!(path = %path.display(), "no override file, starting with empty overrides");
            return Self::empty();
        }
        match Self::try_load(path) {
            Ok(table) => {
                info!(path = %path.display(), names = table.names.len(), ids = table.ids.len(), "loaded artist overrides");
                table
            }
            Err(e) => {
                warn!(error = %e, "override file unusable, continuing with empty overrides");
                Self::empty()
            }
        }
    }

    /// Override for an artist comparison key. Id overrides win over name overrides.
    pub fn lookup(&self, comparison_key: &str) -> Option<OverrideTarget> {
        if let Some(id) = self.ids.get(comparison_key) {
            return Some(OverrideTarget::Id(id.clone()));
        }
        self.names
            .get(comparison_key)
            .map(|name| OverrideTarget::Name(name.clone()))
    }

    /// True when the key names a known act that must not be split on `&`, `x` or `,`.
    pub fn is_protected(&self, comparison_key: &str) -> bool {
        self.protected.contains(comparison_key)
    }

    pub fn len(&self) -> usize {
        self.names.len() + self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide override table with an explicit, lock-guarded reload.
/// Readers take a cheap snapshot and never touch the disk.
pub struct SharedOverrides {
    path: Option<PathBuf>,
    table: RwLock<Arc<OverrideTable>>,
}

impl SharedOverrides {
    pub fn new(table: OverrideTable) -> Self {
        Self {
            path: None,
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let table = OverrideTable::load(&path);
        Self {
            path: Some(path),
            table: RwLock::new(Arc::new(table)),
        }
    }

    pub fn snapshot(&self) -> Result<Arc<OverrideTable>> {
        self.table
            .read()
            .map(|t| Arc::clone(&t))
            .map_err(|_| EngineError::LockPoisoned("overrides"))
    }

    /// Re-read the file. A bad file leaves the current table in place.
    pub fn reload(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(self.snapshot()?.len());
        };
        let fresh = match OverrideTable::try_load(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "override reload failed, keeping previous table");
                return Ok(self.snapshot()?.len());
            }
        };
        let count = fresh.len();
        let mut guard = self
            .table
            .write()
            .map_err(|_| EngineError::LockPoisoned("overrides"))?;
        *guard = Arc::new(fresh);
        info!(count, "reloaded artist overrides");
        Ok(count)
    }
}
