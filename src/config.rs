//! Engine configuration, read from a TOML file.
//!
//! Every section and field is optional; missing values take the defaults
//! below.
//!
//! ```toml
//! [dedup]
//! window_minutes = 20
//!
//! [resolver]
//! identity_threshold = 0.80
//! max_grouping_tokens = 5
//! registry_min_interval_ms = 1000
//! overrides_path = "artist_overrides.json"
//!
//! [matcher]
//! fuzzy_threshold = 0.90
//!
//! [catalog]
//! path = "radio-match.db"
//! pending_max_age_days = 30
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::collab::DEFAULT_MAX_GROUPING_TOKENS;
use crate::dedup::DEFAULT_WINDOW_MINUTES;
use crate::error::{EngineError, Result};
use crate::matcher::MatcherSettings;
use crate::musicbrainz::DEFAULT_USER_AGENT;
use crate::registry::RetryPolicy;
use crate::resolver::ResolverSettings;
use crate::scoring::{
    FUZZY_ACCEPT_THRESHOLD, IDENTITY_ACCEPT_THRESHOLD, IDENTITY_WARN_THRESHOLD, PARTIAL_ARTIST_THRESHOLD,
    TITLE_WEIGHT,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dedup: DedupConfig,
    pub resolver: ResolverConfig,
    pub matcher: MatcherConfig,
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub window_minutes: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_minutes: DEFAULT_WINDOW_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub identity_threshold: f64,
    pub identity_warn_threshold: f64,
    pub max_grouping_tokens: usize,
    /// One registry request per this many milliseconds, process-wide
    pub registry_min_interval_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub registry_url: Option<String>,
    pub overrides_path: Option<PathBuf>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            identity_threshold: IDENTITY_ACCEPT_THRESHOLD,
            identity_warn_threshold: IDENTITY_WARN_THRESHOLD,
            max_grouping_tokens: DEFAULT_MAX_GROUPING_TOKENS,
            registry_min_interval_ms: 1000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            request_timeout_secs: 15,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            registry_url: None,
            overrides_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub fuzzy_threshold: f64,
    pub partial_artist_threshold: f64,
    pub title_weight: f64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: FUZZY_ACCEPT_THRESHOLD,
            partial_artist_threshold: PARTIAL_ARTIST_THRESHOLD,
            title_weight: TITLE_WEIGHT,
            retry_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: PathBuf,
    pub pending_max_age_days: i64,
    /// How far back to seed the dedup last-seen map on startup
    pub warm_start_hours: i64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("radio-match.db"),
            pending_max_age_days: 30,
            warm_start_hours: 2,
        }
    }
}

/// Upper bounds that keep the derived chrono durations far from overflow.
const MAX_WINDOW_MINUTES: i64 = 24 * 60;
const MAX_PENDING_AGE_DAYS: i64 = 100 * 365;
const MAX_WARM_START_HOURS: i64 = 7 * 24;

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<()> {
    if value < min || value > max {
        return Err(EngineError::Config(format!(
            "{} must be between {} and {}, got {}",
            name, min, max, value
        )));
    }
    Ok(())
}

fn check_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(EngineError::Config(format!("{} must be between 0 and 1, got {}", name, value)));
    }
    Ok(())
}

impl EngineConfig {
    /// Parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::parse(&text).map_err(|e| match e {
            EngineError::Config(msg) => EngineError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_range("dedup.window_minutes", self.dedup.window_minutes, 1, MAX_WINDOW_MINUTES)?;
        check_unit("resolver.identity_threshold", self.resolver.identity_threshold)?;
        check_unit("resolver.identity_warn_threshold", self.resolver.identity_warn_threshold)?;
        if self.resolver.identity_warn_threshold > self.resolver.identity_threshold {
            return Err(EngineError::Config(
                "resolver.identity_warn_threshold must not exceed identity_threshold".into(),
            ));
        }
        if self.resolver.registry_min_interval_ms == 0 {
            return Err(EngineError::Config("resolver.registry_min_interval_ms must be non-zero".into()));
        }
        if self.resolver.request_timeout_secs == 0 {
            return Err(EngineError::Config("resolver.request_timeout_secs must be non-zero".into()));
        }
        if self.resolver.user_agent.trim().is_empty() {
            return Err(EngineError::Config("resolver.user_agent must not be empty".into()));
        }
        check_unit("matcher.fuzzy_threshold", self.matcher.fuzzy_threshold)?;
        check_unit("matcher.partial_artist_threshold", self.matcher.partial_artist_threshold)?;
        check_unit("matcher.title_weight", self.matcher.title_weight)?;
        check_range(
            "catalog.pending_max_age_days",
            self.catalog.pending_max_age_days,
            1,
            MAX_PENDING_AGE_DAYS,
        )?;
        check_range("catalog.warm_start_hours", self.catalog.warm_start_hours, 0, MAX_WARM_START_HOURS)?;
        Ok(())
    }

    // ========================================================================
    // Component settings
    // ========================================================================

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.dedup.window_minutes)
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            identity_threshold: self.resolver.identity_threshold,
            warn_threshold: self.resolver.identity_warn_threshold,
            max_grouping_tokens: self.resolver.max_grouping_tokens,
        }
    }

    pub fn registry_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.resolver.retry_attempts,
            base_delay: Duration::from_millis(self.resolver.retry_backoff_ms),
        }
    }

    pub fn registry_min_interval(&self) -> Duration {
        Duration::from_millis(self.resolver.registry_min_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.resolver.request_timeout_secs)
    }

    pub fn matcher_settings(&self) -> MatcherSettings {
        MatcherSettings {
            fuzzy_threshold: self.matcher.fuzzy_threshold,
            partial_artist_threshold: self.matcher.partial_artist_threshold,
            title_weight: self.matcher.title_weight,
            retry: RetryPolicy {
                max_attempts: self.matcher.retry_attempts,
                base_delay: Duration::from_millis(self.matcher.retry_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = EngineConfig::parse("").unwrap();
        assert_eq!(config.dedup.window_minutes, 20);
        assert_eq!(config.resolver.identity_threshold, 0.80);
        assert_eq!(config.matcher.fuzzy_threshold, 0.90);
        assert_eq!(config.catalog.pending_max_age_days, 30);
        assert_eq!(config.resolver.max_grouping_tokens, 5);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::parse(
            r#"
            [dedup]
            window_minutes = 15

            [matcher]
            fuzzy_threshold = 0.85
            "#,
        )
        .unwrap();
        assert_eq!(config.dedup_window(), chrono::Duration::minutes(15));
        assert_eq!(config.matcher_settings().fuzzy_threshold, 0.85);
        assert_eq!(config.matcher.title_weight, 0.60);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(EngineConfig::parse("[matcher]\nfuzzy_threshold = 1.5").is_err());
        assert!(EngineConfig::parse("[dedup]\nwindow_minutes = 0").is_err());
        assert!(EngineConfig::parse("[resolver]\nregistry_min_interval_ms = 0").is_err());
        assert!(matches!(
            EngineConfig::parse("[resolver]\nidentity_warn_threshold = 0.95"),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_huge_durations_rejected() {
        assert!(EngineConfig::parse("[dedup]\nwindow_minutes = 9223372036854775807").is_err());
        assert!(EngineConfig::parse("[catalog]\npending_max_age_days = 9223372036854775807").is_err());
        assert!(EngineConfig::parse("[catalog]\nwarm_start_hours = 9223372036854775807").is_err());
        assert!(EngineConfig::parse("[catalog]\nwarm_start_hours = -1").is_err());
        let config = EngineConfig::parse("[dedup]\nwindow_minutes = 1440\n[catalog]\npending_max_age_days = 36500").unwrap();
        assert_eq!(config.dedup_window(), chrono::Duration::days(1));
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        assert!(matches!(EngineConfig::parse("[dedup"), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("radio-match.toml");
        std::fs::write(&path, "[catalog]\npath = \"plays.db\"\npending_max_age_days = 7\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.catalog.path, PathBuf::from("plays.db"));
        assert_eq!(config.catalog.pending_max_age_days, 7);
        assert!(EngineConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
