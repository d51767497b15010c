//! MusicBrainz implementation of the identity registry.
//!
//! Blocking client; rate limiting and retries are applied by wrapping it in
//! `RateLimitedRegistry`. Each call is bounded by the agent timeout.

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::error::ExternalError;
use crate::normalize::normalize_artist;
use crate::registry::{IdentityRegistry, RegistryArtist};
use crate::scoring::similarity;

pub const DEFAULT_BASE_URL: &str = "https://musicbrainz.org/ws/2";
pub const DEFAULT_USER_AGENT: &str = "radio-match/0.1 (https://github.com/radio-match/radio-match)";

/// Search results requested per name lookup.
const SEARCH_LIMIT: &str = "10";

#[derive(Debug, Deserialize)]
struct ArtistSearchResponse {
    #[serde(default)]
    artists: Vec<ArtistHit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtistHit {
    pub id: String,
    pub name: String,
}

pub struct MusicBrainzClient {
    agent: ureq::Agent,
    base_url: String,
}

impl MusicBrainzClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, user_agent, timeout)
    }

    pub fn with_base_url(base_url: &str, user_agent: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .user_agent(user_agent)
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        request: ureq::Request,
    ) -> Result<Option<T>, ExternalError> {
        match request.call() {
            Ok(response) => response
                .into_json::<T>()
                .map(Some)
                .map_err(|e| ExternalError::Transient(format!("reading response: {}", e))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, _)) if code == 429 || code >= 500 => {
                Err(ExternalError::Transient(format!("HTTP {}", code)))
            }
            Err(ureq::Error::Status(code, _)) => {
                Err(ExternalError::Permanent(format!("HTTP {}", code)))
            }
            Err(ureq::Error::Transport(t)) => Err(ExternalError::Transient(t.to_string())),
        }
    }
}

/// Pick the registry hit for a queried name: an exact comparison-key match
/// wins outright, otherwise the most similar name.
pub fn best_candidate(query: &str, hits: &[ArtistHit]) -> Option<RegistryArtist> {
    let query_key = normalize_artist(query).comparison_key;
    if query_key.is_empty() {
        return None;
    }

    if let Some(hit) = hits
        .iter()
        .find(|h| normalize_artist(&h.name).comparison_key == query_key)
    {
        return Some(RegistryArtist {
            id: hit.id.clone(),
            display_name: hit.name.clone(),
            similarity: 1.0,
        });
    }

    hits.iter()
        .map(|h| {
            let score = similarity(&query_key, &normalize_artist(&h.name).comparison_key);
            (h, score)
        })
        .fold(None::<(&ArtistHit, f64)>, |best, (h, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((h, score)),
        })
        .map(|(h, score)| RegistryArtist {
            id: h.id.clone(),
            display_name: h.name.clone(),
            similarity: score,
        })
}

impl IdentityRegistry for MusicBrainzClient {
    fn lookup_artist(&self, name: &str) -> Result<Option<RegistryArtist>, ExternalError> {
        let query = format!("artist:\"{}\"", name.replace('"', ""));
        let request = self
            .agent
            .get(&format!("{}/artist/", self.base_url))
            .query("query", &query)
            .query("fmt", "json")
            .query("limit", SEARCH_LIMIT);
        let Some(response) = self.get_json::<ArtistSearchResponse>(request)? else {
            return Ok(None);
        };
        debug!(name, hits = response.artists.len(), "musicbrainz artist search");
        Ok(best_candidate(name, &response.artists))
    }

    fn lookup_artist_by_id(&self, id: &str) -> Result<Option<RegistryArtist>, ExternalError> {
        let request = self
            .agent
            .get(&format!("{}/artist/{}", self.base_url, id))
            .query("fmt", "json");
        Ok(self.get_json::<ArtistHit>(request)?.map(|hit| RegistryArtist {
            id: hit.id,
            display_name: hit.name,
            similarity: 1.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, name: &str) -> ArtistHit {
        ArtistHit {
            id: id.into(),
            name: name.into(),
        }
    }

    #[test]
    fn test_exact_match_wins_over_order() {
        let hits = [hit("1", "Taylor Swift Tribute Band"), hit("2", "taylor swift")];
        let best = best_candidate("Taylor Swift", &hits).unwrap();
        assert_eq!(best.id, "2");
        assert_eq!(best.similarity, 1.0);
    }

    #[test]
    fn test_best_similarity_when_no_exact() {
        let hits = [hit("1", "Completely Different"), hit("2", "Beyonce Knowles")];
        let best = best_candidate("Beyoncé", &hits).unwrap();
        assert_eq!(best.id, "2");
        assert!(best.similarity < 1.0);
    }

    #[test]
    fn test_first_hit_kept_on_ties() {
        let hits = [hit("1", "Abc"), hit("2", "Abd")];
        assert_eq!(best_candidate("Abx", &hits).unwrap().id, "1");
    }

    #[test]
    fn test_no_hits() {
        assert!(best_candidate("Adele", &[]).is_none());
        assert!(best_candidate("", &[hit("1", "Adele")]).is_none());
    }

    #[test]
    fn test_search_response_parses() {
        let body = r#"{"created":"x","count":1,"offset":0,"artists":[{"id":"abc","name":"Adele","score":100}]}"#;
        let parsed: ArtistSearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.artists.len(), 1);
        assert_eq!(parsed.artists[0].name, "Adele");
    }
}
