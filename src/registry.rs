//! Identity registry contract, process-wide rate limiting and retry.
//!
//! Every registry call in the process goes through one `RegistryGate`
//! (a token bucket), so concurrent resolvers queue on the shared budget
//! instead of each sleeping on their own.

use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, ExternalError, Result};

// ============================================================================
// Contract
// ============================================================================

/// Best registry candidate for a name lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct RegistryArtist {
    pub id: String,
    pub display_name: String,
    /// Similarity of `display_name` to the queried name as scored by the registry client
    pub similarity: f64,
}

/// External music-identity registry (MusicBrainz in production).
pub trait IdentityRegistry: Send + Sync {
    /// Best candidate for a name, `Ok(None)` when the registry has nothing.
    fn lookup_artist(&self, name: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError>;

    /// Details for a known registry id, `Ok(None)` when the id does not exist.
    fn lookup_artist_by_id(&self, id: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError>;
}

impl<T: IdentityRegistry + ?Sized> IdentityRegistry for Arc<T> {
    fn lookup_artist(&self, name: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
        (**self).lookup_artist(name)
    }

    fn lookup_artist_by_id(&self, id: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
        (**self).lookup_artist_by_id(id)
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Bounded exponential backoff for transient collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base, 2x base, 4x base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

/// Run `op`, retrying transient failures per `policy`. Permanent failures
/// and the last transient failure are returned to the caller.
pub fn retry_transient<T>(
    policy: RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> std::result::Result<T, ExternalError>,
) -> std::result::Result<T, ExternalError> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(%what, attempt, error = %e, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// Rate Limiting
// ============================================================================

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Shared token bucket: one permit per `min_interval`, no burst.
#[derive(Clone)]
pub struct RegistryGate {
    limiter: Arc<DirectLimiter>,
    clock: DefaultClock,
}

impl RegistryGate {
    pub fn new(min_interval: Duration) -> Result<Self> {
        let quota = Quota::with_period(min_interval).ok_or_else(|| {
            EngineError::Config("registry rate limit interval must be non-zero".to_string())
        })?;
        Ok(Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            clock: DefaultClock::default(),
        })
    }

    /// Block until the shared bucket grants a permit.
    pub fn acquire(&self) {
        while let Err(not_until) = self.limiter.check() {
            let wait = not_until.wait_time_from(self.clock.now());
            debug!(wait_ms = wait.as_millis() as u64, "waiting for registry rate limit");
            thread::sleep(wait);
        }
    }
}

/// Registry wrapper that applies the shared rate limit and retry policy to every call.
pub struct RateLimitedRegistry<R> {
    inner: R,
    gate: RegistryGate,
    retry: RetryPolicy,
}

impl<R: IdentityRegistry> RateLimitedRegistry<R> {
    pub fn new(inner: R, gate: RegistryGate, retry: RetryPolicy) -> Self {
        Self { inner, gate, retry }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: IdentityRegistry> IdentityRegistry for RateLimitedRegistry<R> {
    fn lookup_artist(&self, name: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
        retry_transient(self.retry, "registry lookup", || {
            self.gate.acquire();
            self.inner.lookup_artist(name)
        })
    }

    fn lookup_artist_by_id(&self, id: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
        retry_transient(self.retry, "registry id lookup", || {
            self.gate.acquire();
            self.inner.lookup_artist_by_id(id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl IdentityRegistry for Flaky {
        fn lookup_artist(&self, name: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ExternalError::Transient("timeout".into()));
            }
            Ok(Some(RegistryArtist {
                id: "id-1".into(),
                display_name: name.to_string(),
                similarity: 1.0,
            }))
        }

        fn lookup_artist_by_id(&self, _id: &str) -> std::result::Result<Option<RegistryArtist>, ExternalError> {
            Err(ExternalError::Permanent("bad id".into()))
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    fn flaky(failures: u32) -> Flaky {
        Flaky {
            failures_left: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_transient_failures_retried() {
        let gate = RegistryGate::new(Duration::from_millis(1)).unwrap();
        let registry = RateLimitedRegistry::new(flaky(2), gate, fast_retry(3));
        let hit = registry.lookup_artist("Adele").unwrap();
        assert_eq!(hit.unwrap().display_name, "Adele");
        assert_eq!(registry.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retries_exhausted_returns_error() {
        let gate = RegistryGate::new(Duration::from_millis(1)).unwrap();
        let registry = RateLimitedRegistry::new(flaky(5), gate, fast_retry(3));
        assert!(registry.lookup_artist("Adele").unwrap_err().is_transient());
        assert_eq!(registry.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let gate = RegistryGate::new(Duration::from_millis(1)).unwrap();
        let registry = RateLimitedRegistry::new(flaky(0), gate, fast_retry(3));
        assert!(!registry.lookup_artist_by_id("x").unwrap_err().is_transient());
    }

    #[test]
    fn test_gate_is_shared_across_threads() {
        let gate = RegistryGate::new(Duration::from_millis(50)).unwrap();
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || gate.acquire())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // First permit is immediate, the other three wait 50ms each in turn
        assert!(start.elapsed() >= Duration::from_millis(140));
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(RegistryGate::new(Duration::ZERO).is_err());
    }
}
