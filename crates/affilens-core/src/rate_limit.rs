//! Per-service rate limiting with adaptive governor instances.
//!
//! Every outbound request (search APIs, PDF hosts) waits for its service's
//! governor permit via `until_ready()`, which spaces requests at the
//! configured rate. On 429, the governor is slowed and restored after a
//! quiet period.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Per-service rate limiter with adaptive rate adjustment via ArcSwap.
///
/// When a 429 is received, the governor is atomically swapped to a slower
/// rate. After a cooldown period (60s) with no 429s, the original rate is
/// restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    /// Base period between allowed requests.
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    /// Timestamp of the last 429 response.
    last_429: std::sync::Mutex<Option<Instant>>,
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given period between requests.
    pub fn new(period: Duration) -> Self {
        let quota = Quota::with_period(period).expect("period must be > 0");
        let limiter = Arc::new(DirectLimiter::direct(quota));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms))
    }

    /// Wait until the rate limiter allows a request.
    ///
    /// Blocks the calling future until a token is available. This naturally
    /// spaces requests at the configured rate across all concurrent callers.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor and swaps
    /// the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        // Double factor, cap at 16x slowdown
        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            let new_limiter = Arc::new(DirectLimiter::direct(quota));
            self.limiter.store(new_limiter);
        }
    }

    /// If 60s have passed since the last 429, restore the original rate.
    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            let quota = Quota::with_period(self.base_period).expect("base period valid");
            let limiter = Arc::new(DirectLimiter::direct(quota));
            self.limiter.store(limiter);
        }
    }
}

/// Collection of per-service rate limiters.
pub struct ServiceLimiters {
    limiters: HashMap<&'static str, AdaptiveLimiter>,
}

impl Default for ServiceLimiters {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl ServiceLimiters {
    /// Build limiters based on whether API keys/mailto are configured.
    pub fn new(has_s2_api_key: bool, has_openalex_mailto: bool) -> Self {
        let mut limiters = HashMap::new();

        // arXiv asks for no more than 1 request per 3 seconds on the export
        // API; the same budget covers PDF downloads.
        limiters.insert("arxiv", AdaptiveLimiter::new(Duration::from_secs(3)));

        // OpenAlex: 10/s in the polite pool (mailto set), conservative 2/s
        // otherwise.
        let openalex_rate = if has_openalex_mailto { 10 } else { 2 };
        limiters.insert("openalex", AdaptiveLimiter::per_second(openalex_rate));

        // Semantic Scholar: keyed 1/s (basic tier), keyless ~1 per 3s.
        if has_s2_api_key {
            limiters.insert("semantic_scholar", AdaptiveLimiter::per_second(1));
        } else {
            limiters.insert(
                "semantic_scholar",
                AdaptiveLimiter::new(Duration::from_secs(3)),
            );
        }

        // Generic PDF hosts outside the known services: light 2/s governor
        // so adaptive backoff still kicks in on 429.
        limiters.insert("pdf", AdaptiveLimiter::per_second(2));

        // Chat completions: spaces the shared LLM budget so a burst from
        // many workers does not trip provider limits.
        limiters.insert("llm", AdaptiveLimiter::per_second(5));

        Self { limiters }
    }

    /// Get the rate limiter for a service, if one exists.
    pub fn get(&self, service: &str) -> Option<&AdaptiveLimiter> {
        self.limiters.get(service)
    }

    /// Limiter for a PDF download from `url`: the owning service's limiter
    /// when the host is recognized, the generic PDF limiter otherwise.
    pub fn for_pdf_url(&self, url: &str) -> &AdaptiveLimiter {
        let service = if url.contains("arxiv.org") {
            "arxiv"
        } else if url.contains("openalex.org") {
            "openalex"
        } else if url.contains("semanticscholar.org") {
            "semantic_scholar"
        } else {
            "pdf"
        };
        self.limiters
            .get(service)
            .or_else(|| self.limiters.get("pdf"))
            .expect("pdf limiter always present")
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: use a conservative fallback rather than parsing it.
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Extract Retry-After from a 429 response.
pub fn retry_after_of(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_retry_after ──────────────────────────────────────────────

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_http_date_gmt() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("xyz"), None);
    }

    // ── AdaptiveLimiter ────────────────────────────────────────────────

    #[test]
    fn starts_at_factor_1() {
        let limiter = AdaptiveLimiter::per_second(10);
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn on_rate_limited_doubles() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 2);
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn factor_caps_at_16() {
        let limiter = AdaptiveLimiter::per_second(10);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 16);
    }

    #[tokio::test]
    async fn acquire_completes() {
        // With a generous rate (10/s), the first acquire should return instantly.
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn concurrent_acquires_never_exceed_the_configured_rate() {
        use std::sync::Arc;

        let limiter = Arc::new(AdaptiveLimiter::new(Duration::from_millis(100)));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let lim = limiter.clone();
            handles.push(tokio::spawn(async move {
                lim.acquire().await;
                start.elapsed()
            }));
        }
        let mut elapsed = Vec::new();
        for handle in handles {
            elapsed.push(handle.await.unwrap());
        }
        elapsed.sort();

        // One immediate permit, then one per period: the second permit
        // cannot land before one period has elapsed, the third before two.
        // Lower bounds only, so load on the test host cannot flake this.
        assert!(
            elapsed[1] >= Duration::from_millis(80),
            "second permit too early: {:?}",
            elapsed
        );
        assert!(
            elapsed[2] >= Duration::from_millis(180),
            "third permit too early: {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn decay_restores_after_60s() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 4);

        // Manually backdate last_429 to 61 seconds ago
        {
            let mut last = limiter.last_429.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }

        // acquire() calls try_decay() internally
        limiter.acquire().await;
        assert_eq!(limiter.current_factor.load(Ordering::SeqCst), 1);
    }

    // ── ServiceLimiters ────────────────────────────────────────────────

    #[test]
    fn default_has_expected_services() {
        let limiters = ServiceLimiters::default();
        for name in ["arxiv", "openalex", "semantic_scholar", "pdf", "llm"] {
            assert!(limiters.get(name).is_some(), "missing limiter for {name}");
        }
    }

    #[test]
    fn openalex_rate_varies_with_mailto() {
        let without = ServiceLimiters::new(false, false);
        let period_without = without.get("openalex").unwrap().base_period;

        let with = ServiceLimiters::new(false, true);
        let period_with = with.get("openalex").unwrap().base_period;

        assert!(
            period_with < period_without,
            "with mailto should have a shorter period (faster rate)"
        );
    }

    #[test]
    fn pdf_url_routing() {
        let limiters = ServiceLimiters::default();
        let arxiv = limiters.for_pdf_url("https://arxiv.org/pdf/2401.12345");
        assert_eq!(arxiv.base_period, Duration::from_secs(3));
        let other = limiters.for_pdf_url("https://example.com/paper.pdf");
        assert_eq!(other.base_period, Duration::from_millis(500));
    }

    #[test]
    fn unknown_service_returns_none() {
        let limiters = ServiceLimiters::default();
        assert!(limiters.get("crossref").is_none());
    }
}
