//! Rate-limited PDF fetching with an on-disk cache.
//!
//! A fetch holds the per-id cache lock across the check-then-download
//! sequence, so two workers assigned the same paper never download it twice.
//! Transient errors (timeouts, 5xx, 429) are retried with exponential
//! backoff and jitter; permanent errors (4xx, non-PDF payload) fail the
//! paper immediately.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::DocumentCache;
use crate::rate_limit::{ServiceLimiters, retry_after_of};
use crate::{PaperStub, StageFailure};

/// Where the PDF came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Cached(PathBuf),
    Downloaded(PathBuf),
}

impl FetchResult {
    pub fn path(&self) -> &PathBuf {
        match self {
            FetchResult::Cached(p) | FetchResult::Downloaded(p) => p,
        }
    }
}

enum FetchError {
    Transient {
        msg: String,
        retry_after: Option<Duration>,
    },
    Permanent(String),
}

pub struct Fetcher {
    client: reqwest::Client,
    cache: Arc<DocumentCache>,
    limiters: Arc<ServiceLimiters>,
    timeout: Duration,
    max_attempts: u32,
}

impl Fetcher {
    pub fn new(
        client: reqwest::Client,
        cache: Arc<DocumentCache>,
        limiters: Arc<ServiceLimiters>,
        timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            client,
            cache,
            limiters,
            timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    /// Fetch the PDF for `stub`, from cache when possible.
    pub async fn fetch(&self, stub: &PaperStub) -> Result<FetchResult, StageFailure> {
        let lock = self.cache.lock_for(&stub.id);
        let _guard = lock.lock().await;

        if let Some(path) = self.cache.get(&stub.id) {
            tracing::debug!(id = %stub.id, "cache hit");
            return Ok(FetchResult::Cached(path));
        }

        let mut last_err = String::new();
        for attempt in 1..=self.max_attempts {
            match self.download_once(stub).await {
                Ok(bytes) => {
                    let path = self
                        .cache
                        .put(&stub.id, &bytes)
                        .map_err(|e| StageFailure::Fetch(format!("cache write: {}", e)))?;
                    tracing::debug!(id = %stub.id, bytes = bytes.len(), "downloaded");
                    return Ok(FetchResult::Downloaded(path));
                }
                Err(FetchError::Permanent(msg)) => {
                    return Err(StageFailure::Fetch(msg));
                }
                Err(FetchError::Transient { msg, retry_after }) => {
                    tracing::debug!(id = %stub.id, attempt, error = %msg, "transient fetch error");
                    last_err = msg;
                    if attempt < self.max_attempts {
                        let backoff = backoff_delay(attempt, retry_after);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(StageFailure::Fetch(format!(
            "{} attempts failed, last error: {}",
            self.max_attempts, last_err
        )))
    }

    async fn download_once(&self, stub: &PaperStub) -> Result<Vec<u8>, FetchError> {
        let limiter = self.limiters.for_pdf_url(&stub.pdf_url);
        limiter.acquire().await;

        let resp = self
            .client
            .get(&stub.pdf_url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| FetchError::Transient {
                msg: e.to_string(),
                retry_after: None,
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            limiter.on_rate_limited();
            return Err(FetchError::Transient {
                msg: "HTTP 429".into(),
                retry_after: retry_after_of(&resp),
            });
        }
        if status.is_client_error() {
            return Err(FetchError::Permanent(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Transient {
                msg: format!("HTTP {}", status),
                retry_after: None,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| FetchError::Transient {
            msg: e.to_string(),
            retry_after: None,
        })?;

        // Some hosts serve an HTML interstitial with a 200; reject anything
        // that does not start with the PDF magic.
        if !bytes.starts_with(b"%PDF") {
            return Err(FetchError::Permanent(format!(
                "response is not a PDF ({} bytes)",
                bytes.len()
            )));
        }

        Ok(bytes.to_vec())
    }
}

/// Exponential backoff with jitter: 1s, 2s, 4s, … plus up to 500ms of
/// jitter. A server-provided Retry-After wins when longer.
fn backoff_delay(attempt: u32, retry_after: Option<Duration>) -> Duration {
    let base = Duration::from_secs(1 << (attempt - 1).min(4));
    let jitter = Duration::from_millis(fastrand::u64(0..500));
    let computed = base + jitter;
    match retry_after {
        Some(ra) if ra > computed => ra,
        _ => computed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub(url: &str) -> PaperStub {
        PaperStub {
            id: "arxiv:2401.00001".into(),
            title: "A Paper".into(),
            pdf_url: url.into(),
            source: "arxiv".into(),
            published: None,
        }
    }

    fn fetcher(cache_dir: &std::path::Path, attempts: u32) -> Fetcher {
        Fetcher::new(
            reqwest::Client::new(),
            Arc::new(DocumentCache::open(cache_dir).unwrap()),
            Arc::new(ServiceLimiters::default()),
            Duration::from_secs(5),
            attempts,
        )
    }

    #[test]
    fn backoff_grows_exponentially() {
        let d1 = backoff_delay(1, None);
        let d3 = backoff_delay(3, None);
        assert!(d1 >= Duration::from_secs(1) && d1 < Duration::from_millis(1500));
        assert!(d3 >= Duration::from_secs(4) && d3 < Duration::from_millis(4500));
    }

    #[test]
    fn backoff_honors_longer_retry_after() {
        let d = backoff_delay(1, Some(Duration::from_secs(30)));
        assert_eq!(d, Duration::from_secs(30));
    }

    #[test]
    fn backoff_ignores_shorter_retry_after() {
        let d = backoff_delay(3, Some(Duration::from_secs(1)));
        assert!(d >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path(), 1);
        f.cache.put("arxiv:2401.00001", b"%PDF-1.4 cached").unwrap();

        // URL is unroutable; a network attempt would fail.
        let result = f.fetch(&stub("http://127.0.0.1:1/never")).await.unwrap();
        assert!(matches!(result, FetchResult::Cached(_)));
        assert_eq!(std::fs::read(result.path()).unwrap(), b"%PDF-1.4 cached");
    }

    #[tokio::test]
    async fn connection_failure_reports_fetch_failed() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher(dir.path(), 1);
        let err = f.fetch(&stub("http://127.0.0.1:1/nope.pdf")).await.unwrap_err();
        assert_eq!(err.stage(), "fetch_failed");
    }
}
