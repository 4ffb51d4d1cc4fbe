//! Paper search sources.
//!
//! Each source turns a free-text query into a list of [`PaperStub`]s with a
//! direct PDF link. Sources are queried in configured priority order until
//! enough papers are collected; a failing source logs and yields to the next
//! one rather than aborting the run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::rate_limit::{ServiceLimiters, retry_after_of};
use crate::{Config, PaperStub};

pub mod arxiv;
pub mod mock;
pub mod openalex;
pub mod semantic_scholar;

pub use arxiv::Arxiv;
pub use openalex::OpenAlex;
pub use semantic_scholar::SemanticScholar;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A search request: free text, a cap on returned stubs, and an optional
/// publication date window (`YYYY-MM-DD`, either bound may be open).
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub limit: usize,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl SearchQuery {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            date_from: None,
            date_to: None,
        }
    }
}

#[async_trait]
pub trait PaperSource: Send + Sync {
    /// Stable service name, also the rate limiter key.
    fn name(&self) -> &'static str;

    async fn search(
        &self,
        query: &SearchQuery,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<PaperStub>, SourceError>;
}

/// Map a non-success response to a [`SourceError`], extracting Retry-After
/// on 429.
pub(crate) fn check_status(resp: &reqwest::Response) -> Result<(), SourceError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        return Err(SourceError::RateLimited {
            retry_after: retry_after_of(resp),
        });
    }
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    Ok(())
}

/// Build the configured sources in priority order. Unknown names are
/// logged and skipped; an empty config falls back to arXiv.
pub fn build_sources(config: &Config) -> Vec<Arc<dyn PaperSource>> {
    let mut sources: Vec<Arc<dyn PaperSource>> = Vec::new();
    let fallback = ["arxiv".to_string()];
    let names: &[String] = if config.sources.is_empty() {
        &fallback
    } else {
        &config.sources
    };
    for name in names {
        match name.as_str() {
            "arxiv" => sources.push(Arc::new(Arxiv)),
            "openalex" => sources.push(Arc::new(OpenAlex::new(config.openalex_mailto.clone()))),
            "semantic_scholar" => {
                sources.push(Arc::new(SemanticScholar::new(config.s2_api_key.clone())))
            }
            other => tracing::warn!(source = other, "unknown search source, skipping"),
        }
    }
    sources
}

/// Search one source with proactive governor rate limiting.
///
/// 1. Acquires the service's governor (waits if needed)
/// 2. Calls `source.search()`
/// 3. On 429: adapts the governor, honors Retry-After (capped at the
///    timeout), and retries once
pub async fn search_with_rate_limit(
    source: &dyn PaperSource,
    query: &SearchQuery,
    client: &reqwest::Client,
    timeout: Duration,
    limiters: &ServiceLimiters,
) -> Result<Vec<PaperStub>, SourceError> {
    let limiter = limiters.get(source.name());

    if let Some(lim) = limiter {
        lim.acquire().await;
    }

    match source.search(query, client, timeout).await {
        Err(SourceError::RateLimited { retry_after }) => {
            if let Some(lim) = limiter {
                lim.on_rate_limited();
            }

            let wait = retry_after.unwrap_or(Duration::from_secs(2)).min(timeout);
            tracing::info!(
                source = source.name(),
                wait_secs = wait.as_secs_f64(),
                "429 rate limited, waiting then retrying"
            );
            tokio::time::sleep(wait).await;

            if let Some(lim) = limiter {
                lim.acquire().await;
            }

            // Single retry; a second 429 is surfaced to the caller.
            source.search(query, client, timeout).await
        }
        other => other,
    }
}

/// Query sources in order until `limit` stubs are collected, deduplicating
/// by id. A failing source is logged and the next one is tried; the search
/// as a whole errors only when every source fails.
pub async fn search_all(
    sources: &[Arc<dyn PaperSource>],
    query: &SearchQuery,
    client: &reqwest::Client,
    timeout: Duration,
    limiters: &ServiceLimiters,
) -> Result<Vec<PaperStub>, SourceError> {
    let mut collected: Vec<PaperStub> = Vec::new();
    let mut any_succeeded = false;
    let mut last_err = None;

    for source in sources {
        if collected.len() >= query.limit {
            break;
        }
        let mut remaining = query.clone();
        remaining.limit = query.limit - collected.len();
        match search_with_rate_limit(source.as_ref(), &remaining, client, timeout, limiters).await
        {
            Ok(stubs) => {
                any_succeeded = true;
                for stub in stubs {
                    if collected.len() >= query.limit {
                        break;
                    }
                    if !collected.iter().any(|s| s.id == stub.id) {
                        collected.push(stub);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(source = source.name(), error = %e, "search failed, trying next source");
                last_err = Some(e);
            }
        }
    }

    if !any_succeeded
        && let Some(e) = last_err
    {
        return Err(e);
    }
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::mock::{MockSource, SourceReply};
    use super::*;

    fn stub(id: &str) -> PaperStub {
        PaperStub {
            id: id.into(),
            title: format!("Paper {id}"),
            pdf_url: format!("https://example.com/{id}.pdf"),
            source: "mock".into(),
            published: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_retries_once() {
        let source = MockSource::with_sequence(
            "arxiv",
            vec![
                SourceReply::RateLimited {
                    retry_after: Some(Duration::from_secs(1)),
                },
                SourceReply::Found(vec![stub("a")]),
            ],
        );
        let client = reqwest::Client::new();
        let limiters = ServiceLimiters::default();
        let query = SearchQuery::new("transformers", 5);

        let stubs =
            search_with_rate_limit(&source, &query, &client, Duration::from_secs(10), &limiters)
                .await
                .unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_error_no_retry() {
        let source = MockSource::new("arxiv", SourceReply::Error("connection refused".into()));
        let client = reqwest::Client::new();
        let limiters = ServiceLimiters::default();
        let query = SearchQuery::new("q", 5);

        let result =
            search_with_rate_limit(&source, &query, &client, Duration::from_secs(10), &limiters)
                .await;
        assert!(result.is_err());
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn search_all_falls_through_on_failure() {
        let bad: Arc<dyn PaperSource> = Arc::new(MockSource::new(
            "arxiv",
            SourceReply::Error("down".into()),
        ));
        let good: Arc<dyn PaperSource> = Arc::new(MockSource::new(
            "openalex",
            SourceReply::Found(vec![stub("a"), stub("b")]),
        ));
        let client = reqwest::Client::new();
        let limiters = ServiceLimiters::default();
        let query = SearchQuery::new("q", 2);

        let stubs = search_all(
            &[bad, good],
            &query,
            &client,
            Duration::from_secs(10),
            &limiters,
        )
        .await
        .unwrap();
        assert_eq!(stubs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn search_all_errors_when_every_source_fails() {
        let a: Arc<dyn PaperSource> =
            Arc::new(MockSource::new("arxiv", SourceReply::Error("down".into())));
        let b: Arc<dyn PaperSource> = Arc::new(MockSource::new(
            "openalex",
            SourceReply::Error("also down".into()),
        ));
        let client = reqwest::Client::new();
        let limiters = ServiceLimiters::default();
        let query = SearchQuery::new("q", 2);

        let result = search_all(&[a, b], &query, &client, Duration::from_secs(10), &limiters).await;
        assert!(matches!(result, Err(SourceError::Malformed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn search_all_dedups_and_caps() {
        let first: Arc<dyn PaperSource> = Arc::new(MockSource::new(
            "arxiv",
            SourceReply::Found(vec![stub("a"), stub("b")]),
        ));
        let second: Arc<dyn PaperSource> = Arc::new(MockSource::new(
            "openalex",
            SourceReply::Found(vec![stub("b"), stub("c"), stub("d")]),
        ));
        let client = reqwest::Client::new();
        let limiters = ServiceLimiters::default();
        let query = SearchQuery::new("q", 3);

        let stubs = search_all(
            &[first, second],
            &query,
            &client,
            Duration::from_secs(10),
            &limiters,
        )
        .await
        .unwrap();
        let ids: Vec<_> = stubs.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
