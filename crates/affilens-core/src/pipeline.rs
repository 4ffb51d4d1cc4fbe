//! Worker pool carrying each paper through fetch, parse, extract, normalize.
//!
//! One job per paper, fanned out over `num_workers` worker tasks via an
//! async channel. A stage failure terminates only that paper; the outcome is
//! reported on the job's oneshot channel either way. Cancellation drops
//! queued jobs and abandons in-flight ones at the next await; completed
//! results are kept.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::DocumentCache;
use crate::extract::Extractor;
use crate::fetch::{FetchResult, Fetcher};
use crate::kb::KnowledgeBase;
use crate::normalize::Normalizer;
use crate::source::{SearchQuery, build_sources, search_all};
use crate::{
    Config, CoreError, PaperOutcome, PaperStub, ProcessedPaper, ProgressEvent, StageFailure,
};

type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A paper processing job submitted to the pool.
pub struct PaperJob {
    pub stub: PaperStub,
    pub index: usize,
    pub total: usize,
    pub result_tx: oneshot::Sender<PaperOutcome>,
}

/// Everything a worker needs to process one paper.
pub struct StageContext {
    pub fetcher: Fetcher,
    pub extractor: Extractor,
    pub normalizer: Normalizer,
    pub max_pages: usize,
    pub max_chars: usize,
    pub progress: ProgressFn,
}

/// A pool of worker tasks that process paper jobs.
///
/// Submit jobs via [`submit()`](PaperPool::submit), receive results via the
/// oneshot receiver paired with each job.
pub struct PaperPool {
    job_tx: async_channel::Sender<PaperJob>,
    pool_handle: JoinHandle<()>,
}

impl PaperPool {
    pub fn new(ctx: Arc<StageContext>, cancel: CancellationToken, num_workers: usize) -> Self {
        let (job_tx, job_rx) = async_channel::unbounded::<PaperJob>();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers.max(1));
            for _ in 0..num_workers.max(1) {
                handles.push(tokio::spawn(worker_loop(
                    job_rx.clone(),
                    ctx.clone(),
                    cancel.clone(),
                )));
            }
            drop(job_rx);
            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
        }
    }

    pub async fn submit(&self, job: PaperJob) {
        let _ = self.job_tx.send(job).await;
    }

    /// Close the pool and wait for all workers to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn worker_loop(
    job_rx: async_channel::Receiver<PaperJob>,
    ctx: Arc<StageContext>,
    cancel: CancellationToken,
) {
    while let Ok(job) = job_rx.recv().await {
        // Queued jobs after cancellation are dropped; their oneshot
        // receivers observe the closed channel.
        if cancel.is_cancelled() {
            tracing::debug!(id = %job.stub.id, "dropping queued paper: cancelled");
            continue;
        }

        // Racing the whole stage sequence against the token cancels in-flight
        // HTTP and LLM calls promptly; the atomic cache writes make dropping
        // mid-fetch safe.
        let outcome = tokio::select! {
            outcome = process_paper(&ctx, &job.stub, job.index, job.total) => outcome,
            _ = cancel.cancelled() => {
                tracing::debug!(id = %job.stub.id, "abandoning in-flight paper: cancelled");
                continue;
            }
        };
        (ctx.progress)(ProgressEvent::PaperDone {
            index: job.index,
            total: job.total,
            outcome: Box::new(outcome.clone()),
        });
        let _ = job.result_tx.send(outcome);
    }
}

/// Carry one paper through all stages. Never panics a worker; any stage
/// error becomes a `Failed` outcome.
async fn process_paper(
    ctx: &StageContext,
    stub: &PaperStub,
    index: usize,
    total: usize,
) -> PaperOutcome {
    (ctx.progress)(ProgressEvent::Fetching {
        index,
        total,
        id: stub.id.clone(),
        title: stub.title.clone(),
    });

    let fetched = match ctx.fetcher.fetch(stub).await {
        Ok(result) => result,
        Err(failure) => return fail(stub, failure),
    };
    if let FetchResult::Cached(_) = fetched {
        (ctx.progress)(ProgressEvent::CacheHit {
            id: stub.id.clone(),
        });
    }

    // lopdf is synchronous CPU work; keep it off the async workers.
    let path = fetched.path().clone();
    let (max_pages, max_chars) = (ctx.max_pages, ctx.max_chars);
    let parsed = tokio::task::spawn_blocking(move || {
        crate::parse::extract_head_text(&path, max_pages, max_chars)
    })
    .await;
    let text = match parsed {
        Ok(Ok(text)) => text,
        Ok(Err(failure)) => return fail(stub, failure),
        Err(join_err) => {
            return fail(
                stub,
                StageFailure::Parse(format!("parser task failed: {}", join_err)),
            );
        }
    };
    (ctx.progress)(ProgressEvent::Parsed {
        id: stub.id.clone(),
        chars: text.len(),
    });

    let mut authors = match ctx.extractor.extract(stub, &text).await {
        Ok(authors) => authors,
        Err(failure) => return fail(stub, failure),
    };
    (ctx.progress)(ProgressEvent::Extracted {
        id: stub.id.clone(),
        authors: authors.len(),
    });

    ctx.normalizer.normalize_authors(&mut authors).await;

    PaperOutcome::Processed(ProcessedPaper {
        stub: stub.clone(),
        authors,
    })
}

fn fail(stub: &PaperStub, failure: StageFailure) -> PaperOutcome {
    tracing::info!(id = %stub.id, stage = failure.stage(), error = failure.message(), "paper failed");
    PaperOutcome::Failed {
        stub: stub.clone(),
        failure,
    }
}

/// Search for papers and process them all. See [`crate::run_pipeline`].
pub async fn run(
    query: &str,
    config: Config,
    llm: Arc<affilens_llm::LlmClient>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<Vec<PaperOutcome>, CoreError> {
    let progress: ProgressFn = Arc::new(progress);
    let timeout = Duration::from_secs(config.http_timeout_secs);
    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(2)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new());

    // ── Search phase ────────────────────────────────────────────────────
    progress(ProgressEvent::Searching {
        query: query.to_string(),
        limit: config.max_papers,
    });
    let sources = build_sources(&config);
    let search_query = SearchQuery {
        text: query.to_string(),
        limit: config.max_papers,
        date_from: config.date_from.clone(),
        date_to: config.date_to.clone(),
    };
    let stubs = search_all(
        &sources,
        &search_query,
        &client,
        timeout,
        &config.rate_limiters,
    )
    .await?;
    progress(ProgressEvent::SearchComplete {
        found: stubs.len(),
    });
    tracing::info!(query, found = stubs.len(), "search complete");

    if stubs.is_empty() {
        return Ok(Vec::new());
    }

    // ── Processing phase ────────────────────────────────────────────────
    let cache = Arc::new(DocumentCache::open(&config.cache_dir)?);
    let kb = Arc::new(KnowledgeBase::load(config.kb_path.as_deref())?);
    let ctx = Arc::new(StageContext {
        fetcher: Fetcher::new(
            client.clone(),
            cache.clone(),
            config.rate_limiters.clone(),
            timeout,
            config.fetch_retries,
        ),
        extractor: Extractor::new(llm.clone(), config.rate_limiters.clone()),
        normalizer: Normalizer::new(kb, llm, config.rate_limiters.clone(), config.normalizer.clone()),
        max_pages: config.max_pages,
        max_chars: config.max_chars,
        progress: progress.clone(),
    });

    let pool = PaperPool::new(ctx, cancel.clone(), config.num_workers);
    let total = stubs.len();
    let mut receivers = Vec::with_capacity(total);
    for (index, stub) in stubs.into_iter().enumerate() {
        let (result_tx, result_rx) = oneshot::channel();
        pool.submit(PaperJob {
            stub,
            index,
            total,
            result_tx,
        })
        .await;
        receivers.push(result_rx);
    }
    pool.shutdown().await;

    let mut outcomes = Vec::with_capacity(total);
    for rx in receivers {
        // A closed channel means the job was dropped after cancellation.
        if let Ok(outcome) = rx.await {
            outcomes.push(outcome);
        }
    }

    let stats = cache.stats();
    tracing::info!(
        processed = outcomes.len(),
        cache_hits = stats.hits,
        cache_misses = stats.misses,
        "run complete"
    );

    Ok(outcomes)
}
