use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod aggregate;
pub mod cache;
pub mod config_file;
pub mod extract;
pub mod fetch;
pub mod kb;
pub mod normalize;
pub mod parse;
pub mod pipeline;
pub mod rate_limit;
pub mod source;
pub mod text;

// Re-export for convenience
pub use cache::{CacheStats, DocumentCache};
pub use kb::{KbEntry, KnowledgeBase};
pub use normalize::Normalizer;
pub use rate_limit::{AdaptiveLimiter, ServiceLimiters};
pub use source::{PaperSource, SearchQuery, SourceError};

/// A paper found by a search source, before its PDF has been fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperStub {
    /// Stable identifier, e.g. "arxiv:2401.12345" or "openalex:W42".
    pub id: String,
    pub title: String,
    pub pdf_url: String,
    /// Name of the source that produced this stub.
    pub source: String,
    pub published: Option<String>,
}

/// How a normalized organization was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    KbExact,
    Fuzzy,
    LlmFallback,
    /// The LLM fallback itself failed; the raw string is carried through.
    LlmFailed,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::KbExact => "kb_exact",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::LlmFallback => "llm_fallback",
            MatchMethod::LlmFailed => "llm_failed",
        }
    }
}

/// Coarse organization category, aligned with the knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgType {
    University,
    Company,
    ResearchInstitute,
    Government,
    Hospital,
    Nonprofit,
    Unknown,
}

impl OrgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrgType::University => "university",
            OrgType::Company => "company",
            OrgType::ResearchInstitute => "research_institute",
            OrgType::Government => "government",
            OrgType::Hospital => "hospital",
            OrgType::Nonprofit => "nonprofit",
            OrgType::Unknown => "unknown",
        }
    }
}

impl Default for OrgType {
    fn default() -> Self {
        OrgType::Unknown
    }
}

/// A normalized organization attached to one raw affiliation string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedOrg {
    /// Canonical name when matched, cleaned raw string otherwise.
    pub name: String,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub org_type: OrgType,
    /// External registry identifier (ROR), when the knowledge base has one.
    pub ror: Option<String>,
    pub method: MatchMethod,
    /// Match confidence in [0, 1].
    pub score: f64,
    /// True when two candidates tied within 0.01 and the winner was picked
    /// lexicographically.
    pub ambiguous: bool,
}

/// One author with raw and normalized affiliations, in PDF order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorRecord {
    pub name: String,
    pub raw_affiliations: Vec<String>,
    pub normalized: Vec<NormalizedOrg>,
}

/// The stage at which a paper dropped out of the pipeline.
#[derive(Debug, Clone)]
pub enum StageFailure {
    Fetch(String),
    Parse(String),
    Extract(String),
}

impl StageFailure {
    /// Stable tag used in reports and CSV output.
    pub fn stage(&self) -> &'static str {
        match self {
            StageFailure::Fetch(_) => "fetch_failed",
            StageFailure::Parse(_) => "parse_failed",
            StageFailure::Extract(_) => "extraction_failed",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            StageFailure::Fetch(m) | StageFailure::Parse(m) | StageFailure::Extract(m) => m,
        }
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.stage(), self.message())
    }
}

/// A fully processed paper with extracted and normalized authors.
#[derive(Debug, Clone)]
pub struct ProcessedPaper {
    pub stub: PaperStub,
    pub authors: Vec<AuthorRecord>,
}

/// Terminal state of one paper. A failure at any stage never aborts the run;
/// the paper is recorded and the pipeline moves on.
#[derive(Debug, Clone)]
pub enum PaperOutcome {
    Processed(ProcessedPaper),
    Failed {
        stub: PaperStub,
        failure: StageFailure,
    },
}

impl PaperOutcome {
    pub fn stub(&self) -> &PaperStub {
        match self {
            PaperOutcome::Processed(p) => &p.stub,
            PaperOutcome::Failed { stub, .. } => stub,
        }
    }
}

/// Progress events emitted while a run is in flight.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Searching {
        query: String,
        limit: usize,
    },
    SearchComplete {
        found: usize,
    },
    Fetching {
        index: usize,
        total: usize,
        id: String,
        title: String,
    },
    CacheHit {
        id: String,
    },
    Parsed {
        id: String,
        chars: usize,
    },
    Extracted {
        id: String,
        authors: usize,
    },
    PaperDone {
        index: usize,
        total: usize,
        outcome: Box<PaperOutcome>,
    },
}

/// Summary counters for a complete run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub processed: usize,
    pub fetch_failed: usize,
    pub parse_failed: usize,
    pub extraction_failed: usize,
    pub authors: usize,
    pub affiliations: usize,
    pub kb_exact: usize,
    pub fuzzy: usize,
    pub llm_fallback: usize,
    pub llm_failed: usize,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("LLM error: {0}")]
    Llm(#[from] affilens_llm::LlmError),
    #[error("search error: {0}")]
    Search(#[from] source::SourceError),
    #[error("knowledge base error: {0}")]
    Kb(String),
    #[error("output error: {0}")]
    Output(String),
}

/// Thresholds and limits for the three-rung normalization ladder.
#[derive(Debug, Clone)]
pub struct NormalizerConfig {
    /// Below this fuzzy score a candidate is not even offered to the LLM.
    pub tau_low: f64,
    /// At or above this fuzzy score the best candidate is accepted outright.
    pub tau_high: f64,
    /// Number of fuzzy candidates offered to the LLM fallback.
    pub top_k: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            tau_low: 0.60,
            tau_high: 0.85,
            top_k: 5,
        }
    }
}

/// Configuration for a pipeline run.
#[derive(Clone)]
pub struct Config {
    pub max_papers: usize,
    pub num_workers: usize,
    pub http_timeout_secs: u64,
    pub fetch_retries: u32,
    /// How many leading PDF pages are parsed.
    pub max_pages: usize,
    /// Character cap on parsed text handed to extraction.
    pub max_chars: usize,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Extra knowledge base file merged over the built-in entries.
    pub kb_path: Option<PathBuf>,
    pub normalizer: NormalizerConfig,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    /// Base URL of an OpenAI-compatible endpoint; `None` means api.openai.com.
    pub llm_base_url: Option<String>,
    pub llm_max_in_flight: usize,
    pub s2_api_key: Option<String>,
    pub openalex_mailto: Option<String>,
    /// Search sources to query, in priority order. Empty means arXiv only.
    pub sources: Vec<String>,
    /// Publication date window for search, `YYYY-MM-DD`, either bound open.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub rate_limiters: Arc<ServiceLimiters>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("max_papers", &self.max_papers)
            .field("num_workers", &self.num_workers)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("fetch_retries", &self.fetch_retries)
            .field("max_pages", &self.max_pages)
            .field("max_chars", &self.max_chars)
            .field("cache_dir", &self.cache_dir)
            .field("output_dir", &self.output_dir)
            .field("kb_path", &self.kb_path)
            .field("normalizer", &self.normalizer)
            .field("llm_model", &self.llm_model)
            .field("llm_api_key", &self.llm_api_key.as_ref().map(|_| "***"))
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_max_in_flight", &self.llm_max_in_flight)
            .field("s2_api_key", &self.s2_api_key.as_ref().map(|_| "***"))
            .field("openalex_mailto", &self.openalex_mailto)
            .field("sources", &self.sources)
            .field("date_from", &self.date_from)
            .field("date_to", &self.date_to)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_papers: 10,
            num_workers: 4,
            http_timeout_secs: 30,
            fetch_retries: 3,
            max_pages: 2,
            max_chars: 8000,
            cache_dir: PathBuf::from(".affilens/cache"),
            output_dir: PathBuf::from("output"),
            kb_path: None,
            normalizer: NormalizerConfig::default(),
            llm_model: "gpt-4o-mini".into(),
            llm_api_key: None,
            llm_base_url: None,
            llm_max_in_flight: 4,
            s2_api_key: None,
            openalex_mailto: None,
            sources: vec!["arxiv".into()],
            date_from: None,
            date_to: None,
            rate_limiters: Arc::new(ServiceLimiters::default()),
        }
    }
}

/// Run the full pipeline for one query.
///
/// Searches, then fans papers out to the worker pool; each worker carries its
/// paper through fetch, parse, extract, and normalize. Progress events are
/// emitted via the callback, and the run can be stopped early via the
/// CancellationToken (in-flight papers finish, queued papers are dropped).
pub async fn run_pipeline(
    query: &str,
    config: Config,
    llm: Arc<affilens_llm::LlmClient>,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<Vec<PaperOutcome>, CoreError> {
    pipeline::run(query, config, llm, progress, cancel).await
}
