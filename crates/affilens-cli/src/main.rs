use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use affilens_core::{aggregate, config_file, PaperOutcome, ProgressEvent, ServiceLimiters};
use affilens_llm::{LlmBackend, LlmClient, OpenAiBackend, OpenAiCompatibleBackend};

/// Affilens - extract and normalize author affiliations from scholarly papers
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Search for papers and extract normalized author affiliations
    Run {
        /// Search query, e.g. "large language models"
        query: String,

        /// Maximum number of papers to process
        #[arg(long)]
        max_papers: Option<usize>,

        /// Number of concurrent paper workers
        #[arg(long)]
        workers: Option<usize>,

        /// Comma-separated search sources (arxiv, openalex, semantic_scholar)
        #[arg(long, value_delimiter = ',')]
        sources: Vec<String>,

        /// Earliest publication date to search, YYYY-MM-DD
        #[arg(long)]
        from_date: Option<String>,

        /// Latest publication date to search, YYYY-MM-DD
        #[arg(long)]
        to_date: Option<String>,

        /// Directory for CSV and JSON artifacts
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Directory for the PDF document cache
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Extra knowledge base TOML merged over the built-in entries
        #[arg(long)]
        kb: Option<PathBuf>,

        /// LLM model name
        #[arg(long)]
        model: Option<String>,

        /// Base URL of an OpenAI-compatible endpoint (e.g. a local server)
        #[arg(long)]
        base_url: Option<String>,

        /// LLM API key (falls back to OPENAI_API_KEY)
        #[arg(long)]
        api_key: Option<String>,

        /// Semantic Scholar API key (falls back to S2_API_KEY)
        #[arg(long)]
        s2_api_key: Option<String>,

        /// Contact email for the OpenAlex polite pool (falls back to OPENALEX_MAILTO)
        #[arg(long)]
        openalex_mailto: Option<String>,

        /// Suppress per-paper progress output
        #[arg(short, long)]
        quiet: bool,
    },

    /// Score a prior run's CSV against a gold-standard dataset
    Evaluate {
        /// Path to the gold-standard JSON file
        gold: PathBuf,

        /// Path to the affiliations CSV produced by `run`
        predictions: PathBuf,

        /// Also write the evaluation report as JSON into this directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            query,
            max_papers,
            workers,
            sources,
            from_date,
            to_date,
            output_dir,
            cache_dir,
            kb,
            model,
            base_url,
            api_key,
            s2_api_key,
            openalex_mailto,
            quiet,
        } => {
            run(
                query,
                RunOverrides {
                    max_papers,
                    workers,
                    sources,
                    from_date,
                    to_date,
                    output_dir,
                    cache_dir,
                    kb,
                    model,
                    base_url,
                    api_key,
                    s2_api_key,
                    openalex_mailto,
                },
                quiet,
            )
            .await
        }
        Command::Evaluate {
            gold,
            predictions,
            output_dir,
        } => evaluate(&gold, &predictions, output_dir.as_deref()),
    }
}

#[derive(Debug, Default)]
struct RunOverrides {
    max_papers: Option<usize>,
    workers: Option<usize>,
    sources: Vec<String>,
    from_date: Option<String>,
    to_date: Option<String>,
    output_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    kb: Option<PathBuf>,
    model: Option<String>,
    base_url: Option<String>,
    api_key: Option<String>,
    s2_api_key: Option<String>,
    openalex_mailto: Option<String>,
}

async fn run(query: String, overrides: RunOverrides, quiet: bool) -> anyhow::Result<()> {
    // Resolve configuration: CLI flags > env vars > config files > defaults
    let mut config = config_file::load_config().into_config();

    if let Some(v) = overrides.max_papers {
        config.max_papers = v;
    }
    if let Some(v) = overrides.workers {
        config.num_workers = v.max(1);
    }
    if !overrides.sources.is_empty() {
        config.sources = overrides.sources;
    }
    config.date_from = overrides.from_date.or(config.date_from);
    config.date_to = overrides.to_date.or(config.date_to);
    if let Some(v) = overrides.output_dir {
        config.output_dir = v;
    }
    if let Some(v) = overrides.cache_dir {
        config.cache_dir = v;
    }
    if let Some(v) = overrides.kb {
        config.kb_path = Some(v);
    }
    if let Some(v) = overrides.model {
        config.llm_model = v;
    }
    config.llm_base_url = overrides.base_url.or(config.llm_base_url);
    config.llm_api_key = overrides
        .api_key
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .or(config.llm_api_key);
    config.s2_api_key = overrides
        .s2_api_key
        .or_else(|| std::env::var("S2_API_KEY").ok())
        .or(config.s2_api_key);
    config.openalex_mailto = overrides
        .openalex_mailto
        .or_else(|| std::env::var("OPENALEX_MAILTO").ok())
        .or(config.openalex_mailto);

    // Credentials changed after the file pass, so limiter quotas may too
    config.rate_limiters = Arc::new(ServiceLimiters::new(
        config.s2_api_key.is_some(),
        config.openalex_mailto.is_some(),
    ));
    // Config's Debug impl redacts credentials, so this is safe to log.
    tracing::debug!(?config, "resolved configuration");

    let backend: Arc<dyn LlmBackend> = match &config.llm_base_url {
        Some(base_url) => Arc::new(OpenAiCompatibleBackend::new(
            base_url.clone(),
            config.llm_model.clone(),
            config.llm_api_key.clone(),
        )),
        None => {
            let Some(key) = config.llm_api_key.clone() else {
                anyhow::bail!(
                    "No LLM API key. Set OPENAI_API_KEY, pass --api-key, or point \
                     --base-url at an OpenAI-compatible endpoint."
                );
            };
            Arc::new(OpenAiBackend::new(key, config.llm_model.clone()))
        }
    };
    let llm = Arc::new(LlmClient::new(backend, config.llm_max_in_flight));

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling... completed papers will be kept.");
            cancel_clone.cancel();
        }
    });

    let progress = move |event: ProgressEvent| {
        if !quiet {
            print_progress(&event);
        }
    };

    let output_dir = config.output_dir.clone();
    let outcomes = affilens_core::run_pipeline(&query, config, llm, progress, cancel).await?;

    if outcomes.is_empty() {
        println!("No papers found for \"{query}\".");
        return Ok(());
    }

    let artifacts = aggregate::write_artifacts(&query, &outcomes, &output_dir)?;
    let report = aggregate::build_report(&query, &outcomes);
    println!("\n{}", aggregate::render_summary(&report));
    println!("Artifacts:");
    println!("  {}", artifacts.csv.display());
    println!("  {}", artifacts.report.display());
    Ok(())
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Searching { query, limit } => {
            eprintln!("Searching for \"{query}\" (up to {limit} papers)...");
        }
        ProgressEvent::SearchComplete { found } => {
            eprintln!("Found {found} papers.");
        }
        ProgressEvent::Fetching {
            index,
            total,
            title,
            ..
        } => {
            eprintln!("[{}/{}] fetching: {}", index + 1, total, title);
        }
        ProgressEvent::CacheHit { id } => {
            eprintln!("        cache hit for {id}");
        }
        ProgressEvent::Parsed { id, chars } => {
            eprintln!("        parsed {id} ({chars} chars)");
        }
        ProgressEvent::Extracted { id, authors } => {
            eprintln!("        extracted {authors} author(s) from {id}");
        }
        ProgressEvent::PaperDone {
            index,
            total,
            outcome,
        } => match outcome.as_ref() {
            PaperOutcome::Processed(paper) => {
                eprintln!(
                    "[{}/{}] done: {} ({} authors)",
                    index + 1,
                    total,
                    paper.stub.id,
                    paper.authors.len()
                );
            }
            PaperOutcome::Failed { stub, failure } => {
                eprintln!("[{}/{}] failed: {} ({failure})", index + 1, total, stub.id);
            }
        },
    }
}

fn evaluate(
    gold_path: &std::path::Path,
    predictions_path: &std::path::Path,
    output_dir: Option<&std::path::Path>,
) -> anyhow::Result<()> {
    let gold = affilens_eval::GoldDataset::load(gold_path)?;
    let predictions = affilens_eval::Predictions::from_csv_path(predictions_path)?;
    let report = affilens_eval::evaluate(&gold, &predictions);

    println!("{}", affilens_eval::render_report(&report));
    if let Some(dir) = output_dir {
        let path = affilens_eval::write_report(&report, dir)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}
