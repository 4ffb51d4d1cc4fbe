//! Offline evaluation of pipeline output against a hand-labeled gold dataset.
//!
//! Runs as a separate pass after a pipeline run: load the gold file, load
//! predictions (from the aggregate CSV or straight from `PaperOutcome`s),
//! score them, export a report.

use thiserror::Error;

pub mod gold;
pub mod metrics;
pub mod predict;
pub mod report;

pub use gold::{GoldAuthor, GoldDataset, GoldPaper};
pub use metrics::{evaluate, EvalReport, FieldCounts, Hallucination};
pub use predict::{PredictedAuthor, Predictions};
pub use report::{render_report, write_report};

#[derive(Error, Debug)]
pub enum EvalError {
    /// Malformed gold or prediction file. Fatal to the evaluation pass.
    #[error("format error: {0}")]
    Format(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
