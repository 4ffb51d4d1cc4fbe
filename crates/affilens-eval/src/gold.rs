//! Gold-standard dataset: hand-labeled (paper, author, affiliation) records.
//!
//! The on-disk shape is a compatibility contract. Unknown or missing required
//! fields are rejected with a clear error rather than silently skipped.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::EvalError;

/// One hand-labeled author row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldAuthor {
    pub name: String,
    pub raw_affiliation: String,
    pub normalized_affiliation: String,
    pub country: String,
    /// ISO 3166-1 alpha-2, empty when unknown.
    pub country_code: String,
    pub org_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldPaper {
    pub paper_id: String,
    pub title: String,
    pub authors: Vec<GoldAuthor>,
    /// Annotation provenance, optional in the contract.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub annotator: Option<String>,
    #[serde(default)]
    pub annotation_date: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GoldDataset {
    pub version: String,
    pub created: String,
    pub total_papers: usize,
    pub total_authors: usize,
    pub papers: Vec<GoldPaper>,
}

impl GoldDataset {
    pub fn load(path: &Path) -> Result<Self, EvalError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, EvalError> {
        let dataset: GoldDataset = serde_json::from_str(content)
            .map_err(|e| EvalError::Format(format!("gold file: {e}")))?;
        if dataset.total_papers != dataset.papers.len() {
            return Err(EvalError::Format(format!(
                "gold file: total_papers is {} but {} papers are listed",
                dataset.total_papers,
                dataset.papers.len()
            )));
        }
        let authors: usize = dataset.papers.iter().map(|p| p.authors.len()).sum();
        if dataset.total_authors != authors {
            return Err(EvalError::Format(format!(
                "gold file: total_authors is {} but {} authors are listed",
                dataset.total_authors, authors
            )));
        }
        Ok(dataset)
    }

    pub fn author_count(&self) -> usize {
        self.papers.iter().map(|p| p.authors.len()).sum()
    }

    /// Index authors by (paper id, folded author name) for matching.
    pub(crate) fn author_index(&self) -> HashMap<(String, String), &GoldAuthor> {
        let mut index = HashMap::new();
        for paper in &self.papers {
            for author in &paper.authors {
                index
                    .entry((paper.paper_id.clone(), fold_name(&author.name)))
                    .or_insert(author);
            }
        }
        index
    }
}

/// Case-insensitive, whitespace-normalized key for author-name matching.
pub(crate) fn fold_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
