//! Prediction loading: from the aggregate CSV artifact or straight from an
//! in-process run.

use std::collections::HashSet;
use std::path::Path;

use affilens_core::{MatchMethod, PaperOutcome};

use crate::gold::fold_name;
use crate::EvalError;

/// One predicted author row, reduced to the fields the gold contract scores.
#[derive(Debug, Clone)]
pub struct PredictedAuthor {
    pub paper_id: String,
    pub name: String,
    pub raw_affiliation: Option<String>,
    /// `None` means the pipeline left the affiliation unresolved, which is
    /// never penalized as a hallucination.
    pub normalized: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub org_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct Predictions {
    pub authors: Vec<PredictedAuthor>,
}

impl Predictions {
    /// Build predictions from an in-process run. Failed papers contribute no
    /// rows; authors with several affiliations are scored on their first one,
    /// mirroring the one-affiliation-per-author gold contract.
    pub fn from_outcomes(outcomes: &[PaperOutcome]) -> Self {
        let mut authors = Vec::new();
        let mut seen = HashSet::new();
        for outcome in outcomes {
            let PaperOutcome::Processed(paper) = outcome else {
                continue;
            };
            for author in &paper.authors {
                let key = (paper.stub.id.clone(), fold_name(&author.name));
                if !seen.insert(key) {
                    continue;
                }
                let org = author.normalized.first();
                let unresolved =
                    org.is_none_or(|o| o.method == MatchMethod::LlmFailed);
                authors.push(PredictedAuthor {
                    paper_id: paper.stub.id.clone(),
                    name: author.name.clone(),
                    raw_affiliation: author.raw_affiliations.first().cloned(),
                    normalized: if unresolved {
                        None
                    } else {
                        org.map(|o| o.name.clone())
                    },
                    country: org.and_then(|o| o.country.clone()),
                    country_code: org.and_then(|o| o.country_code.clone()),
                    org_type: org
                        .map(|o| o.org_type.as_str().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
        }
        Self { authors }
    }

    pub fn from_csv_path(path: &Path) -> Result<Self, EvalError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_csv(&content)
    }

    /// Parse a persisted aggregate CSV. Columns are located by header name so
    /// extra columns are tolerated; missing required columns are a format
    /// error.
    pub fn from_csv(content: &str) -> Result<Self, EvalError> {
        let mut lines = content.lines();
        let header = lines
            .next()
            .ok_or_else(|| EvalError::Format("predictions CSV is empty".into()))?;
        let columns = parse_csv_line(header);
        let col = |name: &str| {
            columns
                .iter()
                .position(|c| c == name)
                .ok_or_else(|| EvalError::Format(format!("predictions CSV missing column {name}")))
        };
        let paper_id = col("paper_id")?;
        let author = col("author")?;
        let raw_affiliation = col("raw_affiliation")?;
        let normalized_name = col("normalized_name")?;
        let country = col("country")?;
        let country_code = col("country_code")?;
        let org_type = col("org_type")?;
        let method = col("method")?;

        let mut authors = Vec::new();
        let mut seen = HashSet::new();
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields = parse_csv_line(line);
            if fields.len() != columns.len() {
                return Err(EvalError::Format(format!(
                    "predictions CSV line {}: {} fields, expected {}",
                    lineno + 2,
                    fields.len(),
                    columns.len()
                )));
            }
            let get = |i: usize| fields[i].clone();
            let opt = |i: usize| Some(get(i)).filter(|s| !s.is_empty());

            let key = (get(paper_id), fold_name(&get(author)));
            if !seen.insert(key) {
                continue;
            }
            let unresolved = get(method) == "llm_failed";
            authors.push(PredictedAuthor {
                paper_id: get(paper_id),
                name: get(author),
                raw_affiliation: opt(raw_affiliation),
                normalized: if unresolved { None } else { opt(normalized_name) },
                country: opt(country),
                country_code: opt(country_code),
                org_type: get(org_type),
            });
        }
        Ok(Self { authors })
    }
}

/// Split one CSV line, honoring quoted fields with doubled inner quotes.
fn parse_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
            }
            _ => field.push(c),
        }
    }
    fields.push(field);
    fields
}
