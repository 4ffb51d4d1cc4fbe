//! Aggregation of paper outcomes into flat rows, summary stats, and
//! on-disk artifacts (CSV + JSON report).
//!
//! Artifact I/O errors are run-fatal: a run whose results cannot be written
//! is worthless, unlike a single paper failing mid-pipeline.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    AuthorRecord, CoreError, MatchMethod, NormalizedOrg, OrgType, PaperOutcome, RunStats,
};

/// One CSV row: a (paper, author, affiliation) triple. Authors without any
/// affiliation still get one row so they are not silently dropped.
#[derive(Debug, Clone)]
pub struct Row {
    pub paper_id: String,
    pub paper_title: String,
    pub source: String,
    pub author: String,
    pub raw_affiliation: Option<String>,
    pub normalized: Option<NormalizedOrg>,
}

/// Flatten processed papers into rows, in pipeline order.
pub fn rows(outcomes: &[PaperOutcome]) -> Vec<Row> {
    let mut out = Vec::new();
    for outcome in outcomes {
        let PaperOutcome::Processed(paper) = outcome else {
            continue;
        };
        for author in &paper.authors {
            if author.raw_affiliations.is_empty() {
                out.push(Row {
                    paper_id: paper.stub.id.clone(),
                    paper_title: paper.stub.title.clone(),
                    source: paper.stub.source.clone(),
                    author: author.name.clone(),
                    raw_affiliation: None,
                    normalized: None,
                });
                continue;
            }
            for (i, raw) in author.raw_affiliations.iter().enumerate() {
                out.push(Row {
                    paper_id: paper.stub.id.clone(),
                    paper_title: paper.stub.title.clone(),
                    source: paper.stub.source.clone(),
                    author: author.name.clone(),
                    raw_affiliation: Some(raw.clone()),
                    normalized: author.normalized.get(i).cloned(),
                });
            }
        }
    }
    out
}

/// Summary counters over all outcomes.
pub fn compute_stats(outcomes: &[PaperOutcome]) -> RunStats {
    let mut stats = RunStats {
        total: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            PaperOutcome::Processed(paper) => {
                stats.processed += 1;
                stats.authors += paper.authors.len();
                for author in &paper.authors {
                    stats.affiliations += author.raw_affiliations.len();
                    for org in &author.normalized {
                        match org.method {
                            MatchMethod::KbExact => stats.kb_exact += 1,
                            MatchMethod::Fuzzy => stats.fuzzy += 1,
                            MatchMethod::LlmFallback => stats.llm_fallback += 1,
                            MatchMethod::LlmFailed => stats.llm_failed += 1,
                        }
                    }
                }
            }
            PaperOutcome::Failed { failure, .. } => match failure.stage() {
                "fetch_failed" => stats.fetch_failed += 1,
                "parse_failed" => stats.parse_failed += 1,
                _ => stats.extraction_failed += 1,
            },
        }
    }
    stats
}

#[derive(Debug, Serialize)]
pub struct FailureReport {
    pub paper_id: String,
    pub title: String,
    pub stage: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
struct PaperReport<'a> {
    id: &'a str,
    title: &'a str,
    source: &'a str,
    published: Option<&'a str>,
    status: &'static str,
    authors: &'a [AuthorRecord],
}

/// The JSON report written next to the CSV.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub generated_at: String,
    pub query: &'a str,
    pub stats: RunStats,
    /// Author-affiliation pairs per country of the normalized org.
    pub by_country: BTreeMap<String, usize>,
    /// Author-affiliation pairs per organization type.
    pub by_org_type: BTreeMap<String, usize>,
    /// Authors with at least one company affiliation.
    pub industry_authors: usize,
    /// Authors with at least one university or research institute affiliation.
    pub academia_authors: usize,
    pub failures: Vec<FailureReport>,
    papers: Vec<PaperReport<'a>>,
}

pub fn build_report<'a>(query: &'a str, outcomes: &'a [PaperOutcome]) -> RunReport<'a> {
    let stats = compute_stats(outcomes);

    let mut by_country: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_org_type: BTreeMap<String, usize> = BTreeMap::new();
    let mut industry_authors = 0usize;
    let mut academia_authors = 0usize;
    let mut failures = Vec::new();
    let mut papers = Vec::new();

    for outcome in outcomes {
        match outcome {
            PaperOutcome::Processed(paper) => {
                for author in &paper.authors {
                    let mut industry = false;
                    let mut academia = false;
                    for org in &author.normalized {
                        if let Some(country) = &org.country {
                            *by_country.entry(country.clone()).or_insert(0) += 1;
                        }
                        *by_org_type.entry(org.org_type.as_str().to_string()).or_insert(0) += 1;
                        match org.org_type {
                            OrgType::Company => industry = true,
                            OrgType::University | OrgType::ResearchInstitute => academia = true,
                            _ => {}
                        }
                    }
                    if industry {
                        industry_authors += 1;
                    }
                    if academia {
                        academia_authors += 1;
                    }
                }
                papers.push(PaperReport {
                    id: &paper.stub.id,
                    title: &paper.stub.title,
                    source: &paper.stub.source,
                    published: paper.stub.published.as_deref(),
                    status: "processed",
                    authors: &paper.authors,
                });
            }
            PaperOutcome::Failed { stub, failure } => {
                failures.push(FailureReport {
                    paper_id: stub.id.clone(),
                    title: stub.title.clone(),
                    stage: failure.stage(),
                    message: failure.message().to_string(),
                });
                papers.push(PaperReport {
                    id: &stub.id,
                    title: &stub.title,
                    source: &stub.source,
                    published: stub.published.as_deref(),
                    status: failure.stage(),
                    authors: &[],
                });
            }
        }
    }

    RunReport {
        generated_at: chrono::Local::now().to_rfc3339(),
        query,
        stats,
        by_country,
        by_org_type,
        industry_authors,
        academia_authors,
        failures,
        papers,
    }
}

/// Paths of the files written by [`write_artifacts`].
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub csv: PathBuf,
    pub report: PathBuf,
}

/// Write `affiliations_<ts>.csv` and `report_<ts>.json` under `output_dir`.
pub fn write_artifacts(
    query: &str,
    outcomes: &[PaperOutcome],
    output_dir: &Path,
) -> Result<ArtifactPaths, CoreError> {
    std::fs::create_dir_all(output_dir)?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");

    let csv_path = output_dir.join(format!("affiliations_{}.csv", ts));
    std::fs::write(&csv_path, render_csv(&rows(outcomes)))?;

    let report_path = output_dir.join(format!("report_{}.json", ts));
    let report = build_report(query, outcomes);
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| CoreError::Output(format!("report serialization: {}", e)))?;
    std::fs::write(&report_path, json)?;

    tracing::info!(csv = %csv_path.display(), report = %report_path.display(), "artifacts written");
    Ok(ArtifactPaths {
        csv: csv_path,
        report: report_path,
    })
}

const CSV_HEADER: &str = "paper_id,paper_title,source,author,raw_affiliation,normalized_name,country,country_code,org_type,method,score,ambiguous";

pub fn render_csv(rows: &[Row]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for row in rows {
        let empty = String::new();
        let (norm_name, country, country_code, org_type, method, score, ambiguous) =
            match &row.normalized {
                Some(org) => (
                    org.name.clone(),
                    org.country.clone().unwrap_or_default(),
                    org.country_code.clone().unwrap_or_default(),
                    org.org_type.as_str().to_string(),
                    org.method.as_str().to_string(),
                    format!("{:.4}", org.score),
                    org.ambiguous.to_string(),
                ),
                None => Default::default(),
            };
        let fields = [
            &row.paper_id,
            &row.paper_title,
            &row.source,
            &row.author,
            row.raw_affiliation.as_ref().unwrap_or(&empty),
            &norm_name,
            &country,
            &country_code,
            &org_type,
            &method,
            &score,
            &ambiguous,
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
        out.push_str(&line.join(","));
        out.push('\n');
    }
    out
}

/// Quote a CSV field when it contains a comma, quote, or newline; embedded
/// quotes are doubled.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Human-readable summary for terminal output.
pub fn render_summary(report: &RunReport<'_>) -> String {
    let s = &report.stats;
    let mut out = String::new();
    out.push_str(&format!(
        "Papers: {} total, {} processed, {} failed\n",
        s.total,
        s.processed,
        s.fetch_failed + s.parse_failed + s.extraction_failed
    ));
    out.push_str(&format!(
        "Authors: {}, affiliations: {}\n",
        s.authors, s.affiliations
    ));
    out.push_str(&format!(
        "Normalization: {} kb_exact, {} fuzzy, {} llm_fallback, {} llm_failed\n",
        s.kb_exact, s.fuzzy, s.llm_fallback, s.llm_failed
    ));
    out.push_str(&format!(
        "Industry authors: {}, academia authors: {}\n",
        report.industry_authors, report.academia_authors
    ));
    if !report.by_country.is_empty() {
        out.push_str("Top countries:\n");
        let mut countries: Vec<(&String, &usize)> = report.by_country.iter().collect();
        countries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (country, count) in countries.into_iter().take(10) {
            out.push_str(&format!("  {:30} {}\n", country, count));
        }
    }
    if !report.failures.is_empty() {
        out.push_str("Failures:\n");
        for f in &report.failures {
            out.push_str(&format!("  {} [{}] {}\n", f.paper_id, f.stage, f.message));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PaperStub, ProcessedPaper, StageFailure};

    fn org(name: &str, country: &str, org_type: OrgType, method: MatchMethod) -> NormalizedOrg {
        NormalizedOrg {
            name: name.into(),
            country: Some(country.into()),
            country_code: Some("XX".into()),
            org_type,
            ror: None,
            method,
            score: 1.0,
            ambiguous: false,
        }
    }

    fn sample_outcomes() -> Vec<PaperOutcome> {
        let stub = PaperStub {
            id: "arxiv:1".into(),
            title: "Paper, with \"commas\"".into(),
            pdf_url: "https://arxiv.org/pdf/1".into(),
            source: "arxiv".into(),
            published: Some("2024-01-01".into()),
        };
        vec![
            PaperOutcome::Processed(ProcessedPaper {
                stub: stub.clone(),
                authors: vec![
                    AuthorRecord {
                        name: "Ada".into(),
                        raw_affiliations: vec!["Google Brain".into(), "MIT".into()],
                        normalized: vec![
                            org("Google", "United States", OrgType::Company, MatchMethod::KbExact),
                            org(
                                "Massachusetts Institute of Technology",
                                "United States",
                                OrgType::University,
                                MatchMethod::KbExact,
                            ),
                        ],
                    },
                    AuthorRecord {
                        name: "Bob".into(),
                        raw_affiliations: vec![],
                        normalized: vec![],
                    },
                ],
            }),
            PaperOutcome::Failed {
                stub: PaperStub {
                    id: "arxiv:2".into(),
                    ..stub
                },
                failure: StageFailure::Parse("no text".into()),
            },
        ]
    }

    #[test]
    fn rows_include_affiliationless_authors() {
        let rows = rows(&sample_outcomes());
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].author, "Bob");
        assert!(rows[2].raw_affiliation.is_none());
    }

    #[test]
    fn stats_count_methods_and_failures() {
        let stats = compute_stats(&sample_outcomes());
        assert_eq!(stats.total, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.parse_failed, 1);
        assert_eq!(stats.authors, 2);
        assert_eq!(stats.affiliations, 2);
        assert_eq!(stats.kb_exact, 2);
    }

    #[test]
    fn report_aggregates_country_and_sector() {
        let outcomes = sample_outcomes();
        let report = build_report("agents", &outcomes);
        assert_eq!(report.by_country.get("United States"), Some(&2));
        assert_eq!(report.by_org_type.get("company"), Some(&1));
        assert_eq!(report.by_org_type.get("university"), Some(&1));
        // Ada has both a company and a university affiliation.
        assert_eq!(report.industry_authors, 1);
        assert_eq!(report.academia_authors, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, "parse_failed");
    }

    #[test]
    fn csv_escapes_embedded_quotes_and_commas() {
        let csv = render_csv(&rows(&sample_outcomes()));
        let mut lines = csv.lines();
        assert_eq!(lines.next().unwrap(), CSV_HEADER);
        let first = lines.next().unwrap();
        assert!(first.contains("\"Paper, with \"\"commas\"\"\""), "{first}");
        assert_eq!(CSV_HEADER.split(',').count(), 12);
    }

    #[test]
    fn artifacts_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_artifacts("agents", &sample_outcomes(), dir.path()).unwrap();
        assert!(paths.csv.is_file());
        assert!(paths.report.is_file());

        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&paths.report).unwrap()).unwrap();
        assert_eq!(report["query"], "agents");
        assert_eq!(report["stats"]["processed"], 1);
        assert_eq!(report["papers"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn summary_renders_counts() {
        let outcomes = sample_outcomes();
        let report = build_report("agents", &outcomes);
        let text = render_summary(&report);
        assert!(text.contains("2 total, 1 processed, 1 failed"));
        assert!(text.contains("kb_exact"));
        assert!(text.contains("parse_failed"));
    }
}
