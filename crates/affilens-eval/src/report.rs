//! Evaluation report export: JSON artifact plus a console summary.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::metrics::{EvalReport, FieldCounts};
use crate::EvalError;

/// Write the report as pretty JSON under `output_dir`, keyed by a run
/// timestamp. Returns the path written.
pub fn write_report(report: &EvalReport, output_dir: &Path) -> Result<PathBuf, EvalError> {
    std::fs::create_dir_all(output_dir)?;
    let ts = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = output_dir.join(format!("evaluation_{ts}.json"));
    let json = serde_json::to_string_pretty(report)
        .map_err(|e| EvalError::Format(format!("report serialization: {e}")))?;
    std::fs::write(&path, json)?;
    Ok(path)
}

fn line(out: &mut String, label: &str, counts: &FieldCounts) {
    let _ = writeln!(
        out,
        "  {label:<14} P {:>6.1}%  R {:>6.1}%  F1 {:>6.1}%   (tp {} / fp {} / fn {})",
        counts.precision * 100.0,
        counts.recall * 100.0,
        counts.f1 * 100.0,
        counts.tp,
        counts.fp,
        counts.fn_,
    );
}

/// Render the console summary.
pub fn render_report(report: &EvalReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Evaluation against gold standard");
    let _ = writeln!(
        out,
        "  gold: {} papers, {} authors; predicted: {} authors, {} matched",
        report.gold_papers, report.gold_authors, report.predicted_authors, report.matched_authors
    );
    let _ = writeln!(out);
    line(&mut out, "overall", &report.overall);
    line(&mut out, "authors", &report.authors);
    line(&mut out, "organization", &report.organization);
    line(&mut out, "country", &report.country);
    line(&mut out, "org_type", &report.org_type);

    if report.hallucinations.is_empty() {
        let _ = writeln!(out, "\nNo hallucinated organizations.");
    } else {
        let _ = writeln!(
            out,
            "\nHallucinated organizations ({}):",
            report.hallucinations.len()
        );
        for h in &report.hallucinations {
            let _ = writeln!(
                out,
                "  {} / {}: predicted \"{}\", gold \"{}\"",
                h.paper_id, h.author, h.predicted, h.expected
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gold::GoldDataset;
    use crate::metrics::evaluate;
    use crate::predict::{PredictedAuthor, Predictions};

    fn sample_report() -> EvalReport {
        let gold = GoldDataset::from_json(
            r#"{
                "version": "1.0",
                "created": "2026-08-01T00:00:00",
                "total_papers": 1,
                "total_authors": 1,
                "papers": [{
                    "paper_id": "arxiv:1",
                    "title": "T",
                    "authors": [{
                        "name": "Jane Doe",
                        "raw_affiliation": "Google Brain",
                        "normalized_affiliation": "Google",
                        "country": "United States",
                        "country_code": "US",
                        "org_type": "company"
                    }]
                }]
            }"#,
        )
        .unwrap();
        let predictions = Predictions {
            authors: vec![PredictedAuthor {
                paper_id: "arxiv:1".into(),
                name: "Jane Doe".into(),
                raw_affiliation: Some("Google Brain".into()),
                normalized: Some("Google".into()),
                country: Some("United States".into()),
                country_code: Some("US".into()),
                org_type: "company".into(),
            }],
        };
        evaluate(&gold, &predictions)
    }

    #[test]
    fn writes_json_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_report(&sample_report(), dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("evaluation_"));
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["overall"]["f1"], 1.0);
        assert_eq!(value["organization"]["fn"], 0);
    }

    #[test]
    fn summary_mentions_clean_run() {
        let text = render_report(&sample_report());
        assert!(text.contains("No hallucinated organizations"));
        assert!(text.contains("overall"));
        assert!(text.contains("100.0%"));
    }
}
