//! Scoring: match predicted rows to gold rows, count per-field TP/FP/FN,
//! derive precision/recall/F1, flag hallucinations.

use std::collections::HashSet;

use serde::Serialize;

use crate::gold::{fold_name, GoldDataset};
use crate::predict::Predictions;

/// TP/FP/FN tallies for one scored field, with derived metrics.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FieldCounts {
    pub tp: usize,
    pub fp: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

impl FieldCounts {
    fn finalize(&mut self) {
        self.precision = ratio(self.tp, self.tp + self.fp);
        self.recall = ratio(self.tp, self.tp + self.fn_);
        self.f1 = if self.precision + self.recall > 0.0 {
            2.0 * self.precision * self.recall / (self.precision + self.recall)
        } else {
            0.0
        };
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// A confidently asserted organization that contradicts the gold label.
/// Unresolved predictions are never flagged.
#[derive(Debug, Clone, Serialize)]
pub struct Hallucination {
    pub paper_id: String,
    pub author: String,
    pub predicted: String,
    pub expected: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub generated_at: String,
    pub gold_papers: usize,
    pub gold_authors: usize,
    pub predicted_authors: usize,
    pub matched_authors: usize,
    /// Micro-average over authors and all scored fields.
    pub overall: FieldCounts,
    pub authors: FieldCounts,
    pub organization: FieldCounts,
    pub country: FieldCounts,
    pub org_type: FieldCounts,
    pub hallucinations: Vec<Hallucination>,
}

fn eq_fold(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

/// Score predictions against the gold dataset.
///
/// Matching key is (paper id, author name case-insensitive and
/// whitespace-normalized). Unmatched gold rows are full misses; predicted
/// authors absent from gold count as author false positives.
pub fn evaluate(gold: &GoldDataset, predictions: &Predictions) -> EvalReport {
    let index = gold.author_index();
    let mut matched: HashSet<(String, String)> = HashSet::new();

    let mut authors = FieldCounts::default();
    let mut organization = FieldCounts::default();
    let mut country = FieldCounts::default();
    let mut org_type = FieldCounts::default();
    let mut hallucinations = Vec::new();

    for pred in &predictions.authors {
        let key = (pred.paper_id.clone(), fold_name(&pred.name));
        let Some(gold_author) = index.get(&key) else {
            authors.fp += 1;
            continue;
        };
        if !matched.insert(key) {
            continue;
        }
        authors.tp += 1;

        // Organization
        let gold_org = gold_author.normalized_affiliation.trim();
        match (&pred.normalized, gold_org.is_empty()) {
            (Some(p), false) => {
                if eq_fold(p, gold_org) {
                    organization.tp += 1;
                } else {
                    organization.fp += 1;
                    hallucinations.push(Hallucination {
                        paper_id: pred.paper_id.clone(),
                        author: pred.name.clone(),
                        predicted: p.clone(),
                        expected: gold_org.to_string(),
                    });
                }
            }
            (Some(_), true) => organization.fp += 1,
            (None, false) => organization.fn_ += 1,
            (None, true) => {}
        }

        // Country: either the full name or the ISO code may match
        let gold_has_country =
            !gold_author.country.trim().is_empty() || !gold_author.country_code.trim().is_empty();
        let pred_country = pred.country.as_deref().unwrap_or("");
        let pred_code = pred.country_code.as_deref().unwrap_or("");
        let pred_has_country = !pred_country.trim().is_empty() || !pred_code.trim().is_empty();
        match (pred_has_country, gold_has_country) {
            (true, true) => {
                if eq_fold(pred_country, &gold_author.country)
                    || eq_fold(pred_code, &gold_author.country_code)
                {
                    country.tp += 1;
                } else {
                    country.fp += 1;
                }
            }
            (true, false) => country.fp += 1,
            (false, true) => country.fn_ += 1,
            (false, false) => {}
        }

        // Org type: "unknown" is the unresolved marker, not an assertion
        let gold_type = gold_author.org_type.trim();
        let pred_type = pred.org_type.trim();
        match (pred_type != "unknown" && !pred_type.is_empty(), !gold_type.is_empty()) {
            (true, true) => {
                if pred_type.eq_ignore_ascii_case(gold_type) {
                    org_type.tp += 1;
                } else {
                    org_type.fp += 1;
                }
            }
            (true, false) => org_type.fp += 1,
            (false, true) => org_type.fn_ += 1,
            (false, false) => {}
        }
    }

    // Gold rows never matched are full misses on every labeled field
    for paper in &gold.papers {
        for author in &paper.authors {
            let key = (paper.paper_id.clone(), fold_name(&author.name));
            if matched.contains(&key) {
                continue;
            }
            authors.fn_ += 1;
            if !author.normalized_affiliation.trim().is_empty() {
                organization.fn_ += 1;
            }
            if !author.country.trim().is_empty() || !author.country_code.trim().is_empty() {
                country.fn_ += 1;
            }
            if !author.org_type.trim().is_empty() {
                org_type.fn_ += 1;
            }
        }
    }

    let mut overall = FieldCounts {
        tp: authors.tp + organization.tp + country.tp + org_type.tp,
        fp: authors.fp + organization.fp + country.fp + org_type.fp,
        fn_: authors.fn_ + organization.fn_ + country.fn_ + org_type.fn_,
        ..Default::default()
    };

    for counts in [
        &mut authors,
        &mut organization,
        &mut country,
        &mut org_type,
        &mut overall,
    ] {
        counts.finalize();
    }

    EvalReport {
        generated_at: chrono::Local::now().to_rfc3339(),
        gold_papers: gold.papers.len(),
        gold_authors: gold.author_count(),
        predicted_authors: predictions.authors.len(),
        matched_authors: authors.tp,
        overall,
        authors,
        organization,
        country,
        org_type,
        hallucinations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predict::PredictedAuthor;

    fn gold_of(n_papers: usize) -> GoldDataset {
        let papers: Vec<String> = (0..n_papers)
            .map(|i| {
                format!(
                    r#"{{
                        "paper_id": "arxiv:{i}",
                        "title": "Paper {i}",
                        "authors": [
                            {{
                                "name": "Author {i}",
                                "raw_affiliation": "Google Brain",
                                "normalized_affiliation": "Google",
                                "country": "United States",
                                "country_code": "US",
                                "org_type": "company"
                            }}
                        ]
                    }}"#
                )
            })
            .collect();
        let json = format!(
            r#"{{
                "version": "1.0",
                "created": "2026-08-01T00:00:00",
                "total_papers": {n},
                "total_authors": {n},
                "papers": [{papers}]
            }}"#,
            n = n_papers,
            papers = papers.join(",")
        );
        GoldDataset::from_json(&json).unwrap()
    }

    fn perfect_prediction(i: usize) -> PredictedAuthor {
        PredictedAuthor {
            paper_id: format!("arxiv:{i}"),
            name: format!("Author {i}"),
            raw_affiliation: Some("Google Brain".into()),
            normalized: Some("Google".into()),
            country: Some("United States".into()),
            country_code: Some("US".into()),
            org_type: "company".into(),
        }
    }

    #[test]
    fn perfect_predictions_score_one_across_fifty_papers() {
        let gold = gold_of(50);
        let predictions = Predictions {
            authors: (0..50).map(perfect_prediction).collect(),
        };
        let report = evaluate(&gold, &predictions);
        for counts in [
            report.overall,
            report.authors,
            report.organization,
            report.country,
            report.org_type,
        ] {
            assert_eq!(counts.precision, 1.0);
            assert_eq!(counts.recall, 1.0);
            assert_eq!(counts.f1, 1.0);
        }
        assert!(report.hallucinations.is_empty());
        assert_eq!(report.matched_authors, 50);
    }

    #[test]
    fn wrong_organization_is_a_hallucination() {
        let gold = gold_of(1);
        let mut pred = perfect_prediction(0);
        pred.normalized = Some("Microsoft".into());
        let report = evaluate(&gold, &Predictions { authors: vec![pred] });
        assert_eq!(report.organization.fp, 1);
        assert_eq!(report.hallucinations.len(), 1);
        assert_eq!(report.hallucinations[0].expected, "Google");
        // The other fields still score
        assert_eq!(report.country.tp, 1);
    }

    #[test]
    fn unresolved_is_a_miss_not_a_hallucination() {
        let gold = gold_of(1);
        let pred = PredictedAuthor {
            normalized: None,
            country: None,
            country_code: None,
            org_type: "unknown".into(),
            ..perfect_prediction(0)
        };
        let report = evaluate(&gold, &Predictions { authors: vec![pred] });
        assert_eq!(report.organization.fn_, 1);
        assert_eq!(report.organization.fp, 0);
        assert!(report.hallucinations.is_empty());
    }

    #[test]
    fn unmatched_gold_rows_are_full_misses() {
        let gold = gold_of(2);
        let predictions = Predictions {
            authors: vec![perfect_prediction(0)],
        };
        let report = evaluate(&gold, &predictions);
        assert_eq!(report.authors.fn_, 1);
        assert_eq!(report.organization.fn_, 1);
        assert_eq!(report.country.fn_, 1);
        assert_eq!(report.authors.recall, 0.5);
    }

    #[test]
    fn predicted_author_absent_from_gold_is_author_fp() {
        let gold = gold_of(1);
        let mut stray = perfect_prediction(0);
        stray.name = "Nobody Here".into();
        let predictions = Predictions {
            authors: vec![perfect_prediction(0), stray],
        };
        let report = evaluate(&gold, &predictions);
        assert_eq!(report.authors.tp, 1);
        assert_eq!(report.authors.fp, 1);
        assert!(report.authors.precision < 1.0);
    }

    #[test]
    fn author_matching_folds_case_and_whitespace() {
        let gold = gold_of(1);
        let mut pred = perfect_prediction(0);
        pred.name = "  AUTHOR   0 ".into();
        let report = evaluate(&gold, &Predictions { authors: vec![pred] });
        assert_eq!(report.authors.tp, 1);
        assert_eq!(report.authors.fn_, 0);
    }

    #[test]
    fn metrics_stay_in_unit_interval() {
        let gold = gold_of(3);
        let mut bad = perfect_prediction(1);
        bad.normalized = Some("Wrong Org".into());
        bad.country = Some("France".into());
        bad.country_code = Some("FR".into());
        let predictions = Predictions {
            authors: vec![perfect_prediction(0), bad],
        };
        let report = evaluate(&gold, &predictions);
        for counts in [report.overall, report.organization, report.country] {
            assert!((0.0..=1.0).contains(&counts.precision));
            assert!((0.0..=1.0).contains(&counts.recall));
            assert!((0.0..=1.0).contains(&counts.f1));
        }
    }
}
