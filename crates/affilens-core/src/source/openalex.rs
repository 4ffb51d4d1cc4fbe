//! OpenAlex search via the works endpoint.

use std::time::Duration;

use async_trait::async_trait;

use super::{PaperSource, SearchQuery, SourceError, check_status};
use crate::PaperStub;

pub struct OpenAlex {
    /// Contact email for the polite pool.
    mailto: Option<String>,
}

impl OpenAlex {
    pub fn new(mailto: Option<String>) -> Self {
        Self { mailto }
    }
}

#[async_trait]
impl PaperSource for OpenAlex {
    fn name(&self) -> &'static str {
        "openalex"
    }

    async fn search(
        &self,
        query: &SearchQuery,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<PaperStub>, SourceError> {
        let mut url = format!(
            "https://api.openalex.org/works?search={}&per-page={}",
            urlencoding::encode(&query.text),
            query.limit.min(200)
        );
        let mut filters = Vec::new();
        if let Some(from) = &query.date_from {
            filters.push(format!("from_publication_date:{}", from));
        }
        if let Some(to) = &query.date_to {
            filters.push(format!("to_publication_date:{}", to));
        }
        if !filters.is_empty() {
            url.push_str(&format!("&filter={}", filters.join(",")));
        }
        if let Some(mailto) = &self.mailto {
            url.push_str(&format!("&mailto={}", urlencoding::encode(mailto)));
        }

        let resp = client.get(&url).timeout(timeout).send().await?;
        check_status(&resp)?;
        let body: serde_json::Value = resp.json().await?;

        parse_openalex_response(&body)
    }
}

fn parse_openalex_response(body: &serde_json::Value) -> Result<Vec<PaperStub>, SourceError> {
    let results = body["results"]
        .as_array()
        .ok_or_else(|| SourceError::Malformed("missing results array".into()))?;

    let mut stubs = Vec::new();
    for work in results {
        let Some(id_url) = work["id"].as_str() else {
            continue;
        };
        let Some(title) = work["display_name"].as_str().or(work["title"].as_str()) else {
            continue;
        };

        // Only works with a direct open-access PDF are fetchable.
        let pdf_url = work["best_oa_location"]["pdf_url"]
            .as_str()
            .or(work["primary_location"]["pdf_url"].as_str())
            .or(work["open_access"]["oa_url"].as_str());
        let Some(pdf_url) = pdf_url else {
            continue;
        };

        // Work ids look like https://openalex.org/W2741809807
        let short_id = id_url.rsplit('/').next().unwrap_or(id_url);

        stubs.push(PaperStub {
            id: format!("openalex:{}", short_id),
            title: title.to_string(),
            pdf_url: pdf_url.to_string(),
            source: "openalex".into(),
            published: work["publication_date"].as_str().map(str::to_string),
        });
    }

    Ok(stubs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_with_pdf() {
        let body = serde_json::json!({
            "results": [
                {
                    "id": "https://openalex.org/W111",
                    "display_name": "First Paper",
                    "publication_date": "2023-05-01",
                    "best_oa_location": { "pdf_url": "https://host/a.pdf" }
                },
                {
                    "id": "https://openalex.org/W222",
                    "display_name": "No PDF Here",
                    "best_oa_location": { "pdf_url": null },
                    "open_access": { "oa_url": null }
                }
            ]
        });
        let stubs = parse_openalex_response(&body).unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].id, "openalex:W111");
        assert_eq!(stubs[0].pdf_url, "https://host/a.pdf");
        assert_eq!(stubs[0].published.as_deref(), Some("2023-05-01"));
    }

    #[test]
    fn oa_url_fallback() {
        let body = serde_json::json!({
            "results": [{
                "id": "https://openalex.org/W333",
                "display_name": "OA Fallback",
                "open_access": { "oa_url": "https://host/oa.pdf" }
            }]
        });
        let stubs = parse_openalex_response(&body).unwrap();
        assert_eq!(stubs[0].pdf_url, "https://host/oa.pdf");
    }

    #[test]
    fn missing_results_is_malformed() {
        let body = serde_json::json!({"error": "bad request"});
        assert!(matches!(
            parse_openalex_response(&body),
            Err(SourceError::Malformed(_))
        ));
    }
}
