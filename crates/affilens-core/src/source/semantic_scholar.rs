//! Semantic Scholar search via the Graph API.

use std::time::Duration;

use async_trait::async_trait;

use super::{PaperSource, SearchQuery, SourceError, check_status};
use crate::PaperStub;

pub struct SemanticScholar {
    api_key: Option<String>,
}

impl SemanticScholar {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl PaperSource for SemanticScholar {
    fn name(&self) -> &'static str {
        "semantic_scholar"
    }

    async fn search(
        &self,
        query: &SearchQuery,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<PaperStub>, SourceError> {
        let mut url = format!(
            "https://api.semanticscholar.org/graph/v1/paper/search?query={}&limit={}&fields=title,openAccessPdf,publicationDate",
            urlencoding::encode(&query.text),
            query.limit.min(100)
        );
        if query.date_from.is_some() || query.date_to.is_some() {
            // The API accepts open-ended ranges like "2023-01-01:".
            url.push_str(&format!(
                "&publicationDateOrYear={}:{}",
                query.date_from.as_deref().unwrap_or(""),
                query.date_to.as_deref().unwrap_or("")
            ));
        }

        let mut request = client.get(&url).timeout(timeout);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let resp = request.send().await?;
        check_status(&resp)?;
        let body: serde_json::Value = resp.json().await?;

        parse_s2_response(&body)
    }
}

fn parse_s2_response(body: &serde_json::Value) -> Result<Vec<PaperStub>, SourceError> {
    let data = body["data"]
        .as_array()
        .ok_or_else(|| SourceError::Malformed("missing data array".into()))?;

    let mut stubs = Vec::new();
    for paper in data {
        let Some(paper_id) = paper["paperId"].as_str() else {
            continue;
        };
        let Some(title) = paper["title"].as_str() else {
            continue;
        };
        // Papers without an open-access PDF cannot be processed.
        let Some(pdf_url) = paper["openAccessPdf"]["url"].as_str() else {
            continue;
        };

        stubs.push(PaperStub {
            id: format!("s2:{}", paper_id),
            title: title.to_string(),
            pdf_url: pdf_url.to_string(),
            source: "semantic_scholar".into(),
            published: paper["publicationDate"].as_str().map(str::to_string),
        });
    }

    Ok(stubs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_access_papers_only() {
        let body = serde_json::json!({
            "total": 2,
            "data": [
                {
                    "paperId": "abc123",
                    "title": "Open Paper",
                    "publicationDate": "2022-11-30",
                    "openAccessPdf": { "url": "https://host/x.pdf" }
                },
                {
                    "paperId": "def456",
                    "title": "Paywalled Paper",
                    "openAccessPdf": null
                }
            ]
        });
        let stubs = parse_s2_response(&body).unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].id, "s2:abc123");
        assert_eq!(stubs[0].pdf_url, "https://host/x.pdf");
    }

    #[test]
    fn missing_data_is_malformed() {
        let body = serde_json::json!({"message": "too many requests"});
        assert!(matches!(
            parse_s2_response(&body),
            Err(SourceError::Malformed(_))
        ));
    }
}
