//! LLM extraction of authors and raw affiliations from parsed paper text.
//!
//! The model is asked for strict JSON. A response that fails validation gets
//! one retry with a stricter instruction; a second failure fails the paper
//! with `extraction_failed`.

use std::sync::Arc;

use affilens_llm::{LlmClient, LlmRequest, Message};
use serde::Deserialize;

use crate::rate_limit::ServiceLimiters;
use crate::text::clean_display;
use crate::{AuthorRecord, PaperStub, StageFailure};

const SYSTEM_PROMPT: &str = "You extract author and affiliation information from the \
first pages of scholarly papers. Respond with JSON only, no prose, in the form \
{\"authors\": [{\"name\": \"...\", \"affiliations\": [\"...\"]}]}. List authors in the \
order they appear. Give each author every affiliation attached to them, as written \
in the paper. Use an empty affiliations array when none is stated. Do not invent \
affiliations.";

const STRICT_RETRY_PROMPT: &str = "Your previous reply was not valid. Respond with ONLY a \
JSON object of the form {\"authors\": [{\"name\": \"...\", \"affiliations\": [\"...\"]}]} \
and nothing else. It must contain at least one author with a non-empty name.";

#[derive(Debug, Deserialize)]
struct ExtractedPayload {
    authors: Vec<ExtractedAuthor>,
}

#[derive(Debug, Deserialize)]
struct ExtractedAuthor {
    name: String,
    #[serde(default)]
    affiliations: Vec<String>,
}

pub struct Extractor {
    llm: Arc<LlmClient>,
    limiters: Arc<ServiceLimiters>,
}

impl Extractor {
    pub fn new(llm: Arc<LlmClient>, limiters: Arc<ServiceLimiters>) -> Self {
        Self { llm, limiters }
    }

    /// Extract author records from the head text of one paper.
    pub async fn extract(
        &self,
        stub: &PaperStub,
        text: &str,
    ) -> Result<Vec<AuthorRecord>, StageFailure> {
        let user = format!(
            "Paper title: {}\n\nFirst pages:\n{}",
            stub.title, text
        );

        let first = self
            .request(vec![Message::system(SYSTEM_PROMPT), Message::user(&user)])
            .await;

        match first {
            Ok(authors) => Ok(authors),
            Err(reason) => {
                tracing::debug!(id = %stub.id, reason = %reason, "extraction invalid, retrying strict");
                self.request(vec![
                    Message::system(SYSTEM_PROMPT),
                    Message::user(&user),
                    Message::user(STRICT_RETRY_PROMPT),
                ])
                .await
                .map_err(|reason| {
                    StageFailure::Extract(format!("invalid extraction after retry: {}", reason))
                })
            }
        }
    }

    async fn request(&self, messages: Vec<Message>) -> Result<Vec<AuthorRecord>, String> {
        if let Some(lim) = self.limiters.get("llm") {
            lim.acquire().await;
        }
        let value = self
            .llm
            .complete_json(LlmRequest::structured(messages))
            .await
            .map_err(|e| e.to_string())?;
        validate_payload(&value)
    }
}

/// Validate the model's JSON against the expected shape.
///
/// Requires at least one author with a non-empty name. Affiliation strings
/// are trimmed and deduplicated per author, preserving order.
fn validate_payload(value: &serde_json::Value) -> Result<Vec<AuthorRecord>, String> {
    let payload: ExtractedPayload =
        serde_json::from_value(value.clone()).map_err(|e| format!("schema mismatch: {}", e))?;

    let mut records = Vec::new();
    for author in payload.authors {
        let name = clean_display(&author.name);
        if name.is_empty() {
            continue;
        }
        let mut affiliations: Vec<String> = Vec::new();
        for raw in author.affiliations {
            let cleaned = clean_display(&raw);
            if !cleaned.is_empty() && !affiliations.contains(&cleaned) {
                affiliations.push(cleaned);
            }
        }
        records.push(AuthorRecord {
            name,
            raw_affiliations: affiliations,
            normalized: Vec::new(),
        });
    }

    if records.is_empty() {
        return Err("no authors with non-empty names".into());
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use affilens_llm::mock::{MockBackend, MockReply};

    fn stub() -> PaperStub {
        PaperStub {
            id: "arxiv:2401.00001".into(),
            title: "A Paper".into(),
            pdf_url: "https://arxiv.org/pdf/2401.00001".into(),
            source: "arxiv".into(),
            published: None,
        }
    }

    fn extractor(backend: Arc<MockBackend>) -> Extractor {
        Extractor::new(
            Arc::new(LlmClient::new(backend, 2)),
            Arc::new(ServiceLimiters::default()),
        )
    }

    const GOOD: &str = r#"{"authors": [
        {"name": "Ada Lovelace", "affiliations": ["University of Cambridge", "University of Cambridge"]},
        {"name": "Charles Babbage", "affiliations": []}
    ]}"#;

    #[tokio::test]
    async fn valid_response_first_try() {
        let backend = Arc::new(MockBackend::new(MockReply::Content(GOOD.into())));
        let authors = extractor(backend.clone())
            .extract(&stub(), "text")
            .await
            .unwrap();

        assert_eq!(authors.len(), 2);
        assert_eq!(authors[0].name, "Ada Lovelace");
        // Duplicate affiliation collapsed
        assert_eq!(authors[0].raw_affiliations, vec!["University of Cambridge"]);
        assert!(authors[1].raw_affiliations.is_empty());
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn invalid_then_valid_uses_strict_retry() {
        let backend = Arc::new(MockBackend::with_sequence(vec![
            MockReply::Content("I found three authors, here they are...".into()),
            MockReply::Content(GOOD.into()),
        ]));
        let authors = extractor(backend.clone())
            .extract(&stub(), "text")
            .await
            .unwrap();

        assert_eq!(authors.len(), 2);
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn twice_invalid_fails_extraction() {
        let backend = Arc::new(MockBackend::new(MockReply::Content("nope".into())));
        let err = extractor(backend.clone())
            .extract(&stub(), "text")
            .await
            .unwrap_err();

        assert_eq!(err.stage(), "extraction_failed");
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_author_list_triggers_retry() {
        let backend = Arc::new(MockBackend::with_sequence(vec![
            MockReply::Content(r#"{"authors": []}"#.into()),
            MockReply::Content(GOOD.into()),
        ]));
        let authors = extractor(backend.clone())
            .extract(&stub(), "text")
            .await
            .unwrap();
        assert_eq!(authors.len(), 2);
        assert_eq!(backend.call_count(), 2);
    }

    #[test]
    fn blank_names_are_dropped() {
        let value = serde_json::json!({"authors": [
            {"name": "  ", "affiliations": ["MIT"]},
            {"name": "Real Author", "affiliations": ["MIT"]}
        ]});
        let records = validate_payload(&value).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Real Author");
    }

    #[tokio::test]
    async fn api_error_maps_to_extraction_failed() {
        let backend = Arc::new(MockBackend::new(MockReply::Error {
            status: 500,
            message: "server error".into(),
        }));
        let err = extractor(backend).extract(&stub(), "text").await.unwrap_err();
        assert_eq!(err.stage(), "extraction_failed");
    }
}
