//! arXiv search via the export Atom API.

use std::time::Duration;

use async_trait::async_trait;

use super::{PaperSource, SearchQuery, SourceError, check_status};
use crate::PaperStub;

pub struct Arxiv;

#[async_trait]
impl PaperSource for Arxiv {
    fn name(&self) -> &'static str {
        "arxiv"
    }

    async fn search(
        &self,
        query: &SearchQuery,
        client: &reqwest::Client,
        timeout: Duration,
    ) -> Result<Vec<PaperStub>, SourceError> {
        let mut search_expr = format!("all:{}", urlencoding::encode(&query.text));
        if let Some(window) = date_window(query) {
            search_expr.push_str("+AND+");
            search_expr.push_str(&window);
        }
        let url = format!(
            "http://export.arxiv.org/api/query?search_query={}&start=0&max_results={}",
            search_expr, query.limit
        );

        let resp = client.get(&url).timeout(timeout).send().await?;
        check_status(&resp)?;
        let body = resp.text().await?;

        parse_arxiv_feed(&body)
    }
}

/// A `submittedDate:[... TO ...]` clause for the query's date window, with
/// open bounds widened to the API's full range. Dates are `YYYY-MM-DD`.
fn date_window(query: &SearchQuery) -> Option<String> {
    if query.date_from.is_none() && query.date_to.is_none() {
        return None;
    }
    let compact = |bound: Option<&str>, fallback: &str| -> String {
        bound
            .map(|d| d.replace('-', ""))
            .unwrap_or_else(|| fallback.to_string())
    };
    Some(format!(
        "submittedDate:[{}0000+TO+{}2359]",
        compact(query.date_from.as_deref(), "19910101"),
        compact(query.date_to.as_deref(), "20991231")
    ))
}

/// Parse an arXiv Atom feed into paper stubs.
fn parse_arxiv_feed(xml: &str) -> Result<Vec<PaperStub>, SourceError> {
    use quick_xml::Reader;
    use quick_xml::events::Event;

    let mut reader = Reader::from_str(xml);

    let mut stubs = Vec::new();

    let mut in_entry = false;
    let mut in_id = false;
    let mut in_title = false;
    let mut in_published = false;

    let mut current_id = String::new();
    let mut current_title = String::new();
    let mut current_published = String::new();
    let mut current_pdf = String::new();

    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let local = e.local_name();
                match local.as_ref() {
                    b"entry" => {
                        in_entry = true;
                        current_id.clear();
                        current_title.clear();
                        current_published.clear();
                        current_pdf.clear();
                    }
                    b"id" if in_entry => in_id = true,
                    b"title" if in_entry => in_title = true,
                    b"published" if in_entry => in_published = true,
                    b"link" if in_entry => capture_pdf_link(e, &mut current_pdf),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                if e.local_name().as_ref() == b"link" && in_entry {
                    capture_pdf_link(e, &mut current_pdf);
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_id {
                    current_id.push_str(&text);
                }
                if in_title {
                    current_title.push_str(&text);
                }
                if in_published {
                    current_published.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"entry" => {
                    if let Some(stub) = build_stub(
                        &current_id,
                        &current_title,
                        &current_published,
                        &current_pdf,
                    ) {
                        stubs.push(stub);
                    }
                    in_entry = false;
                }
                b"id" => in_id = false,
                b"title" => in_title = false,
                b"published" => in_published = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(SourceError::Malformed(format!("XML parse error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(stubs)
}

/// Record the href of `<link title="pdf">` (or `type="application/pdf"`).
fn capture_pdf_link(e: &quick_xml::events::BytesStart<'_>, pdf: &mut String) {
    let mut href = String::new();
    let mut is_pdf = false;
    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"href" => href = String::from_utf8_lossy(&attr.value).to_string(),
            b"title" if attr.value.as_ref() == b"pdf" => is_pdf = true,
            b"type" if attr.value.as_ref() == b"application/pdf" => is_pdf = true,
            _ => {}
        }
    }
    if is_pdf && !href.is_empty() {
        *pdf = href;
    }
}

fn build_stub(id_url: &str, title: &str, published: &str, pdf: &str) -> Option<PaperStub> {
    // Entry id is a URL like http://arxiv.org/abs/2401.12345v2
    let arxiv_id = id_url.trim().rsplit("/abs/").next()?.trim();
    if arxiv_id.is_empty() || title.trim().is_empty() {
        return None;
    }

    let pdf_url = if pdf.is_empty() {
        format!("https://arxiv.org/pdf/{}", arxiv_id)
    } else {
        pdf.to_string()
    };

    // Titles in the feed wrap with leading whitespace on continuation lines.
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");

    Some(PaperStub {
        id: format!("arxiv:{}", arxiv_id),
        title,
        pdf_url,
        source: "arxiv".into(),
        published: if published.trim().is_empty() {
            None
        } else {
            Some(published.trim().to_string())
        },
    })
}
