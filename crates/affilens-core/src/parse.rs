//! PDF text extraction for the paper header.
//!
//! Author and affiliation blocks live on the first page or two, so only the
//! leading pages are parsed and the text is capped before it reaches the
//! extraction prompt.

use std::path::Path;

use lopdf::Document;

use crate::StageFailure;

/// Extract text from the first `max_pages` pages, capped at `max_chars`
/// characters.
pub fn extract_head_text(
    path: &Path,
    max_pages: usize,
    max_chars: usize,
) -> Result<String, StageFailure> {
    let doc = Document::load(path)
        .map_err(|e| StageFailure::Parse(format!("failed to open PDF: {}", e)))?;

    let pages: Vec<u32> = doc
        .get_pages()
        .keys()
        .copied()
        .take(max_pages.max(1))
        .collect();
    if pages.is_empty() {
        return Err(StageFailure::Parse("PDF has no pages".into()));
    }

    let raw = doc
        .extract_text(&pages)
        .map_err(|e| StageFailure::Parse(format!("text extraction failed: {}", e)))?;

    let text = tidy_text(&raw, max_chars);
    if text.is_empty() {
        return Err(StageFailure::Parse(
            "no extractable text on leading pages".into(),
        ));
    }

    tracing::debug!(path = %path.display(), pages = pages.len(), chars = text.len(), "parsed PDF head");
    Ok(text)
}

/// Expand typographic ligatures, normalize line endings, drop blank-line
/// runs, and cap length on a char boundary.
fn tidy_text(raw: &str, max_chars: usize) -> String {
    let expanded = raw
        .replace('\u{fb00}', "ff")
        .replace('\u{fb01}', "fi")
        .replace('\u{fb02}', "fl")
        .replace('\u{fb03}', "ffi")
        .replace('\u{fb04}', "ffl")
        .replace('\r', "");

    let mut lines: Vec<&str> = Vec::new();
    let mut last_blank = true;
    for line in expanded.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            if !last_blank {
                lines.push("");
            }
            last_blank = true;
        } else {
            lines.push(trimmed);
            last_blank = false;
        }
    }
    let joined = lines.join("\n");
    let joined = joined.trim();

    joined.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::content::{Content, Operation};
    use lopdf::{Object, Stream, dictionary};

    /// Build a single-page PDF containing `text` and save it to `path`.
    fn write_pdf(path: &Path, text: &str) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().unwrap(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.save(path).unwrap();
    }

    #[test]
    fn extracts_text_from_first_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paper.pdf");
        write_pdf(&path, "Ada Lovelace, Analytical Engine Institute");

        let text = extract_head_text(&path, 2, 8000).unwrap();
        assert!(text.contains("Ada Lovelace"), "got: {text}");
    }

    #[test]
    fn corrupt_file_is_parse_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.pdf");
        std::fs::write(&path, b"%PDF-1.5 this is not really a pdf").unwrap();

        let err = extract_head_text(&path, 2, 8000).unwrap_err();
        assert_eq!(err.stage(), "parse_failed");
    }

    #[test]
    fn tidy_expands_ligatures() {
        let out = tidy_text("A\u{fb03}liations and e\u{fb00}ort", 100);
        assert_eq!(out, "Affiliations and effort");
    }

    #[test]
    fn tidy_collapses_blank_runs() {
        let out = tidy_text("a\n\n\n\nb\n", 100);
        assert_eq!(out, "a\n\nb");
    }

    #[test]
    fn tidy_caps_on_char_boundary() {
        let out = tidy_text("ééééé", 3);
        assert_eq!(out, "ééé");
    }
}
