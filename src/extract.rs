//! Text extraction for uploaded and fetched sources.
//!
//! The parser hands over bytes plus a MIME type; this module returns plain
//! UTF-8 text. HTML headings are rewritten as Markdown headings so that the
//! parser's heading detection works the same for every text-bearing format.

use std::io::Read;

use thiserror::Error;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_DOC: &str = "application/msword";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_MARKDOWN: &str = "text/markdown";
pub const MIME_HTML: &str = "text/html";
pub const MIME_JSON: &str = "application/json";
pub const MIME_XML: &str = "application/xml";
pub const MIME_TEXT_XML: &str = "text/xml";

/// MIME types admitted at the upload boundary.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    MIME_PDF,
    MIME_DOCX,
    MIME_DOC,
    MIME_TEXT,
    MIME_MARKDOWN,
    MIME_HTML,
    MIME_JSON,
    MIME_XML,
    MIME_TEXT_XML,
];

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content-type: {0}")]
    UnsupportedContentType(String),
    #[error("legacy .doc files cannot be parsed; convert to .docx or PDF")]
    LegacyDoc,
    #[error("PDF extraction failed: {0}")]
    Pdf(String),
    #[error("DOCX extraction failed: {0}")]
    Docx(String),
    #[error("HTML extraction failed: {0}")]
    Html(String),
    #[error("text is not valid UTF-8")]
    Encoding,
}

/// Strip parameters (`; charset=...`) and normalise case.
pub fn normalize_mime(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_allowed_mime(content_type: &str) -> bool {
    ALLOWED_MIME_TYPES.contains(&normalize_mime(content_type).as_str())
}

/// Best MIME type for `filename`, preferring a declared type when it is
/// specific. Browsers often send `application/octet-stream` for Markdown.
pub fn resolve_mime(filename: &str, declared: Option<&str>) -> String {
    match declared.map(normalize_mime) {
        Some(m) if !m.is_empty() && m != "application/octet-stream" => m,
        _ => {
            let lower = filename.to_ascii_lowercase();
            if lower.ends_with(".md") || lower.ends_with(".markdown") {
                MIME_MARKDOWN.to_string()
            } else {
                mime_guess::from_path(filename)
                    .first_raw()
                    .map(str::to_string)
                    .unwrap_or_else(|| "application/octet-stream".to_string())
            }
        }
    }
}

pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String, ExtractError> {
    match normalize_mime(content_type).as_str() {
        MIME_PDF => extract_pdf(bytes),
        MIME_DOCX => extract_docx(bytes),
        MIME_DOC => Err(ExtractError::LegacyDoc),
        MIME_HTML => extract_html(bytes),
        MIME_TEXT | MIME_MARKDOWN | MIME_JSON | MIME_XML | MIME_TEXT_XML => {
            String::from_utf8(bytes.to_vec()).map_err(|_| ExtractError::Encoding)
        }
        other => Err(ExtractError::UnsupportedContentType(other.to_string())),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    let entry = archive
        .by_name("word/document.xml")
        .map_err(|_| ExtractError::Docx("word/document.xml not found".to_string()))?;
    let mut doc_xml = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut doc_xml)
        .map_err(|e| ExtractError::Docx(e.to_string()))?;
    if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Docx(
            "word/document.xml exceeds size limit".to_string(),
        ));
    }
    extract_paragraphs(&doc_xml)
}

/// Collect `<w:t>` runs, one line per `<w:p>` paragraph.
fn extract_paragraphs(xml: &[u8]) -> Result<String, ExtractError> {
    use quick_xml::events::Event;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::Text(te)) if in_text => {
                let text = te
                    .unescape()
                    .map_err(|e| ExtractError::Docx(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::Docx(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_html(bytes: &[u8]) -> Result<String, ExtractError> {
    let html = String::from_utf8_lossy(bytes);
    let document = scraper::Html::parse_document(&html);
    let blocks = scraper::Selector::parse("h1, h2, h3, h4, h5, h6, p, li, pre, blockquote, td")
        .map_err(|e| ExtractError::Html(e.to_string()))?;

    let mut lines = Vec::new();
    for element in document.select(&blocks) {
        let text = element
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if text.is_empty() {
            continue;
        }
        let name = element.value().name();
        let level = match name.as_bytes() {
            [b'h', d @ b'1'..=b'6'] => Some((d - b'0') as usize),
            _ => None,
        };
        match level {
            Some(level) => lines.push(format!("{} {}", "#".repeat(level), text)),
            None if name == "li" => lines.push(format!("- {}", text)),
            None => lines.push(text),
        }
    }

    if lines.is_empty() {
        // no block structure; fall back to every text node in the document
        let text = document
            .root_element()
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        return Ok(text);
    }

    Ok(lines.join("\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_content_type_returns_error() {
        let err = extract_text(b"foo", "application/octet-stream").unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedContentType(_)));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract_text(b"not a pdf", MIME_PDF).unwrap_err();
        assert!(matches!(err, ExtractError::Pdf(_)));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract_text(b"not a zip", MIME_DOCX).unwrap_err();
        assert!(matches!(err, ExtractError::Docx(_)));
    }

    #[test]
    fn legacy_doc_is_admitted_but_not_parsed() {
        assert!(is_allowed_mime(MIME_DOC));
        let err = extract_text(b"\xd0\xcf\x11\xe0", MIME_DOC).unwrap_err();
        assert!(matches!(err, ExtractError::LegacyDoc));
    }

    #[test]
    fn html_headings_become_markdown() {
        let html = b"<html><body><h1>Guide</h1><p>Intro text.</p><h2>Setup</h2><ul><li>step one</li></ul></body></html>";
        let text = extract_text(html, "text/html; charset=utf-8").unwrap();
        assert_eq!(text, "# Guide\n\nIntro text.\n\n## Setup\n\n- step one");
    }

    #[test]
    fn docx_paragraphs_are_separated() {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(
                b"<w:document xmlns:w=\"w\"><w:body><w:p><w:r><w:t>first</w:t></w:r></w:p><w:p><w:r><w:t>second</w:t></w:r></w:p></w:body></w:document>",
            )
            .unwrap();
            zip.finish().unwrap();
        }
        assert_eq!(extract_text(&buf, MIME_DOCX).unwrap(), "first\nsecond");
    }

    #[test]
    fn resolves_mime_from_filename() {
        assert_eq!(resolve_mime("notes.md", Some("application/octet-stream")), MIME_MARKDOWN);
        assert_eq!(resolve_mime("paper.pdf", None), MIME_PDF);
        assert_eq!(resolve_mime("x.bin", Some("Text/Plain; charset=utf-8")), MIME_TEXT);
        assert!(!is_allowed_mime("image/png"));
    }
}
