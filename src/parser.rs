//! Parse stage: raw source → [`ParsedDocument`].
//!
//! A [`Source`] is either uploaded bytes, a URL to fetch, or inline text.
//! Byte-level extraction is delegated to [`crate::extract`]; this module
//! owns the canonical record: text, Markdown-heading section hints, title,
//! checksum and timestamp.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use documind_core::models::{ParsedDocument, SectionHint, SourceKind, StructuralHints};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::extract::{self, ExtractError};

/// A document to run through the pipeline.
#[derive(Debug, Clone)]
pub enum Source {
    File {
        filename: String,
        bytes: Vec<u8>,
        content_type: Option<String>,
    },
    Url(String),
    Text {
        text: String,
        title: Option<String>,
    },
}

impl Source {
    pub fn kind(&self) -> SourceKind {
        match self {
            Source::File { .. } => SourceKind::File,
            Source::Url(_) => SourceKind::Url,
            Source::Text { .. } => SourceKind::Text,
        }
    }

    /// Short name for logs.
    pub fn describe(&self) -> &str {
        match self {
            Source::File { filename, .. } => filename,
            Source::Url(url) => url,
            Source::Text { .. } => "inline",
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unsupported media type '{0}'")]
    UnsupportedMediaType(String),
    #[error("source is {size} bytes, over the {limit}-byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("document contains no text")]
    Empty,
    #[error("invalid URL '{0}': only http and https are supported")]
    InvalidUrl(String),
    #[error("failed to fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl ParseError {
    /// True when the message only restates what the caller sent. Fetch and
    /// extraction errors carry network and decoder internals instead.
    pub fn is_caller_error(&self) -> bool {
        match self {
            ParseError::Fetch { .. } => false,
            ParseError::Extract(e) => matches!(
                e,
                ExtractError::LegacyDoc
                    | ExtractError::Encoding
                    | ExtractError::UnsupportedContentType(_)
            ),
            _ => true,
        }
    }
}

/// Normalizes a [`Source`] into a [`ParsedDocument`].
#[async_trait]
pub trait DocumentParser: Send + Sync {
    async fn parse(&self, document_id: &str, source: Source) -> Result<ParsedDocument, ParseError>;
}

/// Parser backed by [`crate::extract`] and a `reqwest` client for URLs.
pub struct DefaultParser {
    client: reqwest::Client,
    max_bytes: usize,
}

impl DefaultParser {
    pub fn new(max_bytes: usize, fetch_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(concat!("documind/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, max_bytes })
    }

    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, String), ParseError> {
        let fetch_err = |message: String| ParseError::Fetch {
            url: url.to_string(),
            message,
        };

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fetch_err(format!("HTTP {}", status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(extract::normalize_mime)
            .unwrap_or_else(|| extract::resolve_mime(url, None));

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(ParseError::TooLarge {
                    size: len as usize,
                    limit: self.max_bytes,
                });
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

#[async_trait]
impl DocumentParser for DefaultParser {
    async fn parse(&self, document_id: &str, source: Source) -> Result<ParsedDocument, ParseError> {
        let kind = source.kind();
        let (name, bytes, content_type, title) = match source {
            Source::File {
                filename,
                bytes,
                content_type,
            } => {
                let mime = extract::resolve_mime(&filename, content_type.as_deref());
                (filename, bytes, mime, None)
            }
            Source::Url(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ParseError::InvalidUrl(url));
                }
                let (bytes, mime) = self.fetch(&url).await?;
                (url, bytes, mime, None)
            }
            Source::Text { text, title } => (
                "inline".to_string(),
                text.into_bytes(),
                extract::MIME_MARKDOWN.to_string(),
                title,
            ),
        };

        if bytes.len() > self.max_bytes {
            return Err(ParseError::TooLarge {
                size: bytes.len(),
                limit: self.max_bytes,
            });
        }
        if !extract::is_allowed_mime(&content_type) {
            return Err(ParseError::UnsupportedMediaType(content_type));
        }

        let size_bytes = bytes.len();
        let mime = content_type.clone();
        // pdf/docx extraction is CPU-bound; keep it off the async workers
        let raw_text = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &mime))
            .await
            .map_err(|e| ParseError::Fetch {
                url: name.clone(),
                message: format!("extraction task failed: {}", e),
            })??;

        build_document(
            document_id,
            kind,
            name,
            raw_text,
            content_type,
            title,
            size_bytes,
        )
    }
}

/// Assemble the canonical record from extracted text.
pub fn build_document(
    document_id: &str,
    source_kind: SourceKind,
    source_name: String,
    raw_text: String,
    content_type: String,
    title: Option<String>,
    size_bytes: usize,
) -> Result<ParsedDocument, ParseError> {
    let raw_text = raw_text.replace("\r\n", "\n");
    if raw_text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let sections = detect_headings(&raw_text);
    let title = title.or_else(|| {
        sections
            .iter()
            .find(|s| s.level == 1)
            .map(|s| s.title.clone())
    });
    let checksum = format!("{:x}", Sha256::digest(raw_text.as_bytes()));

    Ok(ParsedDocument {
        id: document_id.to_string(),
        source_kind,
        source_name,
        raw_text,
        hints: StructuralHints {
            title,
            content_type,
            sections,
        },
        size_bytes,
        checksum,
        timestamp: Utc::now(),
    })
}

/// ATX-style Markdown headings (`# Title` .. `###### Title`) outside of
/// fenced code blocks.
pub fn detect_headings(text: &str) -> Vec<SectionHint> {
    let mut hints = Vec::new();
    let mut offset = 0usize;
    let mut in_fence = false;

    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if trimmed.trim_start().starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence {
            let hashes = trimmed.bytes().take_while(|b| *b == b'#').count();
            if (1..=6).contains(&hashes) && trimmed[hashes..].starts_with(' ') {
                let title = trimmed[hashes..].trim().trim_end_matches('#').trim();
                if !title.is_empty() {
                    hints.push(SectionHint {
                        title: title.to_string(),
                        level: hashes as u8,
                        offset,
                    });
                }
            }
        }
        offset += line.len();
    }

    hints
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> DefaultParser {
        DefaultParser::new(1024, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn headings_carry_level_and_offset() {
        let text = "# Guide\nintro\n\n## Setup\nsteps\n```\n# not a heading\n```\n### Deep ###\n";
        let hints = detect_headings(text);
        assert_eq!(hints.len(), 3);
        assert_eq!(hints[0].title, "Guide");
        assert_eq!(hints[1].level, 2);
        assert_eq!(&text[hints[1].offset..hints[1].offset + 8], "## Setup");
        assert_eq!(hints[2].title, "Deep");
        assert!(detect_headings("#hashtag\n").is_empty());
    }

    #[tokio::test]
    async fn parses_markdown_upload() {
        let doc = parser()
            .parse(
                "doc-1",
                Source::File {
                    filename: "guide.md".into(),
                    bytes: b"# Guide\r\n\r\nUse the `Client` type.\r\n".to_vec(),
                    content_type: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(doc.id, "doc-1");
        assert_eq!(doc.source_kind, SourceKind::File);
        assert_eq!(doc.title(), "Guide");
        assert_eq!(doc.hints.content_type, extract::MIME_MARKDOWN);
        assert!(!doc.raw_text.contains('\r'));
        assert_eq!(doc.checksum.len(), 64);
    }

    #[tokio::test]
    async fn inline_text_uses_given_title() {
        let doc = parser()
            .parse(
                "d",
                Source::Text {
                    text: "plain body".into(),
                    title: Some("Notes".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(doc.source_name, "inline");
        assert_eq!(doc.title(), "Notes");
    }

    #[tokio::test]
    async fn rejects_bad_sources() {
        let p = parser();
        let err = p
            .parse(
                "d",
                Source::File {
                    filename: "pic.png".into(),
                    bytes: vec![0x89, b'P', b'N', b'G'],
                    content_type: Some("image/png".into()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedMediaType(_)));

        let err = p
            .parse(
                "d",
                Source::Text {
                    text: "x".repeat(2048),
                    title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::TooLarge { size: 2048, .. }));

        let err = p
            .parse(
                "d",
                Source::Text {
                    text: "  \n ".into(),
                    title: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParseError::Empty));

        let err = p.parse("d", Source::Url("ftp://x".into())).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidUrl(_)));
        assert!(err.is_caller_error());
    }

    #[test]
    fn only_input_errors_count_as_caller_errors() {
        let fetch = ParseError::Fetch {
            url: "http://10.0.0.9/x".into(),
            message: "connection refused".into(),
        };
        assert!(!fetch.is_caller_error());
        assert!(!ParseError::Extract(ExtractError::Pdf("bad xref".into())).is_caller_error());
        assert!(!ParseError::Extract(ExtractError::Docx("zip".into())).is_caller_error());
        assert!(ParseError::Extract(ExtractError::LegacyDoc).is_caller_error());
        assert!(ParseError::Empty.is_caller_error());
    }
}
