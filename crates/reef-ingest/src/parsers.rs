use std::io::Read;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{IngestError, Result};

/// Plain text plus parser metadata, the output of every parser.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Synchronous parser for one format family. Concrete parsers may try
/// several strategies in order, taking the first that yields non-empty text.
pub trait DocumentParser: Send + Sync {
    fn name(&self) -> &'static str;
    fn parse_sync(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument>;
}

/// Dispatches by filename extension to the registered parser family.
pub struct ParserFactory;

impl ParserFactory {
    pub fn parser_for(filename: &str) -> Result<Box<dyn DocumentParser>> {
        let extension = extension_of(filename);
        match extension.as_str() {
            "txt" | "md" | "markdown" | "log" | "csv" | "json" | "yaml" | "yml" | "toml"
            | "rst" | "html" | "htm" => Ok(Box::new(TextParser)),
            "docx" => Ok(Box::new(WordParser)),
            "pdf" => Ok(Box::new(PdfParser)),
            _ => Err(IngestError::UnsupportedFormat { extension }),
        }
    }
}

fn extension_of(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .filter(|ext| *ext != filename)
        .unwrap_or("")
        .to_lowercase()
}

fn base_metadata(parser: &str, filename: &str, text: &str) -> serde_json::Value {
    json!({
        "filename": filename,
        "file_extension": extension_of(filename),
        "parser_name": parser,
        "text_length": text.chars().count(),
        "line_count": text.lines().count(),
    })
}

/// Plain and structured text. Strategies: strict UTF-8, then lossy decode.
pub struct TextParser;

impl DocumentParser for TextParser {
    fn name(&self) -> &'static str {
        "text"
    }

    fn parse_sync(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument> {
        let text = match std::str::from_utf8(bytes) {
            Ok(s) => s.to_string(),
            Err(_) => {
                debug!(filename, "not valid UTF-8, decoding lossily");
                String::from_utf8_lossy(bytes).into_owned()
            }
        };
        if text.trim().is_empty() {
            return Err(IngestError::ParseFailed("document is empty".into()));
        }
        let mut metadata = base_metadata(self.name(), filename, &text);
        if extension_of(filename) == "csv" {
            metadata["row_count"] = json!(text.lines().count());
        }
        Ok(ParsedDocument { text, metadata })
    }
}

/// Word family: a docx is a zip container; the body lives in
/// `word/document.xml` and the visible text inside `<w:t>` elements.
pub struct WordParser;

impl DocumentParser for WordParser {
    fn name(&self) -> &'static str {
        "word"
    }

    fn parse_sync(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument> {
        let cursor = std::io::Cursor::new(bytes);
        let mut archive = zip::ZipArchive::new(cursor)
            .map_err(|e| IngestError::ParseFailed(format!("not a docx container: {}", e)))?;
        let mut xml = String::new();
        archive
            .by_name("word/document.xml")
            .map_err(|_| IngestError::ParseFailed("docx missing word/document.xml".into()))?
            .read_to_string(&mut xml)
            .map_err(|e| IngestError::ParseFailed(format!("docx body unreadable: {}", e)))?;

        let text = extract_docx_text(&xml);
        if text.trim().is_empty() {
            return Err(IngestError::ParseFailed("docx contains no text".into()));
        }
        let mut metadata = base_metadata(self.name(), filename, &text);
        metadata["paragraph_count"] = json!(xml.matches("<w:p ").count() + xml.matches("<w:p>").count());
        Ok(ParsedDocument { text, metadata })
    }
}

/// Pull the character data out of `<w:t>` runs, paragraph breaks become
/// newlines.
fn extract_docx_text(xml: &str) -> String {
    let mut out = String::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<w:t") {
        let after_tag = &rest[start..];
        let Some(open_end) = after_tag.find('>') else {
            break;
        };
        let content_start = start + open_end + 1;
        let Some(close) = rest[content_start..].find("</w:t>") else {
            break;
        };
        out.push_str(&unescape_xml(&rest[content_start..content_start + close]));
        rest = &rest[content_start + close + 6..];
        if rest.contains("</w:p>") && rest.find("</w:p>") < rest.find("<w:t") {
            out.push('\n');
        }
    }
    out
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// PDF: detects encryption, then extracts text from uncompressed text
/// operators. Compressed streams are out of reach without a full PDF stack,
/// which is why empty extraction is reported as `ParseFailed` rather than an
/// empty document.
pub struct PdfParser;

impl DocumentParser for PdfParser {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn parse_sync(&self, bytes: &[u8], filename: &str) -> Result<ParsedDocument> {
        if !bytes.starts_with(b"%PDF-") {
            return Err(IngestError::ParseFailed("not a PDF file".into()));
        }
        let raw = String::from_utf8_lossy(bytes);
        if raw.contains("/Encrypt") {
            return Err(IngestError::ParseFailed("encrypted".into()));
        }

        let text = extract_pdf_text(&raw);
        if text.trim().is_empty() {
            return Err(IngestError::ParseFailed(
                "no extractable text (compressed or image-only PDF)".into(),
            ));
        }
        let mut metadata = base_metadata(self.name(), filename, &text);
        metadata["page_count"] = json!(raw.matches("/Type /Page").count().max(1));
        Ok(ParsedDocument { text, metadata })
    }
}

/// Collect string operands of `Tj`/`TJ` show-text operators.
fn extract_pdf_text(raw: &str) -> String {
    let mut out = String::new();
    let mut chars = raw.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c != '(' {
            continue;
        }
        let mut literal = String::new();
        let mut escaped = false;
        let mut closed = false;
        for (_, c) in chars.by_ref() {
            if escaped {
                literal.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == ')' {
                closed = true;
                break;
            } else {
                literal.push(c);
            }
        }
        if !closed {
            break;
        }
        // Only keep literals followed by a show-text operator.
        let tail: String = raw[i..].chars().skip(literal.chars().count() + 2).take(8).collect();
        if tail.trim_start().starts_with("Tj") || tail.trim_start().starts_with("TJ") || tail.trim_start().starts_with(']') {
            out.push_str(&literal);
            out.push(' ');
        }
    }
    out
}

/// Bounded pool running `parse_sync` off the async runtime. At most
/// `workers` parses run at once so a burst of uploads cannot monopolise the
/// blocking threads.
pub struct ParserPool {
    permits: Arc<Semaphore>,
}

impl ParserPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn parse(&self, bytes: Vec<u8>, filename: String) -> Result<ParsedDocument> {
        let _permit = self.permits.clone().acquire_owned().await.unwrap();
        tokio::task::spawn_blocking(move || {
            let parser = ParserFactory::parser_for(&filename)?;
            let parsed = parser.parse_sync(&bytes, &filename)?;
            debug!(
                filename = %filename,
                parser = parser.name(),
                chars = parsed.text.chars().count(),
                "document parsed"
            );
            Ok(parsed)
        })
        .await
        .unwrap_or_else(|e| {
            warn!("parser task panicked: {e}");
            Err(IngestError::ParseFailed("parser panicked".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_is_unsupported() {
        let err = ParserFactory::parser_for("slides.pptx");
        assert!(matches!(
            err,
            Err(IngestError::UnsupportedFormat { extension }) if extension == "pptx"
        ));
    }

    #[test]
    fn text_parser_emits_contract_metadata() {
        let parsed = TextParser.parse_sync(b"line one\nline two", "notes.txt").unwrap();
        assert_eq!(parsed.metadata["parser_name"], "text");
        assert_eq!(parsed.metadata["file_extension"], "txt");
        assert_eq!(parsed.metadata["line_count"], 2);
        assert_eq!(parsed.metadata["text_length"], 17);
    }

    #[test]
    fn empty_text_fails() {
        let err = TextParser.parse_sync(b"   \n  ", "blank.txt");
        assert!(matches!(err, Err(IngestError::ParseFailed(_))));
    }

    #[test]
    fn encrypted_pdf_is_reported_as_such() {
        let bytes = b"%PDF-1.7\n1 0 obj\n<< /Encrypt 2 0 R >>\n".to_vec();
        let err = PdfParser.parse_sync(&bytes, "secret.pdf");
        match err {
            Err(IngestError::ParseFailed(msg)) => assert_eq!(msg, "encrypted"),
            other => panic!("expected ParseFailed(encrypted), got {:?}", other.map(|p| p.text)),
        }
    }

    #[test]
    fn simple_pdf_text_is_extracted() {
        let bytes = b"%PDF-1.4\nBT (Hello) Tj (world) Tj ET\n".to_vec();
        let parsed = PdfParser.parse_sync(&bytes, "hello.pdf").unwrap();
        assert!(parsed.text.contains("Hello"));
        assert!(parsed.text.contains("world"));
    }

    #[test]
    fn docx_text_runs_are_joined() {
        // Minimal docx: a zip with just the document body.
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file(
                    "word/document.xml",
                    zip::write::SimpleFileOptions::default(),
                )
                .unwrap();
            use std::io::Write;
            writer
                .write_all(
                    b"<w:document><w:body><w:p><w:r><w:t>Hello</w:t></w:r>\
                      <w:r><w:t> docx</w:t></w:r></w:p></w:body></w:document>",
                )
                .unwrap();
            writer.finish().unwrap();
        }
        let parsed = WordParser.parse_sync(buf.get_ref(), "a.docx").unwrap();
        assert!(parsed.text.contains("Hello"));
        assert!(parsed.text.contains("docx"));
    }

    #[tokio::test]
    async fn pool_dispatches_by_extension() {
        let pool = ParserPool::new(2);
        let parsed = pool.parse(b"hello".to_vec(), "a.md".into()).await.unwrap();
        assert_eq!(parsed.text, "hello");
        let err = pool.parse(b"x".to_vec(), "a.exe".into()).await;
        assert!(matches!(err, Err(IngestError::UnsupportedFormat { .. })));
    }
}
