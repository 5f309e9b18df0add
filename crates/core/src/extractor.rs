use crate::error::IngestError;
use lopdf::Document;
use reqwest::Client;
use std::io::{Cursor, Read};
use std::path::Path;
use tracing::{debug, warn};
use url::Url;

/// Returned instead of text when a legacy Word file cannot be read.
pub const DOC_PLACEHOLDER: &str =
    "Error: Could not extract text from this DOC file. Please convert it to DOCX format.";

const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Pdf,
    Docx,
    Doc,
    PlainText,
    Csv,
    Json,
    Markdown,
    Html,
    Unknown,
}

impl FileKind {
    /// Picks the kind from the declared MIME type first and the file extension second.
    pub fn detect(declared_mime: &str, file_name: &str) -> Self {
        match Self::from_mime(declared_mime) {
            Self::Unknown => Self::from_extension(file_name),
            kind => kind,
        }
    }

    pub fn from_mime(declared_mime: &str) -> Self {
        let mime = declared_mime.to_ascii_lowercase();

        if mime.contains("pdf") {
            Self::Pdf
        } else if mime.contains(DOCX_MIME) {
            Self::Docx
        } else if mime.contains("application/msword") {
            Self::Doc
        } else if mime.contains("text/plain") {
            Self::PlainText
        } else if mime.contains("csv") {
            Self::Csv
        } else if mime.contains("application/json") {
            Self::Json
        } else if mime.contains("text/markdown") {
            Self::Markdown
        } else if mime.contains("text/html") {
            Self::Html
        } else {
            Self::Unknown
        }
    }

    pub fn from_extension(file_name: &str) -> Self {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "pdf" => Self::Pdf,
            "docx" => Self::Docx,
            "doc" => Self::Doc,
            "txt" => Self::PlainText,
            "csv" => Self::Csv,
            "json" => Self::Json,
            "md" | "markdown" => Self::Markdown,
            "html" | "htm" => Self::Html,
            _ => Self::Unknown,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Docx => DOCX_MIME,
            Self::Doc => "application/msword",
            Self::PlainText => "text/plain",
            Self::Csv => "text/csv",
            Self::Json => "application/json",
            Self::Markdown => "text/markdown",
            Self::Html => "text/html",
            Self::Unknown => "application/octet-stream",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// Converts an uploaded file into plain text.
///
/// Never fails: a file that cannot be read yields an empty string, or
/// [`DOC_PLACEHOLDER`] for legacy Word documents.
pub fn extract(bytes: &[u8], declared_mime: &str, file_name: &str) -> String {
    let kind = FileKind::detect(declared_mime, file_name);
    debug!(file_name, ?kind, size = bytes.len(), "extracting text");

    let outcome = match kind {
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Docx => extract_docx(bytes),
        FileKind::Doc => return extract_doc(bytes, file_name),
        FileKind::PlainText | FileKind::Markdown | FileKind::Html => Ok(decode_text(bytes)),
        FileKind::Csv => extract_csv(bytes),
        FileKind::Json => Ok(extract_json(bytes)),
        FileKind::Unknown => String::from_utf8(bytes.to_vec()).map_err(IngestError::from),
    };

    match outcome {
        Ok(text) => text,
        Err(error) => {
            warn!(file_name, ?kind, %error, "text extraction failed");
            String::new()
        }
    }
}

/// Extracts a PDF that is referenced by URL instead of passed as bytes.
///
/// Only PDFs are accepted; any other kind yields an empty string.
pub async fn extract_from_url(
    client: &Client,
    url: &str,
    declared_mime: &str,
    file_name: &str,
) -> String {
    match fetch_pdf_text(client, url, declared_mime, file_name).await {
        Ok(text) => text,
        Err(error) => {
            warn!(url, file_name, %error, "url text extraction failed");
            String::new()
        }
    }
}

async fn fetch_pdf_text(
    client: &Client,
    url: &str,
    declared_mime: &str,
    file_name: &str,
) -> Result<String, IngestError> {
    if FileKind::detect(declared_mime, file_name) != FileKind::Pdf {
        return Err(IngestError::UnsupportedUrlType(declared_mime.to_string()));
    }

    let parsed = Url::parse(url).map_err(|error| IngestError::InvalidArgument(error.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(IngestError::InvalidArgument(format!(
            "unsupported url scheme: {}",
            parsed.scheme()
        )));
    }

    let response = client.get(parsed).send().await?.error_for_status()?;
    let bytes = response.bytes().await?.to_vec();

    tokio::task::spawn_blocking(move || extract_pdf(&bytes))
        .await
        .map_err(|error| IngestError::PdfParse(format!("pdf extraction task failed: {error}")))?
}

fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn extract_pdf(bytes: &[u8]) -> Result<String, IngestError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| pdf_text_layer(bytes)))
        .map_err(|_| IngestError::PdfParse("pdf parser panicked".to_string()))?
}

fn pdf_text_layer(bytes: &[u8]) -> Result<String, IngestError> {
    let document =
        Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for page_no in document.get_pages().keys() {
        match document.extract_text(&[*page_no]) {
            Ok(text) if !text.trim().is_empty() => pages.push(text.trim_end().to_string()),
            Ok(_) => {}
            Err(error) => debug!(page = page_no, %error, "page has no readable text layer"),
        }
    }

    Ok(pages.join("\n"))
}

fn extract_docx(bytes: &[u8]) -> Result<String, IngestError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|error| IngestError::Docx(error.to_string()))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|_| IngestError::Docx("archive has no word/document.xml".to_string()))?
        .read_to_string(&mut xml)?;

    Ok(docx_xml_to_text(&xml))
}

fn extract_doc(bytes: &[u8], file_name: &str) -> String {
    match extract_docx(bytes) {
        Ok(text) => text,
        Err(error) => {
            warn!(file_name, %error, "legacy doc file could not be read");
            DOC_PLACEHOLDER.to_string()
        }
    }
}

/// Collects the `w:t` runs of `word/document.xml`, one blank line between paragraphs.
pub fn docx_xml_to_text(xml: &str) -> String {
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut chars = xml.chars();

    while let Some(c) = chars.next() {
        if c != '<' {
            if in_text {
                current.push(c);
            }
            continue;
        }

        let mut tag = String::new();
        for tc in chars.by_ref() {
            if tc == '>' {
                break;
            }
            tag.push(tc);
        }

        let self_closing = tag.ends_with('/');
        let name = tag
            .trim_end_matches('/')
            .split_whitespace()
            .next()
            .unwrap_or_default();

        match name {
            "w:t" if !self_closing => in_text = true,
            "/w:t" => in_text = false,
            "w:tab" => current.push('\t'),
            "w:br" | "w:cr" => current.push('\n'),
            "/w:p" => {
                let paragraph = decode_xml_entities(current.trim_end());
                if !paragraph.trim().is_empty() {
                    paragraphs.push(paragraph);
                }
                current.clear();
            }
            _ => {}
        }
    }

    if !current.trim().is_empty() {
        paragraphs.push(decode_xml_entities(current.trim_end()));
    }

    paragraphs.join("\n\n")
}

fn decode_xml_entities(text: &str) -> String {
    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        decoded.push_str(&rest[..start]);
        let tail = &rest[start..];

        let replacement = tail.find(';').and_then(|end| {
            let entity = &tail[1..end];
            let resolved = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                _ => entity
                    .strip_prefix("#x")
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            resolved.map(|c| (c, end))
        });

        match replacement {
            Some((c, end)) => {
                decoded.push(c);
                rest = &tail[end + 1..];
            }
            None => {
                decoded.push('&');
                rest = &tail[1..];
            }
        }
    }

    decoded.push_str(rest);
    decoded
}

fn extract_csv(bytes: &[u8]) -> Result<String, IngestError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let mut rows = Vec::new();

    for record in reader.records() {
        match record {
            Ok(record) => rows.push(
                (0..headers.len())
                    .map(|index| record.get(index).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
            Err(error) => debug!(%error, "skipping unreadable csv row"),
        }
    }

    if rows.is_empty() {
        return Ok(String::new());
    }

    let mut rendered = headers.iter().collect::<Vec<_>>().join(", ");
    rendered.push('\n');
    for row in rows {
        rendered.push_str(&row);
        rendered.push('\n');
    }

    Ok(rendered)
}

fn extract_json(bytes: &[u8]) -> String {
    let raw = decode_text(bytes);
    match serde_json::from_str::<serde_json::Value>(&raw)
        .and_then(|value| serde_json::to_string_pretty(&value))
    {
        Ok(pretty) => pretty,
        Err(error) => {
            debug!(%error, "json did not parse, keeping raw text");
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn docx_bytes(document_xml: &str) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            writer
                .start_file("word/document.xml", zip::write::FileOptions::default())
                .expect("zip entry should start");
            writer
                .write_all(document_xml.as_bytes())
                .expect("zip entry should be written");
            writer.finish().expect("zip should finish");
        }
        buffer.into_inner()
    }

    #[test]
    fn mime_type_takes_precedence_over_extension() {
        assert_eq!(FileKind::detect("application/json", "notes.txt"), FileKind::Json);
        assert_eq!(FileKind::detect("application/pdf", "scan.bin"), FileKind::Pdf);
        assert_eq!(FileKind::detect("application/octet-stream", "report.PDF"), FileKind::Pdf);
        assert_eq!(FileKind::detect("", "table.csv"), FileKind::Csv);
        assert_eq!(FileKind::detect("text/csv", "table"), FileKind::Csv);
        assert_eq!(FileKind::detect("", "archive.tar.gz"), FileKind::Unknown);
    }

    #[test]
    fn docx_mime_is_not_mistaken_for_legacy_doc() {
        assert_eq!(FileKind::detect(DOCX_MIME, "letter"), FileKind::Docx);
        assert_eq!(FileKind::detect("application/msword", "letter"), FileKind::Doc);
    }

    #[test]
    fn html_is_returned_without_stripping_tags() {
        let html = b"<html><body><p>Hello</p></body></html>";
        assert_eq!(
            extract(html, "text/html", "page.html"),
            "<html><body><p>Hello</p></body></html>"
        );
    }

    #[test]
    fn csv_is_rendered_as_comma_joined_lines() {
        let csv = b"name,role\nAda,engineer\nGrace,admiral\n";
        assert_eq!(
            extract(csv, "text/csv", "people.csv"),
            "name, role\nAda, engineer\nGrace, admiral\n"
        );
    }

    #[test]
    fn csv_short_rows_are_padded_and_long_rows_truncated() {
        let csv = b"a,b\n1\n2,3,4\n";
        assert_eq!(extract(csv, "", "x.csv"), "a, b\n1, \n2, 3\n");
    }

    #[test]
    fn csv_without_data_rows_is_empty() {
        assert_eq!(extract(b"only,headers\n", "text/csv", "h.csv"), "");
    }

    #[test]
    fn json_is_pretty_printed_in_source_order() {
        let json = br#"{"zeta":1,"alpha":[true,null]}"#;
        assert_eq!(
            extract(json, "application/json", "data.json"),
            "{\n  \"zeta\": 1,\n  \"alpha\": [\n    true,\n    null\n  ]\n}"
        );
    }

    #[test]
    fn invalid_json_falls_back_to_raw_text() {
        assert_eq!(extract(b"{not json", "application/json", "bad.json"), "{not json");
    }

    #[test]
    fn unknown_binary_yields_empty_string() {
        assert_eq!(extract(&[0xff, 0xfe, 0x00, 0x81], "", "blob.bin"), "");
        assert_eq!(extract(b"plain bytes", "", "blob.bin"), "plain bytes");
    }

    fn pdf_bytes(pages: &[&str]) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Object, Stream};

        let mut document = Document::with_version("1.5");
        let pages_id = document.new_object_id();
        let font_id = document.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = document.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let mut kids: Vec<Object> = Vec::new();
        for text in pages {
            let content = Content {
                operations: vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                    Operation::new("Tj", vec![Object::string_literal(*text)]),
                    Operation::new("ET", vec![]),
                ],
            };
            let content_id = document.add_object(Stream::new(
                dictionary! {},
                content.encode().expect("content should encode"),
            ));
            let page_id = document.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        document.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Count" => kids.len() as i64,
                "Kids" => kids,
            }),
        );
        let catalog_id = document.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        document.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        document.save_to(&mut bytes).expect("pdf should save");
        bytes
    }

    #[test]
    fn pdf_pages_are_joined_with_newlines() {
        let bytes = pdf_bytes(&["First page text", "Second page text"]);

        assert_eq!(
            extract(&bytes, "application/pdf", "report.pdf"),
            "First page text\nSecond page text"
        );
        assert_eq!(
            extract(&bytes, "", "report.pdf"),
            "First page text\nSecond page text"
        );
    }

    #[test]
    fn corrupt_pdf_yields_empty_string() {
        assert_eq!(extract(b"%PDF-1.4\n%broken", "application/pdf", "a.pdf"), "");
    }

    #[test]
    fn legacy_doc_failure_yields_placeholder() {
        assert_eq!(
            extract(b"\xd0\xcf\x11\xe0 not a zip", "application/msword", "old.doc"),
            DOC_PLACEHOLDER
        );
    }

    #[test]
    fn corrupt_docx_yields_empty_string() {
        assert_eq!(extract(b"PK not really", DOCX_MIME, "broken.docx"), "");
    }

    #[test]
    fn docx_paragraphs_are_separated_by_blank_lines() {
        let xml = concat!(
            r#"<w:document><w:body>"#,
            r#"<w:p><w:r><w:t>First</w:t></w:r><w:r><w:t xml:space="preserve"> line</w:t></w:r></w:p>"#,
            r#"<w:p><w:pPr/><w:r><w:t>Tom &amp; Jerry</w:t><w:tab/><w:t>&#233;t&#xE9;</w:t></w:r></w:p>"#,
            r#"<w:p/>"#,
            r#"</w:body></w:document>"#
        );
        let bytes = docx_bytes(xml);

        assert_eq!(
            extract(&bytes, "", "memo.docx"),
            "First line\n\nTom & Jerry\tété"
        );
    }

    #[test]
    fn unknown_entities_are_kept_verbatim() {
        assert_eq!(decode_xml_entities("a &bogus; b & c"), "a &bogus; b & c");
    }

    #[test]
    fn extraction_is_idempotent() {
        let csv = b"k,v\n1,2\n";
        assert_eq!(extract(csv, "text/csv", "a.csv"), extract(csv, "text/csv", "a.csv"));
    }

    #[tokio::test]
    async fn url_extraction_rejects_non_pdf_types() {
        let client = Client::new();
        let text = extract_from_url(&client, "http://127.0.0.1:9/a.txt", "text/plain", "a.txt").await;
        assert_eq!(text, "");
    }

    #[tokio::test]
    async fn url_extraction_rejects_non_http_schemes() {
        let client = Client::new();
        let text =
            extract_from_url(&client, "file:///etc/passwd", "application/pdf", "a.pdf").await;
        assert_eq!(text, "");
    }
}
