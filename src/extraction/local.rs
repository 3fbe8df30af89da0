use std::{
    io::{Cursor, ErrorKind, Read, Seek},
    process::Output,
};

use async_trait::async_trait;
use pdfium_render::prelude::*;
use quick_xml::{events::Event, Reader};
use serde_json::json;
use tempfile::NamedTempFile;
use tokio::{fs, process::Command, task};
use tracing::{debug, warn};
use zip::ZipArchive;

use super::{ExtractionError, ExtractionOutput, TextExtractor};
use crate::models::ExtractionMethod;

/// Below this many characters a PDF text layer is treated as absent.
const MIN_TEXT_LENGTH: usize = 50;

const LEGACY_BINARY_MIME_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.ms-excel",
    "application/rtf",
    "text/rtf",
];

/// Extraction with in-process parsers and locally installed tools
/// (`ocrmypdf`, `tesseract`, the pdfium library).
pub struct LocalExtractor {
    tesseract_lang: String,
}

impl LocalExtractor {
    pub fn new() -> Self {
        Self {
            tesseract_lang: "eng".to_string(),
        }
    }

    pub fn with_language(mut self, lang: &str) -> Self {
        self.tesseract_lang = lang.to_string();
        self
    }
}

impl Default for LocalExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextExtractor for LocalExtractor {
    async fn extract(
        &self,
        method: ExtractionMethod,
        bytes: Vec<u8>,
        mime_type: &str,
        size_hint: u64,
    ) -> Result<ExtractionOutput, ExtractionError> {
        debug!(%method, mime_type, size_hint, "extracting text");
        let mime = mime_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        let lang = self.tesseract_lang.as_str();
        match method {
            ExtractionMethod::DirectText => Ok(output(decode_text(&bytes), "text", None)),
            ExtractionMethod::OfficeDocument | ExtractionMethod::Spreadsheet => {
                if mime == "text/csv" || mime.starts_with("text/plain") {
                    return Ok(output(decode_text(&bytes), "text", None));
                }
                let text = blocking(move || archive_text(&bytes, &mime)).await??;
                Ok(output(text, "office-xml", None))
            }
            ExtractionMethod::FastPdf => pdf_with_ocr_fallback(bytes, lang, false).await,
            ExtractionMethod::SyncOcr | ExtractionMethod::AsyncOcr => {
                if mime == "application/pdf" || bytes.starts_with(b"%PDF") {
                    pdf_with_ocr_fallback(bytes, lang, true).await
                } else {
                    let text = tesseract_image(&bytes, lang).await?;
                    Ok(output(text, "tesseract", None))
                }
            }
        }
    }
}

/// In-process parsers run on the blocking pool. External tools are awaited
/// as child processes that are killed when the extraction future is dropped,
/// so a timed out attempt does not leave OCR running.
async fn blocking<T, F>(work: F) -> Result<T, ExtractionError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task::spawn_blocking(work)
        .await
        .map_err(|err| ExtractionError::Failed(format!("extraction task panicked: {err}")))
}

fn output(text: String, source: &str, page_count: Option<usize>) -> ExtractionOutput {
    let success = !text.trim().is_empty();
    ExtractionOutput {
        metadata: json!({
            "source": source,
            "page_count": page_count,
        }),
        text,
        success,
    }
}

fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Uses the embedded text layer when it is substantial, OCR otherwise. With
/// `require_ocr` unset a missing OCR tool degrades to the sparse text layer.
async fn pdf_with_ocr_fallback(
    bytes: Vec<u8>,
    lang: &str,
    require_ocr: bool,
) -> Result<ExtractionOutput, ExtractionError> {
    let (bytes, layer) = blocking(move || {
        let layer = pdf_text(&bytes);
        (bytes, layer)
    })
    .await?;
    let (layer, pages) = match layer {
        Ok(found) => found,
        Err(ExtractionError::ToolNotFound(tool)) => {
            warn!(%tool, "pdf text layer unavailable; going straight to ocr");
            (String::new(), 0)
        }
        Err(err) => return Err(err),
    };
    if layer.trim().chars().count() >= MIN_TEXT_LENGTH {
        return Ok(output(layer, "pdf-text", Some(pages)));
    }

    match ocrmypdf(&bytes, lang).await {
        Ok(text) => Ok(output(text, "ocr", Some(pages).filter(|count| *count > 0))),
        Err(ExtractionError::ToolNotFound(tool)) if !require_ocr => {
            warn!(%tool, "ocr not installed; keeping sparse pdf text layer");
            Ok(output(layer, "pdf-text", Some(pages)))
        }
        Err(err) => Err(err),
    }
}

fn pdf_text(bytes: &[u8]) -> Result<(String, usize), ExtractionError> {
    let bindings = Pdfium::bind_to_system_library()
        .map_err(|err| ExtractionError::ToolNotFound(format!("pdfium library: {err}")))?;
    let pdfium = Pdfium::new(bindings);
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|err| ExtractionError::Corrupt(format!("load pdf: {err}")))?;

    let mut combined = String::new();
    let pages = document.pages();
    for page in pages.iter() {
        if let Ok(text) = page.text() {
            combined.push_str(&text.all());
            combined.push('\n');
        }
    }
    Ok((combined, pages.len() as usize))
}

async fn ocrmypdf(bytes: &[u8], lang: &str) -> Result<String, ExtractionError> {
    let input = NamedTempFile::new()?;
    fs::write(input.path(), bytes).await?;
    let output_pdf = NamedTempFile::new()?;
    let sidecar = NamedTempFile::new()?;

    let result = Command::new("ocrmypdf")
        .arg("--sidecar")
        .arg(sidecar.path())
        .arg("--skip-text")
        .args(["-l", lang])
        .arg(input.path())
        .arg(output_pdf.path())
        .kill_on_drop(true)
        .output()
        .await;
    command_stdout(result, "ocrmypdf")?;
    Ok(fs::read_to_string(sidecar.path()).await?)
}

async fn tesseract_image(bytes: &[u8], lang: &str) -> Result<String, ExtractionError> {
    let input = NamedTempFile::new()?;
    fs::write(input.path(), bytes).await?;

    let result = Command::new("tesseract")
        .arg(input.path())
        .arg("stdout")
        .args(["-l", lang])
        .kill_on_drop(true)
        .output()
        .await;
    command_stdout(result, "tesseract")
}

fn command_stdout(
    result: std::io::Result<Output>,
    tool: &str,
) -> Result<String, ExtractionError> {
    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => Err(ExtractionError::Failed(format!(
            "{tool} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(ExtractionError::ToolNotFound(tool.to_string()))
        }
        Err(err) => Err(ExtractionError::Io(err)),
    }
}

/// Text of the zip based office formats: OOXML documents and workbooks and
/// OpenDocument text and spreadsheets.
fn archive_text(bytes: &[u8], mime: &str) -> Result<String, ExtractionError> {
    let mut archive = match ZipArchive::new(Cursor::new(bytes)) {
        Ok(archive) => archive,
        Err(err) if LEGACY_BINARY_MIME_TYPES.contains(&mime) => {
            return Err(ExtractionError::Unsupported(format!(
                "{mime} is not a zip based format: {err}"
            )))
        }
        Err(err) => return Err(ExtractionError::Corrupt(format!("open archive: {err}"))),
    };

    if let Some(xml) = read_entry(&mut archive, "word/document.xml")? {
        return xml_text(&xml, &[b"t"], &[b"p"]);
    }
    if let Some(xml) = read_entry(&mut archive, "content.xml")? {
        return xml_text(&xml, &[], &[b"p", b"h"]);
    }
    if archive.by_name("xl/workbook.xml").is_ok() {
        return workbook_text(&mut archive);
    }
    Err(ExtractionError::Unsupported(format!(
        "archive of type {mime} has no known text part"
    )))
}

fn workbook_text<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<String, ExtractionError> {
    let mut text = String::new();
    if let Some(xml) = read_entry(archive, "xl/sharedStrings.xml")? {
        text.push_str(&xml_text(&xml, &[b"t"], &[b"si"])?);
    }

    let mut sheets: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("xl/worksheets/") && name.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    sheets.sort();
    for sheet in sheets {
        if let Some(xml) = read_entry(archive, &sheet)? {
            text.push_str(&sheet_text(&xml)?);
        }
    }
    Ok(text)
}

/// Inline strings and literal values of a worksheet, one tab separated line
/// per row. Cells pointing into the shared string table are skipped.
fn sheet_text(xml: &str) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = String::new();
    let mut shared_cell = false;
    let mut capture = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => match element.local_name().as_ref() {
                b"c" => {
                    shared_cell = element.attributes().flatten().any(|attr| {
                        attr.key.as_ref() == b"t" && attr.value.as_ref() == b"s"
                    });
                }
                b"v" => capture = !shared_cell,
                b"t" => capture = true,
                _ => {}
            },
            Ok(Event::End(element)) => match element.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if !cell.trim().is_empty() {
                        row.push(std::mem::take(&mut cell));
                    }
                    cell.clear();
                }
                b"row" => {
                    if !row.is_empty() {
                        text.push_str(&row.join("\t"));
                        text.push('\n');
                        row.clear();
                    }
                }
                _ => {}
            },
            Ok(Event::Text(content)) if capture => {
                let decoded = content
                    .unescape()
                    .map_err(|err| ExtractionError::Corrupt(format!("xml text: {err}")))?;
                cell.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ExtractionError::Corrupt(format!("xml parse: {err}"))),
        }
    }
    Ok(text)
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, ExtractionError> {
    let mut entry = match archive.by_name(name) {
        Ok(entry) => entry,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(err) => return Err(ExtractionError::Corrupt(format!("read {name}: {err}"))),
    };
    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|err| ExtractionError::Corrupt(format!("read {name}: {err}")))?;
    Ok(Some(xml))
}

/// Collects character data. With `text_tags` empty every text node counts;
/// otherwise only text inside those elements. A newline closes each element
/// named in `break_tags`.
fn xml_text(xml: &str, text_tags: &[&[u8]], break_tags: &[&[u8]]) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut text = String::new();
    let mut depth = 0usize;
    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if text_tags.contains(&element.local_name().as_ref()) {
                    depth += 1;
                }
            }
            Ok(Event::End(element)) => {
                let name = element.local_name();
                if text_tags.contains(&name.as_ref()) {
                    depth = depth.saturating_sub(1);
                }
                if break_tags.contains(&name.as_ref()) && !text.ends_with('\n') && !text.is_empty() {
                    text.push('\n');
                }
            }
            Ok(Event::Text(content)) if text_tags.is_empty() || depth > 0 => {
                let decoded = content
                    .unescape()
                    .map_err(|err| ExtractionError::Corrupt(format!("xml text: {err}")))?;
                if text_tags.is_empty() && decoded.trim().is_empty() {
                    continue;
                }
                text.push_str(&decoded);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => return Err(ExtractionError::Corrupt(format!("xml parse: {err}"))),
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use zip::{write::SimpleFileOptions, ZipWriter};

    use super::*;

    fn extract_now(
        method: ExtractionMethod,
        bytes: &[u8],
        mime: &str,
        lang: &str,
    ) -> Result<ExtractionOutput, ExtractionError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        runtime.block_on(LocalExtractor::new().with_language(lang).extract(
            method,
            bytes.to_vec(),
            mime,
            bytes.len() as u64,
        ))
    }

    fn zipped(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn direct_text_strips_byte_order_mark() {
        let output = extract_now(
            ExtractionMethod::DirectText,
            b"\xEF\xBB\xBFhello world",
            "text/plain",
            "eng",
        )
        .unwrap();
        assert_eq!(output.text, "hello world");
        assert!(output.success);
        assert_eq!(output.metadata["source"], "text");
    }

    #[test]
    fn empty_text_is_not_a_success() {
        let output =
            extract_now(ExtractionMethod::DirectText, b"  \n", "text/plain", "eng").unwrap();
        assert!(!output.success);
    }

    #[test]
    fn reads_docx_paragraphs() {
        let bytes = zipped(&[(
            "word/document.xml",
            r#"<w:document xmlns:w="urn:w"><w:body>
                <w:p><w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p>
                <w:p><w:r><w:t>Q&amp;A</w:t></w:r></w:p>
            </w:body></w:document>"#,
        )]);
        let output = extract_now(
            ExtractionMethod::OfficeDocument,
            &bytes,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            "eng",
        )
        .unwrap();
        assert_eq!(output.text, "Quarterly report\nQ&A\n");
    }

    #[test]
    fn reads_opendocument_text() {
        let bytes = zipped(&[(
            "content.xml",
            r#"<office:document-content xmlns:office="urn:o" xmlns:text="urn:t"><office:body><office:text>
                <text:h>Title</text:h><text:p>Body line</text:p>
            </office:text></office:body></office:document-content>"#,
        )]);
        let output = extract_now(
            ExtractionMethod::OfficeDocument,
            &bytes,
            "application/vnd.oasis.opendocument.text",
            "eng",
        )
        .unwrap();
        assert_eq!(output.text, "Title\nBody line\n");
    }

    #[test]
    fn reads_workbook_strings_and_values() {
        let bytes = zipped(&[
            ("xl/workbook.xml", "<workbook/>"),
            (
                "xl/sharedStrings.xml",
                "<sst><si><t>Revenue</t></si><si><t>Costs</t></si></sst>",
            ),
            (
                "xl/worksheets/sheet1.xml",
                r#"<worksheet><sheetData><row><c t="s"><v>0</v></c><c><v>1200</v></c></row></sheetData></worksheet>"#,
            ),
        ]);
        let output = extract_now(
            ExtractionMethod::Spreadsheet,
            &bytes,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            "eng",
        )
        .unwrap();
        assert_eq!(output.text, "Revenue\nCosts\n1200\n");
    }

    #[test]
    fn csv_is_read_as_text() {
        let output =
            extract_now(ExtractionMethod::Spreadsheet, b"a,b\n1,2\n", "text/csv", "eng")
                .unwrap();
        assert_eq!(output.text, "a,b\n1,2\n");
    }

    #[test]
    fn legacy_binary_formats_are_unsupported() {
        let err = extract_now(
            ExtractionMethod::OfficeDocument,
            b"\xD0\xCF\x11\xE0 not a zip",
            "application/msword",
            "eng",
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::Unsupported(_)));
        assert!(err.is_permanent());
    }

    #[test]
    fn garbage_office_document_is_corrupt() {
        let err = extract_now(
            ExtractionMethod::OfficeDocument,
            b"definitely not a zip",
            "application/vnd.oasis.opendocument.text",
            "eng",
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt(_)));
    }
}
