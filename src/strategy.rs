//! Maps file characteristics to an extraction method, a priority and a
//! sync/async decision. Everything here is pure.

use serde::{Deserialize, Serialize};

use crate::models::{ExtractionMethod, FileType};

pub const MB: u64 = 1_048_576;

const BASE_PRIORITY: i32 = 5;
const MIN_PRIORITY: i32 = 1;
const MAX_PRIORITY: i32 = 10;

const URGENT_KEYWORDS: &[&str] = &["urgent", "asap", "critical", "important", "priority"];
const BACKUP_KEYWORDS: &[&str] = &["backup", "archive"];

const OFFICE_MIME_TYPES: &[&str] = &[
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.oasis.opendocument.text",
    "application/rtf",
    "text/rtf",
];

const SPREADSHEET_MIME_TYPES: &[&str] = &[
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.oasis.opendocument.spreadsheet",
    "text/csv",
];

#[derive(Debug, Clone, Copy)]
pub struct FileCharacteristics<'a> {
    pub mime_type: &'a str,
    pub size_bytes: u64,
    pub file_name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionPlan {
    pub method: ExtractionMethod,
    pub priority: i32,
    pub use_async: bool,
    pub estimated_duration_ms: u64,
}

impl ExtractionPlan {
    fn new(method: ExtractionMethod, priority: i32, use_async: bool, estimated_ms: u64) -> Self {
        Self {
            method,
            priority,
            use_async,
            estimated_duration_ms: estimated_ms,
        }
    }
}

pub fn classify(file: &FileCharacteristics<'_>) -> ExtractionPlan {
    let mime = normalize_mime(file.mime_type);
    let mut plan = plan_for_mime(&mime, file.size_bytes)
        .or_else(|| {
            guess_mime(file.file_name).and_then(|guessed| plan_for_mime(&guessed, file.size_bytes))
        })
        .unwrap_or_else(|| {
            ExtractionPlan::new(ExtractionMethod::DirectText, BASE_PRIORITY, false, 5_000)
        });

    let name = file.file_name.to_lowercase();
    if URGENT_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
        plan.priority = (plan.priority + 2).min(MAX_PRIORITY);
    }
    if BACKUP_KEYWORDS.iter().any(|keyword| name.contains(keyword)) {
        plan.priority = (plan.priority - 1).max(MIN_PRIORITY);
    }
    plan
}

/// Coarse file type recorded on the file row at upload.
pub fn logical_file_type(mime_type: &str, file_name: &str) -> FileType {
    let mime = normalize_mime(mime_type);
    let resolved = if mime_family(&mime).is_some() {
        mime
    } else {
        guess_mime(file_name).unwrap_or(mime)
    };
    mime_family(&resolved).unwrap_or(FileType::Other)
}

fn plan_for_mime(mime: &str, size: u64) -> Option<ExtractionPlan> {
    use ExtractionMethod::*;

    let plan = match mime_family(mime)? {
        FileType::Pdf if size > 10 * MB => ExtractionPlan::new(AsyncOcr, 7, true, 30_000),
        FileType::Pdf if size >= MB => ExtractionPlan::new(SyncOcr, 6, false, 10_000),
        FileType::Pdf => ExtractionPlan::new(FastPdf, 5, false, 3_000),
        FileType::Image if size > 5 * MB => ExtractionPlan::new(AsyncOcr, 8, true, 25_000),
        FileType::Image => ExtractionPlan::new(SyncOcr, 7, false, 15_000),
        FileType::Document => ExtractionPlan::new(OfficeDocument, 4, false, 2_000),
        FileType::Spreadsheet => ExtractionPlan::new(Spreadsheet, 4, false, 3_000),
        FileType::Text => ExtractionPlan::new(DirectText, 3, false, 1_000),
        FileType::Other => return None,
    };
    Some(plan)
}

fn mime_family(mime: &str) -> Option<FileType> {
    if mime == "application/pdf" {
        Some(FileType::Pdf)
    } else if mime.starts_with("image/") {
        Some(FileType::Image)
    } else if OFFICE_MIME_TYPES.contains(&mime) {
        Some(FileType::Document)
    } else if SPREADSHEET_MIME_TYPES.contains(&mime) {
        Some(FileType::Spreadsheet)
    } else if mime.starts_with("text/") {
        Some(FileType::Text)
    } else {
        None
    }
}

fn normalize_mime(raw: &str) -> String {
    raw.split(';').next().unwrap_or_default().trim().to_ascii_lowercase()
}

fn guess_mime(file_name: &str) -> Option<String> {
    mime_guess::from_path(file_name)
        .first()
        .map(|guessed| guessed.essence_str().to_ascii_lowercase())
}
