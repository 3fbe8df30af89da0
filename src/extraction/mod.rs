//! Text extraction seam.
//!
//! Workers hand the stored bytes and the planned method to a
//! [`TextExtractor`]; the local implementation shells out to OCR tools and
//! parses office formats in process.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::ExtractionMethod;

pub mod local;

pub use local::LocalExtractor;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("external tool not found: {0}")]
    ToolNotFound(String),
    #[error("unsupported input: {0}")]
    Unsupported(String),
    #[error("corrupt input: {0}")]
    Corrupt(String),
    #[error("extraction failed: {0}")]
    Failed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractionError {
    /// The input itself can never be extracted; retrying is pointless.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ExtractionError::Unsupported(_) | ExtractionError::Corrupt(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub text: String,
    /// Tool specific details: source, page count, confidence.
    pub metadata: Value,
    pub success: bool,
}

impl ExtractionOutput {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    pub fn character_count(&self) -> usize {
        self.text.chars().count()
    }
}

#[async_trait]
pub trait TextExtractor: Send + Sync + 'static {
    async fn extract(
        &self,
        method: ExtractionMethod,
        bytes: Vec<u8>,
        mime_type: &str,
        size_hint: u64,
    ) -> Result<ExtractionOutput, ExtractionError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn only_input_errors_are_permanent() {
        assert!(ExtractionError::Corrupt("bad zip".into()).is_permanent());
        assert!(ExtractionError::Unsupported("application/msword".into()).is_permanent());
        assert!(!ExtractionError::ToolNotFound("tesseract".into()).is_permanent());
        assert!(!ExtractionError::Failed("exit 1".into()).is_permanent());
    }

    #[test]
    fn counts_words_and_characters() {
        let output = ExtractionOutput {
            text: "héllo  wide\nworld".into(),
            metadata: json!({}),
            success: true,
        };
        assert_eq!(output.word_count(), 3);
        assert_eq!(output.character_count(), 17);
    }
}
