//! Per-page text extraction.
//!
//! We have two kinds of extractors: a cheap one that reads the PDF's embedded
//! text layer, and an expensive one that rasterizes the page and runs OCR.
//! Both produce [`PageText`] values, which are scored identically.

use std::{fmt, io};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::Document;

pub mod pdftotext;
pub mod tesseract;

/// Errors that can occur while extracting text from a page.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The caller asked for a page that doesn't exist.
    #[error("page {page} is outside the range 1..={total_pages}")]
    InvalidPageIndex { page: usize, total_pages: usize },

    /// The document (or one of its pages) could not be parsed.
    #[error("document {document_id} could not be parsed: {details}")]
    CorruptDocument {
        document_id: String,
        details: String,
    },

    /// OCR could not be initialized, or could not process a page.
    #[error("OCR unavailable: {0}")]
    OcrUnavailable(String),

    /// A required external tool could not be run.
    #[error("could not run {tool}: {details}")]
    ToolUnavailable { tool: &'static str, details: String },

    /// Local I/O failed while preparing a document for extraction.
    #[error("I/O error while preparing document {document_id}")]
    Io {
        document_id: String,
        #[source]
        source: io::Error,
    },
}

impl ExtractError {
    /// Does this error apply to the whole document, rather than one page?
    pub fn is_document_level(&self) -> bool {
        matches!(self, ExtractError::InvalidPageIndex { .. } | ExtractError::Io { .. })
    }
}

/// Where did a page's text come from?
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    /// The PDF's embedded text layer.
    NativeExtraction,
    /// Optical character recognition.
    Ocr,
}

impl fmt::Display for TextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextSource::NativeExtraction => write!(f, "native"),
            TextSource::Ocr => write!(f, "ocr"),
        }
    }
}

/// Text extracted from one page using one method. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageText {
    page_number: usize,
    source: TextSource,
    text: String,
    char_count: usize,
}

impl PageText {
    /// Create a new page of text.
    pub fn new(page_number: usize, source: TextSource, text: impl Into<String>) -> Self {
        let text = text.into();
        let char_count = text.chars().count();
        Self {
            page_number,
            source,
            text,
            char_count,
        }
    }

    /// The 1-based page number.
    pub fn page_number(&self) -> usize {
        self.page_number
    }

    pub fn source(&self) -> TextSource {
        self.source
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// The number of characters (not bytes) in [`Self::text`].
    pub fn char_count(&self) -> usize {
        self.char_count
    }
}

/// Extracts the embedded text layer from a single page.
///
/// Pages with no text layer must return an empty string, not an error.
#[async_trait]
pub trait NativeExtractor: Send + Sync + 'static {
    /// Extract text from a 1-based page number.
    async fn extract(
        &self,
        document: &Document,
        page_number: usize,
    ) -> Result<String, ExtractError>;
}

/// Rasterizes a single page and recognizes its text.
///
/// If recognition is poor, this should return whatever partial text it found.
#[async_trait]
pub trait OcrExtractor: Send + Sync + 'static {
    /// OCR a 1-based page number.
    async fn extract_via_ocr(
        &self,
        document: &Document,
        page_number: usize,
    ) -> Result<String, ExtractError>;
}
