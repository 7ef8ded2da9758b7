//! Combining per-page decisions into one ordered document, and slicing that
//! document into chunks.
//!
//! [`CombinedDocument`] is the structured source of truth. The text produced by
//! [`CombinedDocument::render_report`] is for humans and is never parsed back.

use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    extract::{PageText, TextSource},
    select::SelectionDecision,
};

/// How many pages go in a chunk, unless the caller says otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 4;

/// Errors assembling or chunking a document. All of these indicate a bug in
/// whatever produced the decisions.
#[derive(Debug, Error, PartialEq)]
pub enum AssembleError {
    /// A page in range has no decision.
    #[error("no selection decision for page {0}")]
    MissingPage(usize),

    /// A decision refers to a page outside the document.
    #[error("decision for page {page} is outside the range 1..={page_count}")]
    UnexpectedPage { page: usize, page_count: usize },

    /// Two decisions for one page.
    #[error("more than one selection decision for page {0}")]
    DuplicateDecision(usize),

    /// A decision picked text that was never extracted.
    #[error("page {page} selected {text_source} text, but none was extracted")]
    MissingText {
        page: usize,
        text_source: TextSource,
    },

    #[error("chunk size must be at least 1")]
    InvalidChunkSize,
}

/// Every [`PageText`] extracted for a document, keyed by page and source.
#[derive(Clone, Debug, Default)]
pub struct PageTexts {
    texts: HashMap<(usize, TextSource), PageText>,
}

impl PageTexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a page, replacing any earlier text from the same source.
    pub fn insert(&mut self, page: PageText) {
        self.texts.insert((page.page_number(), page.source()), page);
    }

    pub fn get(&self, page_number: usize, source: TextSource) -> Option<&PageText> {
        self.texts.get(&(page_number, source))
    }
}

impl FromIterator<PageText> for PageTexts {
    fn from_iter<I: IntoIterator<Item = PageText>>(iter: I) -> Self {
        let mut texts = Self::new();
        for page in iter {
            texts.insert(page);
        }
        texts
    }
}

/// One page of a [`CombinedDocument`].
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CombinedPage {
    /// The 1-based page number.
    pub page_number: usize,

    /// Where this page's text came from.
    pub source: TextSource,

    /// The selected text, exactly as extracted.
    pub text: String,

    /// Why this text was chosen.
    pub selection_reason: String,

    /// The confidence score of the selected text.
    pub confidence: f64,

    /// Number of characters in `text`.
    pub char_count: usize,
}

/// The best available text for every page of a document, in page order.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct CombinedDocument {
    pages: Vec<CombinedPage>,
    generated_at: DateTime<Utc>,
}

impl CombinedDocument {
    /// Our pages, strictly increasing by page number with no gaps.
    pub fn pages(&self) -> &[CombinedPage] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Recover the decision behind each page.
    pub fn decisions(&self) -> Vec<SelectionDecision> {
        self.pages
            .iter()
            .map(|page| SelectionDecision {
                page_number: page.page_number,
                selected_source: page.source,
                reason: page.selection_reason.clone(),
                confidence: page.confidence,
            })
            .collect()
    }

    /// Render a plain-text report with every page's provenance and text.
    pub fn render_report(&self) -> String {
        let rule = "=".repeat(80);
        let thin_rule = "-".repeat(80);
        let mut out = String::new();
        // `write!` to a `String` can't fail.
        let _ = writeln!(out, "COMBINED DOCUMENT");
        let _ = writeln!(out, "Generated: {}", self.generated_at.to_rfc3339());
        let _ = writeln!(out, "Pages: {}", self.pages.len());
        let _ = writeln!(out, "{rule}");
        for page in &self.pages {
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", page_marker(page.page_number, page.source));
            let _ = writeln!(out, "Reason: {}", page.selection_reason);
            let _ = writeln!(out, "Confidence: {:.1}", page.confidence);
            let _ = writeln!(out, "Characters: {}", page.char_count);
            let _ = writeln!(out, "Lines: {}", page.text.lines().count());
            let _ = writeln!(out, "{thin_rule}");
            let _ = writeln!(out, "{}", page.text);
        }
        out
    }
}

/// A run of consecutive pages, sized for a downstream consumer.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Chunk {
    /// 1-based, sequential.
    pub chunk_number: usize,

    /// The pages in this chunk, in order.
    pub page_numbers: Vec<usize>,

    /// The source of each page in `page_numbers`.
    pub sources: Vec<TextSource>,

    /// Page texts, each preceded by a page marker.
    pub text: String,

    /// Number of characters in `text`.
    pub char_count: usize,
}

/// The line that introduces each page in chunks and reports.
pub fn page_marker(page_number: usize, source: TextSource) -> String {
    format!("=== PAGE {page_number} ({source}) ===")
}

/// Build a [`CombinedDocument`] from one decision per page.
///
/// Decisions may arrive in any order.
pub fn assemble(
    page_count: usize,
    decisions: Vec<SelectionDecision>,
    texts: &PageTexts,
) -> Result<CombinedDocument, AssembleError> {
    let mut by_page = BTreeMap::new();
    for decision in decisions {
        let page = decision.page_number;
        if page == 0 || page > page_count {
            return Err(AssembleError::UnexpectedPage { page, page_count });
        }
        if by_page.insert(page, decision).is_some() {
            return Err(AssembleError::DuplicateDecision(page));
        }
    }

    let pages = (1..=page_count)
        .map(|page_number| {
            let decision = by_page
                .remove(&page_number)
                .ok_or(AssembleError::MissingPage(page_number))?;
            let text = texts
                .get(page_number, decision.selected_source)
                .ok_or(AssembleError::MissingText {
                    page: page_number,
                    text_source: decision.selected_source,
                })?;
            Ok(CombinedPage {
                page_number,
                source: decision.selected_source,
                text: text.text().to_owned(),
                selection_reason: decision.reason,
                confidence: decision.confidence,
                char_count: text.char_count(),
            })
        })
        .collect::<Result<Vec<_>, AssembleError>>()?;

    Ok(CombinedDocument {
        pages,
        generated_at: Utc::now(),
    })
}

/// Split a document into chunks of `chunk_size` pages. The last chunk may be
/// smaller.
pub fn chunk(
    document: &CombinedDocument,
    chunk_size: usize,
) -> Result<Vec<Chunk>, AssembleError> {
    if chunk_size == 0 {
        return Err(AssembleError::InvalidChunkSize);
    }
    Ok(document
        .pages
        .chunks(chunk_size)
        .enumerate()
        .map(|(idx, pages)| {
            let text = pages
                .iter()
                .map(|page| {
                    format!(
                        "{}\n{}",
                        page_marker(page.page_number, page.source),
                        page.text
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            Chunk {
                chunk_number: idx + 1,
                page_numbers: pages.iter().map(|p| p.page_number).collect(),
                sources: pages.iter().map(|p| p.source).collect(),
                char_count: text.chars().count(),
                text,
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(page_number: usize, source: TextSource) -> SelectionDecision {
        SelectionDecision {
            page_number,
            selected_source: source,
            reason: format!("picked {source}"),
            confidence: 50.0 + page_number as f64,
        }
    }

    /// Native and OCR text for pages `1..=n`, plus a decision per page.
    fn fixture(n: usize) -> (Vec<SelectionDecision>, PageTexts) {
        let mut texts = PageTexts::new();
        let mut decisions = vec![];
        for page in 1..=n {
            texts.insert(PageText::new(page, TextSource::NativeExtraction, format!("native {page}")));
            texts.insert(PageText::new(page, TextSource::Ocr, format!("ocr {page}\n  indented")));
            let source = if page % 3 == 0 {
                TextSource::Ocr
            } else {
                TextSource::NativeExtraction
            };
            decisions.push(decision(page, source));
        }
        (decisions, texts)
    }

    #[test]
    fn pages_are_sorted() {
        let (mut decisions, texts) = fixture(5);
        decisions.reverse();
        let document = assemble(5, decisions, &texts).unwrap();
        let numbers = document.pages().iter().map(|p| p.page_number).collect::<Vec<_>>();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert_eq!(document.page_count(), 5);
    }

    #[test]
    fn missing_page_is_an_error() {
        let (mut decisions, texts) = fixture(4);
        decisions.remove(1);
        assert_eq!(
            assemble(4, decisions, &texts).unwrap_err(),
            AssembleError::MissingPage(2)
        );
    }

    #[test]
    fn bad_decisions_are_errors() {
        let (mut decisions, texts) = fixture(2);
        decisions.push(decision(2, TextSource::Ocr));
        assert_eq!(
            assemble(2, decisions, &texts).unwrap_err(),
            AssembleError::DuplicateDecision(2)
        );

        let (mut decisions, texts) = fixture(2);
        decisions.push(decision(3, TextSource::Ocr));
        assert_eq!(
            assemble(2, decisions, &texts).unwrap_err(),
            AssembleError::UnexpectedPage {
                page: 3,
                page_count: 2
            }
        );

        let texts = PageTexts::from_iter([PageText::new(1, TextSource::NativeExtraction, "x")]);
        assert_eq!(
            assemble(1, vec![decision(1, TextSource::Ocr)], &texts).unwrap_err(),
            AssembleError::MissingText {
                page: 1,
                text_source: TextSource::Ocr
            }
        );
    }

    #[test]
    fn decisions_round_trip() {
        let (decisions, texts) = fixture(7);
        let document = assemble(7, decisions.clone(), &texts).unwrap();
        assert_eq!(document.decisions(), decisions);
        for page in document.pages() {
            let original = texts.get(page.page_number, page.source).unwrap();
            assert_eq!(page.text, original.text());
            assert_eq!(page.char_count, original.char_count());
        }
    }

    #[test]
    fn ten_pages_in_chunks_of_four() {
        let (decisions, texts) = fixture(10);
        let document = assemble(10, decisions, &texts).unwrap();
        let chunks = chunk(&document, DEFAULT_CHUNK_SIZE).unwrap();
        let groups = chunks.iter().map(|c| c.page_numbers.clone()).collect::<Vec<_>>();
        assert_eq!(groups, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8], vec![9, 10]]);
        assert_eq!(
            chunks.iter().map(|c| c.chunk_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        let mut all = groups.concat();
        all.dedup();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn chunk_text_has_page_markers() {
        let (decisions, texts) = fixture(3);
        let document = assemble(3, decisions, &texts).unwrap();
        let chunks = chunk(&document, 2).unwrap();
        assert_eq!(
            chunks[0].text,
            "=== PAGE 1 (native) ===\nnative 1\n\n=== PAGE 2 (native) ===\nnative 2"
        );
        assert_eq!(chunks[1].text, "=== PAGE 3 (ocr) ===\nocr 3\n  indented");
        assert_eq!(chunks[1].sources, vec![TextSource::Ocr]);
        assert_eq!(chunks[0].char_count, chunks[0].text.chars().count());
    }

    #[test]
    fn chunk_text_keeps_page_whitespace() {
        let mut texts = PageTexts::new();
        texts.insert(PageText::new(1, TextSource::NativeExtraction, "Premium $100\n\n   "));
        texts.insert(PageText::new(2, TextSource::NativeExtraction, "  Deductible $500\n"));
        let decisions = vec![
            decision(1, TextSource::NativeExtraction),
            decision(2, TextSource::NativeExtraction),
        ];
        let document = assemble(2, decisions, &texts).unwrap();
        let chunks = chunk(&document, 1).unwrap();
        assert_eq!(chunks[0].text, "=== PAGE 1 (native) ===\nPremium $100\n\n   ");
        assert_eq!(chunks[1].text, "=== PAGE 2 (native) ===\n  Deductible $500\n");

        let chunks = chunk(&document, 2).unwrap();
        assert_eq!(
            chunks[0].text,
            "=== PAGE 1 (native) ===\nPremium $100\n\n   \n\n=== PAGE 2 (native) ===\n  Deductible $500\n"
        );
    }

    #[test]
    fn zero_chunk_size_is_an_error() {
        let (decisions, texts) = fixture(1);
        let document = assemble(1, decisions, &texts).unwrap();
        assert_eq!(chunk(&document, 0).unwrap_err(), AssembleError::InvalidChunkSize);
    }

    #[test]
    fn report_includes_provenance() {
        let (decisions, texts) = fixture(3);
        let report = assemble(3, decisions, &texts).unwrap().render_report();
        assert!(report.contains("Pages: 3"));
        assert!(report.contains("=== PAGE 3 (ocr) ==="));
        assert!(report.contains("Reason: picked ocr"));
        assert!(report.contains("Confidence: 53.0"));
        assert!(report.contains("Characters: 16"));
        assert!(report.contains("Lines: 2"));
        assert!(report.contains("ocr 3\n  indented"));
    }
}
