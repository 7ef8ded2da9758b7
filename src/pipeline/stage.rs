//! The stages a document passes through, in order.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::prelude::*;

use super::PipelineError;

/// Where a document is in the pipeline.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    /// Native text has been extracted from every page.
    Extracted,
    /// Every page has a quality label.
    Classified,
    /// At least one page was sent to OCR.
    OcrPending,
    /// No page needed OCR.
    OcrSkipped,
    /// Every page has a selection decision.
    Selected,
    /// The combined document exists.
    Assembled,
    /// The combined document has been chunked. Final.
    Chunked,
}

impl DocumentStage {
    /// Is `next` a legal successor of `self`?
    pub fn can_advance_to(self, next: DocumentStage) -> bool {
        use DocumentStage::*;
        matches!(
            (self, next),
            (Extracted, Classified)
                | (Classified, OcrPending)
                | (Classified, OcrSkipped)
                | (OcrPending, Selected)
                | (OcrSkipped, Selected)
                | (Selected, Assembled)
                | (Assembled, Chunked)
        )
    }
}

impl fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DocumentStage::Extracted => "extracted",
            DocumentStage::Classified => "classified",
            DocumentStage::OcrPending => "OCR pending",
            DocumentStage::OcrSkipped => "OCR skipped",
            DocumentStage::Selected => "selected",
            DocumentStage::Assembled => "assembled",
            DocumentStage::Chunked => "chunked",
        };
        f.write_str(name)
    }
}

/// Tracks one document's progress, refusing to move backwards or skip ahead.
#[derive(Debug)]
pub struct StageTracker {
    document_id: String,
    history: Vec<DocumentStage>,
}

impl StageTracker {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            history: vec![],
        }
    }

    /// The most recent stage, if any.
    pub fn current(&self) -> Option<DocumentStage> {
        self.history.last().copied()
    }

    /// Move to the next stage.
    pub fn advance(&mut self, next: DocumentStage) -> Result<(), PipelineError> {
        let allowed = match self.current() {
            None => next == DocumentStage::Extracted,
            Some(current) => current.can_advance_to(next),
        };
        if !allowed {
            return Err(PipelineError::InvalidTransition {
                document_id: self.document_id.clone(),
                from: self.current(),
                to: next,
            });
        }
        debug!(id = %self.document_id, stage = %next, "Document advanced");
        self.history.push(next);
        Ok(())
    }

    /// Is the document finished?
    pub fn is_complete(&self) -> bool {
        self.current() == Some(DocumentStage::Chunked)
    }

    /// Consume the tracker, returning every stage visited.
    pub fn into_history(self) -> Vec<DocumentStage> {
        self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use DocumentStage::*;

    #[test]
    fn full_run_with_ocr() {
        let mut tracker = StageTracker::new("doc");
        for stage in [Extracted, Classified, OcrPending, Selected, Assembled, Chunked] {
            tracker.advance(stage).unwrap();
        }
        assert!(tracker.is_complete());
        assert_eq!(tracker.into_history().len(), 6);
    }

    #[test]
    fn must_start_at_extracted() {
        let mut tracker = StageTracker::new("doc");
        assert!(tracker.advance(Classified).is_err());
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn no_reentry_or_skipping() {
        let mut tracker = StageTracker::new("doc");
        tracker.advance(Extracted).unwrap();
        tracker.advance(Classified).unwrap();
        tracker.advance(OcrSkipped).unwrap();
        assert!(tracker.advance(OcrPending).is_err());
        assert!(tracker.advance(Classified).is_err());
        assert!(tracker.advance(Assembled).is_err());
        assert_eq!(tracker.current(), Some(OcrSkipped));
        assert!(!tracker.is_complete());
    }
}
