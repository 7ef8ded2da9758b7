//! Choosing between native and OCR text for a page.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    extract::{PageText, TextSource},
    quality::{self, QualityLabel, QualityMetrics},
};

/// Reason given when OCR never ran because the native text was good.
pub const OCR_SKIPPED_REASON: &str = "native text clean, OCR skipped";

/// A page of text, along with its quality assessment.
#[derive(Clone, Debug)]
pub struct ScoredPage {
    pub page: PageText,
    pub metrics: QualityMetrics,
    pub label: QualityLabel,
}

impl ScoredPage {
    /// Score a page.
    pub fn new(page: PageText) -> Self {
        let (metrics, label) = quality::assess(page.text());
        Self {
            page,
            metrics,
            label,
        }
    }

    fn source(&self) -> TextSource {
        self.page.source()
    }
}

/// Which text we chose for a page, and why.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct SelectionDecision {
    /// The 1-based page number.
    pub page_number: usize,

    /// Where the chosen text came from.
    pub selected_source: TextSource,

    /// Human-readable justification, for audits. Never empty.
    pub reason: String,

    /// The confidence score of the chosen text.
    pub confidence: f64,
}

impl SelectionDecision {
    /// Use `page` because something went wrong with the alternative.
    ///
    /// `reason` should say what went wrong.
    pub fn fallback(page: &ScoredPage, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        debug_assert!(!reason.is_empty());
        Self {
            page_number: page.page.page_number(),
            selected_source: page.source(),
            reason,
            confidence: page.metrics.confidence_score,
        }
    }
}

/// Choose between native and OCR text for a page.
pub fn select(native: &PageText, ocr: Option<&PageText>) -> SelectionDecision {
    let native = ScoredPage::new(native.clone());
    let ocr = ocr.cloned().map(ScoredPage::new);
    select_scored(&native, ocr.as_ref())
}

/// Like [`select`], but for pages which have already been scored.
///
/// The higher confidence score wins. Ties go to the native text, which is
/// cheaper to produce.
pub fn select_scored(native: &ScoredPage, ocr: Option<&ScoredPage>) -> SelectionDecision {
    debug_assert_eq!(native.source(), TextSource::NativeExtraction);
    let Some(ocr) = ocr else {
        return SelectionDecision::fallback(native, OCR_SKIPPED_REASON);
    };
    debug_assert_eq!(ocr.source(), TextSource::Ocr);
    debug_assert_eq!(native.page.page_number(), ocr.page.page_number());

    let native_confidence = native.metrics.confidence_score;
    let ocr_confidence = ocr.metrics.confidence_score;
    if ocr_confidence > native_confidence {
        SelectionDecision::fallback(ocr, comparison_reason(ocr, native))
    } else if native_confidence > ocr_confidence {
        SelectionDecision::fallback(native, comparison_reason(native, ocr))
    } else {
        SelectionDecision::fallback(
            native,
            format!("confidence tie at {native_confidence:.1}, native extraction preferred"),
        )
    }
}

/// A display label for a text source, suitable for starting a sentence.
fn source_label(source: TextSource) -> &'static str {
    match source {
        TextSource::NativeExtraction => "Native extraction",
        TextSource::Ocr => "OCR",
    }
}

/// Explain why `winner` beat `loser`, naming the metrics that favored it.
fn comparison_reason(winner: &ScoredPage, loser: &ScoredPage) -> String {
    let (w, l) = (&winner.metrics, &loser.metrics);
    let mut advantages = vec![];
    if w.garbled_token_count < l.garbled_token_count {
        advantages.push("fewer garbled tokens");
    }
    if w.readable_word_count > l.readable_word_count {
        advantages.push("higher readable-word count");
    }
    if w.noise_ratio < l.noise_ratio {
        advantages.push("lower noise ratio");
    }
    let basis = if advantages.is_empty() {
        "higher confidence".to_owned()
    } else {
        advantages.join(" and ")
    };
    format!(
        "{} selected: {} (confidence {:.1} vs {:.1}, {} was {})",
        source_label(winner.source()),
        basis,
        w.confidence_score,
        l.confidence_score,
        loser.source(),
        loser.label,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "The policy covers the building and business personal property \
        against fire lightning windstorm hail explosion smoke aircraft vehicles riot \
        vandalism sprinkler leakage sinkhole collapse volcanic action falling objects \
        weight snow water damage theft glass breakage equipment breakdown spoilage \
        signs canopy pumps money securities employee dishonesty business income extra \
        expense terrorism minimum earned premium applies deductible waiting period \
        coinsurance replacement cost valuation agreed amount protective safeguards \
        burglar alarm central station";

    fn native(text: &str) -> PageText {
        PageText::new(1, TextSource::NativeExtraction, text)
    }

    fn ocr(text: &str) -> PageText {
        PageText::new(1, TextSource::Ocr, text)
    }

    #[test]
    fn missing_ocr_selects_native() {
        for text in ["", "(cid:1)(cid:2)", GOOD] {
            let decision = select(&native(text), None);
            assert_eq!(decision.selected_source, TextSource::NativeExtraction);
            assert_eq!(decision.reason, OCR_SKIPPED_REASON);
        }
    }

    #[test]
    fn identical_confidence_selects_native() {
        let decision = select(&native(GOOD), Some(&ocr(GOOD)));
        assert_eq!(decision.selected_source, TextSource::NativeExtraction);
        assert!(decision.reason.contains("tie"));

        // Different text, same score.
        let decision = select(&native("ab"), Some(&ocr("cd")));
        assert_eq!(decision.selected_source, TextSource::NativeExtraction);
    }

    #[test]
    fn better_ocr_wins_and_names_metrics() {
        let garbled = "(cid:12)(cid:13) (cid:14) ... (cid:15)".repeat(5);
        let decision = select(&native(&garbled), Some(&ocr(GOOD)));
        assert_eq!(decision.selected_source, TextSource::Ocr);
        assert!(decision.reason.starts_with("OCR selected"));
        assert!(decision.reason.contains("fewer garbled tokens"));
        assert!(decision.reason.contains("higher readable-word count"));
        assert_eq!(decision.confidence, quality::score(GOOD).confidence_score);
    }

    #[test]
    fn better_native_wins() {
        let decision = select(&native(GOOD), Some(&ocr("%% ## @@")));
        assert_eq!(decision.selected_source, TextSource::NativeExtraction);
        assert!(decision.reason.starts_with("Native extraction selected"));
    }

    #[test]
    fn fallback_keeps_given_reason() {
        let page = ScoredPage::new(native(""));
        let decision = SelectionDecision::fallback(&page, "OCR failed");
        assert_eq!(decision.page_number, 1);
        assert_eq!(decision.reason, "OCR failed");
        assert_eq!(decision.confidence, page.metrics.confidence_score);
    }
}
