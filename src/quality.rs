//! Page quality scoring.
//!
//! Every page of text, whether it came from the PDF's own text layer or from
//! OCR, is scored by exactly the same heuristics. The thresholds live here as
//! shared constants, and are not configurable per document type.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The marker left behind by a font with a broken character-code mapping.
pub const GARBLED_TOKEN_MARKER: &str = "(cid:";

/// Punctuation (and the plain space) that we don't count as noise.
const NON_NOISE_PUNCTUATION: &[char] = &[' ', '.', ',', '!', '?', '(', ')', '-'];

/// Readable words must be longer than this many characters.
const MIN_READABLE_WORD_CHARS: usize = 2;

/// Maximum penalty for garbled tokens.
const MAX_GARBLED_PENALTY: f64 = 50.0;

/// Penalty per garbled token.
const GARBLED_PENALTY_PER_TOKEN: f64 = 2.0;

/// Maximum penalty for noise.
const MAX_NOISE_PENALTY: f64 = 40.0;

/// Pages with more readable words than this get a bonus.
const READABLE_WORD_BONUS_THRESHOLD: usize = 50;

/// Pages with fewer readable words than this get a penalty.
const READABLE_WORD_PENALTY_THRESHOLD: usize = 20;

/// Bonus for pages with plenty of readable words.
const READABLE_WORD_BONUS: f64 = 10.0;

/// Penalty for pages with few readable words.
const READABLE_WORD_PENALTY: f64 = 30.0;

/// The highest confidence score we report.
pub const MAX_CONFIDENCE: f64 = 100.0;

/// Heuristic quality signals for one page of text.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct QualityMetrics {
    /// Number of characters in the text.
    pub total_chars: usize,

    /// Number of `(cid:` markers.
    pub garbled_token_count: usize,

    /// Number of purely alphabetic tokens longer than two characters.
    pub readable_word_count: usize,

    /// Number of characters that are neither alphanumeric nor common
    /// punctuation.
    pub noise_char_count: usize,

    /// `noise_char_count / total_chars`, or 0 for empty text.
    pub noise_ratio: f64,

    /// Overall confidence, between 0 and 100.
    pub confidence_score: f64,
}

/// The three-way quality label.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityLabel {
    /// Good enough to use without OCR.
    Clean,
    /// Almost certainly unusable.
    Problem,
    /// Somewhere in between.
    Borderline,
}

impl QualityLabel {
    /// Should a page with this label be sent to OCR?
    pub fn needs_ocr(self) -> bool {
        !matches!(self, QualityLabel::Clean)
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityLabel::Clean => write!(f, "CLEAN"),
            QualityLabel::Problem => write!(f, "PROBLEM"),
            QualityLabel::Borderline => write!(f, "BORDERLINE"),
        }
    }
}

/// Is this character noise?
fn is_noise_char(c: char) -> bool {
    !c.is_alphanumeric() && !NON_NOISE_PUNCTUATION.contains(&c)
}

/// Is this whitespace-separated token a readable word?
fn is_readable_word(token: &str) -> bool {
    token.chars().count() > MIN_READABLE_WORD_CHARS
        && token.chars().all(char::is_alphabetic)
}

/// Score a page of text.
pub fn score(text: &str) -> QualityMetrics {
    let total_chars = text.chars().count();
    let garbled_token_count = text.matches(GARBLED_TOKEN_MARKER).count();
    let readable_word_count = text.split_whitespace().filter(|t| is_readable_word(t)).count();
    let noise_char_count = text.chars().filter(|&c| is_noise_char(c)).count();
    let noise_ratio = if total_chars == 0 {
        0.0
    } else {
        noise_char_count as f64 / total_chars as f64
    };

    // The order of these steps matters, because callers compare raw scores.
    let mut confidence = MAX_CONFIDENCE;
    confidence -=
        (garbled_token_count as f64 * GARBLED_PENALTY_PER_TOKEN).min(MAX_GARBLED_PENALTY);
    confidence -= (noise_ratio * 100.0).min(MAX_NOISE_PENALTY);
    if readable_word_count > READABLE_WORD_BONUS_THRESHOLD {
        confidence += READABLE_WORD_BONUS;
    } else if readable_word_count < READABLE_WORD_PENALTY_THRESHOLD {
        confidence -= READABLE_WORD_PENALTY;
    }
    let confidence_score = confidence.max(0.0).min(MAX_CONFIDENCE);

    QualityMetrics {
        total_chars,
        garbled_token_count,
        readable_word_count,
        noise_char_count,
        noise_ratio,
        confidence_score,
    }
}

/// Classify a page based on its metrics. The first matching rule wins.
pub fn classify(metrics: &QualityMetrics) -> QualityLabel {
    let QualityMetrics {
        garbled_token_count: garbled,
        readable_word_count: words,
        noise_ratio: noise,
        confidence_score: confidence,
        ..
    } = *metrics;

    let strictly_clean = garbled < 8 && words > 60 && noise < 0.2 && confidence > 70.0;
    let loosely_clean = noise < 0.4 && words > 40 && confidence > 50.0;
    if strictly_clean || loosely_clean {
        QualityLabel::Clean
    } else if garbled > 10 || words < 20 || noise > 0.5 || confidence < 30.0 {
        QualityLabel::Problem
    } else {
        QualityLabel::Borderline
    }
}

/// Score and classify in one step.
pub fn assess(text: &str) -> (QualityMetrics, QualityLabel) {
    let metrics = score(text);
    let label = classify(&metrics);
    (metrics, label)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORDS: &str = "alpha bravo charlie delta echo foxtrot golf hotel india juliet \
        kilo lima mike november oscar papa quebec romeo sierra tango uniform victor \
        whiskey xray yankee zulu apple banana cherry grape lemon mango orange peach \
        pear plum berry melon kiwi lime fig date olive quince raisin prune apricot \
        coconut guava papaya almond cashew walnut pecan hazel acorn maple birch cedar \
        spruce pine larch willow aspen poplar alder rowan holly ivy fern moss lichen \
        clover daisy tulip rose lily orchid violet iris poppy lotus aster dahlia lilac \
        peony pansy petunia zinnia yarrow sage thyme basil mint dill chive parsley \
        fennel cumin ginger garlic onion leek shallot carrot radish turnip beet";

    #[test]
    fn empty_text_is_problem() {
        let metrics = score("");
        assert_eq!(metrics.total_chars, 0);
        assert_eq!(metrics.noise_ratio, 0.0);
        assert_eq!(metrics.readable_word_count, 0);
        assert_eq!(classify(&metrics), QualityLabel::Problem);
    }

    #[test]
    fn confidence_formula_order() {
        // No garbled tokens, no noise, few words: 100 - 30.
        assert_eq!(score("hi").confidence_score, 70.0);

        // 30 garbled tokens cap at a 50 point penalty. Only the `:` in each
        // `(cid:1)` is noise, so 1/7 of the text.
        let garbled = "(cid:1)".repeat(30);
        let metrics = score(&garbled);
        assert_eq!(metrics.garbled_token_count, 30);
        let expected = 100.0 - 50.0 - 100.0 / 7.0 - 30.0;
        assert!((metrics.confidence_score - expected).abs() < 1e-9);

        // Enough penalties floor the score at zero.
        let noisy = "(cid:1)%%%%%%%%%%%%%%%%%%%%".repeat(30);
        assert_eq!(score(&noisy).confidence_score, 0.0);
    }

    #[test]
    fn confidence_never_exceeds_maximum() {
        let metrics = score(WORDS);
        assert!(metrics.readable_word_count > 50);
        assert_eq!(metrics.noise_char_count, 0);
        assert_eq!(metrics.confidence_score, MAX_CONFIDENCE);
    }

    #[test]
    fn eleven_garbled_tokens_are_problem() {
        let text = "(cid:1)(cid:2)(cid:3)(cid:4)(cid:5)(cid:6)(cid:7)(cid:8)(cid:9)(cid:10)(cid:11)";
        let metrics = score(text);
        assert_eq!(metrics.garbled_token_count, 11);
        assert_eq!(classify(&metrics), QualityLabel::Problem);
    }

    #[test]
    fn hundred_real_words_are_clean() {
        let metrics = score(WORDS);
        assert_eq!(metrics.garbled_token_count, 0);
        assert!(metrics.readable_word_count > 60);
        assert_eq!(classify(&metrics), QualityLabel::Clean);
    }

    #[test]
    fn newlines_and_symbols_count_as_noise() {
        let metrics = score("ab\n$%");
        assert_eq!(metrics.total_chars, 5);
        assert_eq!(metrics.noise_char_count, 3);
        assert!((metrics.noise_ratio - 0.6).abs() < 1e-9);
    }

    #[test]
    fn readable_words_must_be_alphabetic_and_long() {
        let metrics = score("an cat dog1 $100 Premium, policy");
        // "cat" and "policy" qualify; "Premium," has a comma.
        assert_eq!(metrics.readable_word_count, 2);
    }

    #[test]
    fn borderline_between_rules() {
        // 30 readable words and a little noise: not clean, not a problem.
        let text = WORDS.split_whitespace().take(30).collect::<Vec<_>>().join(" ");
        let text = format!("{text} $$$$$$$$$$");
        let metrics = score(&text);
        assert_eq!(metrics.readable_word_count, 30);
        assert_eq!(classify(&metrics), QualityLabel::Borderline);
    }

    #[test]
    fn bounds_hold_for_assorted_inputs() {
        let samples = [
            "",
            " ",
            "\n\n\n",
            "(cid:3)",
            "%%%%%%%%%%%%",
            WORDS,
            "Deductible: $2,500 per occurrence",
        ];
        for sample in samples {
            let (metrics, label) = assess(sample);
            assert!((0.0..=1.0).contains(&metrics.noise_ratio), "{sample:?}");
            assert!(
                (0.0..=MAX_CONFIDENCE).contains(&metrics.confidence_score),
                "{sample:?}"
            );
            assert_eq!(classify(&score(sample)), label);
        }
    }
}
