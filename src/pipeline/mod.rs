//! The per-document reconciliation pipeline.
//!
//! For each document we:
//!
//! 1. Extract native text from every page, and score it.
//! 2. OCR the pages that need it (depending on [`OcrMode`]).
//! 3. Pick the better text for each page.
//! 4. Assemble the winners into a [`CombinedDocument`], and chunk it.
//!
//! Failures on a single page degrade that page to the best text we have, with a
//! reason saying what happened. Failures that affect the whole document abort
//! this document only.

use std::{collections::HashMap, sync::Arc};

use clap::ValueEnum;
use futures::{StreamExt as _, TryStreamExt as _, stream};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    assemble::{self, AssembleError, Chunk, CombinedDocument, DEFAULT_CHUNK_SIZE, PageTexts},
    cpu_limit::WorkerPools,
    document::Document,
    extract::{ExtractError, NativeExtractor, OcrExtractor, PageText, TextSource},
    prelude::*,
    quality::{QualityLabel, QualityMetrics},
    select::{ScoredPage, SelectionDecision, select_scored},
};

pub mod stage;

use self::stage::{DocumentStage, StageTracker};

/// Errors which abort a document's pipeline run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error("document {document_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        document_id: String,
        from: Option<DocumentStage>,
        to: DocumentStage,
    },

    #[error("worker pool unavailable: {0}")]
    PoolUnavailable(String),
}

/// Which pages should we OCR?
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    /// Only pages whose native text is PROBLEM or BORDERLINE.
    #[default]
    Auto,
    /// Every page. Native text still wins when it scores at least as well.
    All,
    /// No pages.
    Never,
}

impl OcrMode {
    fn should_ocr(self, label: QualityLabel) -> bool {
        match self {
            OcrMode::Auto => label.needs_ocr(),
            OcrMode::All => true,
            OcrMode::Never => false,
        }
    }
}

/// Tunable pipeline settings.
#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub ocr_mode: OcrMode,
    /// Pages per chunk.
    pub chunk_size: usize,
    /// How many pages of one document may be in flight at once.
    pub page_jobs: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ocr_mode: OcrMode::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            page_jobs: 8,
        }
    }
}

/// What happened to one page.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct PageSummary {
    pub page_number: usize,

    /// Quality of the native text.
    pub native_metrics: QualityMetrics,
    pub native_label: QualityLabel,

    /// Why native extraction failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_error: Option<String>,

    /// Quality of the OCR text, if we ran OCR successfully.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_metrics: Option<QualityMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_label: Option<QualityLabel>,

    /// Why OCR failed, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr_error: Option<String>,

    pub decision: SelectionDecision,
}

/// The result of running one document all the way through the pipeline.
#[derive(Clone, Debug)]
pub struct DocumentRun {
    pub document_id: String,
    pub stages: Vec<DocumentStage>,
    pub pages: Vec<PageSummary>,
    pub combined: CombinedDocument,
    pub chunks: Vec<Chunk>,
    /// One entry per degraded page.
    pub warnings: Vec<String>,
}

impl DocumentRun {
    /// How many pages did we OCR successfully?
    pub fn ocr_page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.ocr_metrics.is_some()).count()
    }
}

/// Native extraction result for one page.
struct NativeAttempt {
    scored: ScoredPage,
    error: Option<String>,
}

/// OCR result for one page.
enum OcrOutcome {
    /// Native text was good enough.
    Skipped,
    /// [`OcrMode::Never`].
    Disabled,
    Done(ScoredPage),
    Failed(String),
}

/// Runs documents through the pipeline. Shareable across tasks.
#[derive(Clone)]
pub struct PipelineDriver {
    native: Arc<dyn NativeExtractor>,
    ocr: Arc<dyn OcrExtractor>,
    pools: WorkerPools,
    options: PipelineOptions,
}

impl PipelineDriver {
    pub fn new(
        native: Arc<dyn NativeExtractor>,
        ocr: Arc<dyn OcrExtractor>,
        pools: WorkerPools,
        options: PipelineOptions,
    ) -> Self {
        Self {
            native,
            ocr,
            pools,
            options,
        }
    }

    /// Run one document through every stage.
    ///
    /// The returned future resolves once the document reaches
    /// [`DocumentStage::Chunked`]; that is the signal for callers to start
    /// field extraction.
    #[instrument(level = "debug", skip_all, fields(id = %document.id(), pages = document.page_count()))]
    pub async fn process_document(
        &self,
        document: &Document,
    ) -> Result<DocumentRun, PipelineError> {
        let mut tracker = StageTracker::new(document.id());
        let page_count = document.page_count();
        let page_jobs = self.options.page_jobs.max(1);

        // Native text for every page, in page order.
        let natives = stream::iter(1..=page_count)
            .map(|page| self.extract_native(document, page))
            .buffered(page_jobs)
            .try_collect::<Vec<_>>()
            .await?;
        tracker.advance(DocumentStage::Extracted)?;

        // Scoring happened as each page arrived; decide who needs OCR.
        let ocr_pages = natives
            .iter()
            .filter(|n| self.options.ocr_mode.should_ocr(n.scored.label))
            .map(|n| n.scored.page.page_number())
            .collect::<Vec<_>>();
        tracker.advance(DocumentStage::Classified)?;
        debug!(
            clean = natives.iter().filter(|n| n.scored.label == QualityLabel::Clean).count(),
            ocr = ocr_pages.len(),
            "Classified pages"
        );

        let mut ocr_outcomes = if ocr_pages.is_empty() {
            tracker.advance(DocumentStage::OcrSkipped)?;
            HashMap::new()
        } else {
            tracker.advance(DocumentStage::OcrPending)?;
            stream::iter(ocr_pages)
                .map(|page| async move {
                    Ok::<_, PipelineError>((page, self.extract_ocr(document, page).await?))
                })
                .buffer_unordered(page_jobs)
                .try_collect::<HashMap<_, _>>()
                .await?
        };

        // Choose a text for every page.
        let mut texts = PageTexts::new();
        let mut decisions = Vec::with_capacity(page_count);
        let mut summaries = Vec::with_capacity(page_count);
        let mut warnings = vec![];
        for native in natives {
            let page_number = native.scored.page.page_number();
            let outcome = ocr_outcomes.remove(&page_number).unwrap_or(
                if self.options.ocr_mode == OcrMode::Never {
                    OcrOutcome::Disabled
                } else {
                    OcrOutcome::Skipped
                },
            );
            let (decision, degraded) = decide(&native, &outcome);
            if degraded {
                warn!(page = page_number, reason = %decision.reason, "Degraded page");
                warnings.push(format!("page {page_number}: {}", decision.reason));
            }

            let (ocr_metrics, ocr_label, ocr_error) = match outcome {
                OcrOutcome::Done(ocr) => {
                    let summary = (Some(ocr.metrics), Some(ocr.label), None);
                    texts.insert(ocr.page);
                    summary
                }
                OcrOutcome::Failed(err) => (None, None, Some(err)),
                OcrOutcome::Skipped | OcrOutcome::Disabled => (None, None, None),
            };
            summaries.push(PageSummary {
                page_number,
                native_metrics: native.scored.metrics,
                native_label: native.scored.label,
                native_error: native.error,
                ocr_metrics,
                ocr_label,
                ocr_error,
                decision: decision.clone(),
            });
            texts.insert(native.scored.page);
            decisions.push(decision);
        }
        tracker.advance(DocumentStage::Selected)?;

        let combined = assemble::assemble(page_count, decisions, &texts)?;
        tracker.advance(DocumentStage::Assembled)?;

        let chunks = assemble::chunk(&combined, self.options.chunk_size)?;
        tracker.advance(DocumentStage::Chunked)?;

        Ok(DocumentRun {
            document_id: document.id().to_owned(),
            stages: tracker.into_history(),
            pages: summaries,
            combined,
            chunks,
            warnings,
        })
    }

    /// Extract and score native text for a page. Page-level failures become
    /// empty text, which always classifies as a problem.
    #[instrument(level = "trace", skip(self, document))]
    async fn extract_native(
        &self,
        document: &Document,
        page: usize,
    ) -> Result<NativeAttempt, PipelineError> {
        let result = self
            .pools
            .with_native_permit(|| self.native.extract(document, page))
            .await
            .map_err(|err| PipelineError::PoolUnavailable(format!("{err:#}")))?;
        let (text, error) = match result {
            Ok(text) => (text, None),
            Err(err) if err.is_document_level() => return Err(err.into()),
            Err(err) => {
                warn!(page, %err, "Native extraction failed, treating page as empty");
                (String::new(), Some(err.to_string()))
            }
        };
        Ok(NativeAttempt {
            scored: ScoredPage::new(PageText::new(page, TextSource::NativeExtraction, text)),
            error,
        })
    }

    /// OCR and score a page.
    #[instrument(level = "trace", skip(self, document))]
    async fn extract_ocr(
        &self,
        document: &Document,
        page: usize,
    ) -> Result<OcrOutcome, PipelineError> {
        let result = self
            .pools
            .with_ocr_permit(|| self.ocr.extract_via_ocr(document, page))
            .await
            .map_err(|err| PipelineError::PoolUnavailable(format!("{err:#}")))?;
        match result {
            Ok(text) => Ok(OcrOutcome::Done(ScoredPage::new(PageText::new(
                page,
                TextSource::Ocr,
                text,
            )))),
            Err(err) if err.is_document_level() => Err(err.into()),
            Err(err) => {
                warn!(page, %err, "OCR failed");
                Ok(OcrOutcome::Failed(err.to_string()))
            }
        }
    }
}

/// Decide on a page's text. Also returns whether the decision is a fallback
/// caused by a failure.
fn decide(native: &NativeAttempt, outcome: &OcrOutcome) -> (SelectionDecision, bool) {
    let label = native.scored.label;
    match (outcome, &native.error) {
        (OcrOutcome::Skipped, _) => (select_scored(&native.scored, None), false),
        (OcrOutcome::Disabled, None) => (
            SelectionDecision::fallback(
                &native.scored,
                format!("OCR disabled, native text kept with {label} quality"),
            ),
            false,
        ),
        (OcrOutcome::Disabled, Some(native_err)) => (
            SelectionDecision::fallback(
                &native.scored,
                format!("native extraction failed ({native_err}) and OCR is disabled, page left empty"),
            ),
            true,
        ),
        (OcrOutcome::Done(ocr), None) => (select_scored(&native.scored, Some(ocr)), false),
        (OcrOutcome::Done(ocr), Some(native_err)) => (
            SelectionDecision::fallback(
                ocr,
                format!("native extraction failed ({native_err}), OCR text used"),
            ),
            true,
        ),
        (OcrOutcome::Failed(ocr_err), None) => (
            SelectionDecision::fallback(
                &native.scored,
                format!("OCR failed ({ocr_err}), native text kept despite {label} quality"),
            ),
            true,
        ),
        (OcrOutcome::Failed(ocr_err), Some(native_err)) => (
            SelectionDecision::fallback(
                &native.scored,
                format!(
                    "native extraction failed ({native_err}) and OCR failed ({ocr_err}), page left empty"
                ),
            ),
            true,
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;
    use crate::select::OCR_SKIPPED_REASON;

    const CLEAN: &str = "The policy covers the building and business personal property \
        against fire lightning windstorm hail explosion smoke aircraft vehicles riot \
        vandalism sprinkler leakage sinkhole collapse volcanic action falling objects \
        weight snow water damage theft glass breakage equipment breakdown spoilage \
        signs canopy pumps money securities employee dishonesty business income extra \
        expense terrorism minimum earned premium applies deductible waiting period \
        coinsurance replacement cost valuation agreed amount protective safeguards \
        burglar alarm central station";

    const GARBLED: &str = "(cid:1)(cid:2)(cid:3)(cid:4)(cid:5)(cid:6)(cid:7)(cid:8)(cid:9)(cid:10)(cid:11)";

    /// Native text keyed by page. Missing pages fail.
    struct FakeNative {
        pages: HashMap<usize, &'static str>,
    }

    #[async_trait]
    impl NativeExtractor for FakeNative {
        async fn extract(
            &self,
            document: &Document,
            page_number: usize,
        ) -> Result<String, ExtractError> {
            document.check_page(page_number)?;
            self.pages
                .get(&page_number)
                .map(|text| text.to_string())
                .ok_or_else(|| document.corrupt(format!("page {page_number} is damaged")))
        }
    }

    /// OCR text keyed by page, recording every call. Pages in `failing` fail.
    #[derive(Default)]
    struct FakeOcr {
        pages: HashMap<usize, &'static str>,
        failing: HashSet<usize>,
        calls: Mutex<Vec<usize>>,
    }

    impl FakeOcr {
        fn calls(&self) -> Vec<usize> {
            let mut calls = self.calls.lock().unwrap().clone();
            calls.sort();
            calls
        }
    }

    #[async_trait]
    impl OcrExtractor for FakeOcr {
        async fn extract_via_ocr(
            &self,
            document: &Document,
            page_number: usize,
        ) -> Result<String, ExtractError> {
            document.check_page(page_number)?;
            self.calls.lock().unwrap().push(page_number);
            if self.failing.contains(&page_number) {
                return Err(ExtractError::OcrUnavailable("engine crashed".to_owned()));
            }
            Ok(self.pages.get(&page_number).copied().unwrap_or_default().to_owned())
        }
    }

    fn driver(
        native: FakeNative,
        ocr: Arc<FakeOcr>,
        ocr_mode: OcrMode,
    ) -> PipelineDriver {
        PipelineDriver::new(
            Arc::new(native),
            ocr,
            WorkerPools::new(4, 2),
            PipelineOptions {
                ocr_mode,
                ..PipelineOptions::default()
            },
        )
    }

    fn native(pages: &[(usize, &'static str)]) -> FakeNative {
        FakeNative {
            pages: pages.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn clean_pages_never_reach_ocr() {
        let ocr = Arc::new(FakeOcr::default());
        let driver = driver(native(&[(1, CLEAN), (2, CLEAN), (3, CLEAN)]), ocr.clone(), OcrMode::Auto);
        let run = driver
            .process_document(&Document::new("doc", vec![], 3))
            .await
            .unwrap();

        assert!(ocr.calls().is_empty());
        assert_eq!(
            run.stages,
            vec![
                DocumentStage::Extracted,
                DocumentStage::Classified,
                DocumentStage::OcrSkipped,
                DocumentStage::Selected,
                DocumentStage::Assembled,
                DocumentStage::Chunked,
            ]
        );
        assert!(run.warnings.is_empty());
        for page in run.combined.pages() {
            assert_eq!(page.source, TextSource::NativeExtraction);
            assert_eq!(page.selection_reason, OCR_SKIPPED_REASON);
        }
    }

    #[tokio::test]
    async fn problem_pages_are_ocred_and_compared() {
        let ocr = Arc::new(FakeOcr {
            pages: [(2, CLEAN), (3, "%%")].into_iter().collect(),
            ..FakeOcr::default()
        });
        let driver = driver(native(&[(1, CLEAN), (2, GARBLED), (3, "")]), ocr.clone(), OcrMode::Auto);
        let run = driver
            .process_document(&Document::new("doc", vec![], 3))
            .await
            .unwrap();

        assert_eq!(ocr.calls(), vec![2, 3]);
        assert!(run.stages.contains(&DocumentStage::OcrPending));
        let sources = run.combined.pages().iter().map(|p| p.source).collect::<Vec<_>>();
        assert_eq!(
            sources,
            vec![TextSource::NativeExtraction, TextSource::Ocr, TextSource::NativeExtraction]
        );
        assert_eq!(run.combined.pages()[1].text, CLEAN);
        assert_eq!(run.ocr_page_count(), 2);
        assert!(run.warnings.is_empty());
    }

    #[tokio::test]
    async fn ocr_failure_degrades_one_page() {
        let ocr = Arc::new(FakeOcr {
            failing: [2].into_iter().collect(),
            ..FakeOcr::default()
        });
        let driver = driver(native(&[(1, CLEAN), (2, GARBLED)]), ocr, OcrMode::Auto);
        let run = driver
            .process_document(&Document::new("doc", vec![], 2))
            .await
            .unwrap();

        assert_eq!(run.combined.page_count(), 2);
        let page = &run.combined.pages()[1];
        assert_eq!(page.source, TextSource::NativeExtraction);
        assert_eq!(page.text, GARBLED);
        assert!(page.selection_reason.starts_with("OCR failed"));
        assert!(page.selection_reason.contains("PROBLEM"));
        assert_eq!(run.warnings.len(), 1);
        assert!(run.pages[1].ocr_error.is_some());
    }

    #[tokio::test]
    async fn native_failure_falls_back_to_ocr() {
        let ocr = Arc::new(FakeOcr {
            pages: [(2, CLEAN)].into_iter().collect(),
            ..FakeOcr::default()
        });
        let driver = driver(native(&[(1, CLEAN)]), ocr.clone(), OcrMode::Auto);
        let run = driver
            .process_document(&Document::new("doc", vec![], 2))
            .await
            .unwrap();

        assert_eq!(ocr.calls(), vec![2]);
        let page = &run.combined.pages()[1];
        assert_eq!(page.source, TextSource::Ocr);
        assert!(page.selection_reason.starts_with("native extraction failed"));
        assert!(run.pages[1].native_error.is_some());
        assert_eq!(run.warnings.len(), 1);
    }

    #[tokio::test]
    async fn ocr_modes_all_and_never() {
        let ocr = Arc::new(FakeOcr::default());
        let run = driver(native(&[(1, CLEAN), (2, "")]), ocr.clone(), OcrMode::All)
            .process_document(&Document::new("doc", vec![], 2))
            .await
            .unwrap();
        assert_eq!(ocr.calls(), vec![1, 2]);
        // Empty OCR text can't beat good native text.
        assert_eq!(run.combined.pages()[0].source, TextSource::NativeExtraction);

        let ocr = Arc::new(FakeOcr::default());
        let run = driver(native(&[(1, CLEAN), (2, "")]), ocr.clone(), OcrMode::Never)
            .process_document(&Document::new("doc", vec![], 2))
            .await
            .unwrap();
        assert!(ocr.calls().is_empty());
        assert!(run.combined.pages()[1].selection_reason.starts_with("OCR disabled"));
        assert!(run.stages.contains(&DocumentStage::OcrSkipped));
    }

    #[tokio::test]
    async fn chunks_cover_every_page() {
        let pages = (1..=6).map(|n| (n, CLEAN)).collect::<Vec<_>>();
        let run = driver(native(&pages), Arc::new(FakeOcr::default()), OcrMode::Auto)
            .process_document(&Document::new("doc", vec![], 6))
            .await
            .unwrap();
        let groups = run.chunks.iter().map(|c| c.page_numbers.clone()).collect::<Vec<_>>();
        assert_eq!(groups, vec![vec![1, 2, 3, 4], vec![5, 6]]);
    }

    #[tokio::test]
    async fn invalid_page_index_aborts_document() {
        /// An extractor with an off-by-one bug.
        struct OffByOne;

        #[async_trait]
        impl NativeExtractor for OffByOne {
            async fn extract(
                &self,
                document: &Document,
                page_number: usize,
            ) -> Result<String, ExtractError> {
                document.check_page(page_number + 1)?;
                Ok(String::new())
            }
        }

        let driver = PipelineDriver::new(
            Arc::new(OffByOne),
            Arc::new(FakeOcr::default()),
            WorkerPools::new(2, 1),
            PipelineOptions::default(),
        );
        let err = driver
            .process_document(&Document::new("doc", vec![], 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Extract(ExtractError::InvalidPageIndex { page: 3, .. })
        ));
    }
}
