//! Reconciling a stream of documents, each independently.
//!
//! For each input record we load the PDF, run it through the
//! [`PipelineDriver`], save the combined document, and optionally extract
//! fields from its chunks. A failure in one document never affects another.

use std::sync::Arc;

use futures::FutureExt as _;
use schemars::JsonSchema;

use super::work::{WorkInput, WorkOutput, WorkQueue, WorkStatus};
use crate::{
    assemble::Chunk,
    async_utils::{BoxedFuture, BoxedStream, JoinWorker},
    document::Document,
    fields::{FieldExtractor, MergedFields, extract_document_fields},
    manifest::{DocumentInput, DocumentKind},
    pipeline::{PageSummary, PipelineDriver, stage::DocumentStage},
    prelude::*,
    storage::DocumentStore,
};

/// What we learned about one document.
#[derive(Clone, Debug, Default, JsonSchema, Serialize)]
pub struct DocumentOutput {
    pub location: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<DocumentKind>,

    pub byte_count: usize,
    pub page_count: usize,

    /// How many pages we OCRed successfully.
    pub ocr_page_count: usize,

    /// Every pipeline stage the document reached.
    pub stages: Vec<DocumentStage>,

    pub pages: Vec<PageSummary>,
    pub chunks: Vec<Chunk>,

    /// Where the combined document was saved.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub saved_to: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<MergedFields>,
}

impl DocumentOutput {
    fn for_input(input: &DocumentInput) -> Self {
        Self {
            location: input.location.clone(),
            carrier_name: input.carrier_name.clone(),
            kind: input.kind,
            ..Self::default()
        }
    }
}

/// Everything needed to reconcile documents.
pub struct Reconciler {
    store: Arc<dyn DocumentStore>,
    driver: PipelineDriver,
    fields: Option<Arc<dyn FieldExtractor>>,
}

impl Reconciler {
    /// Create a reconciler. Fields are only extracted if `fields` is given.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        driver: PipelineDriver,
        fields: Option<Arc<dyn FieldExtractor>>,
    ) -> Self {
        Self {
            store,
            driver,
            fields,
        }
    }

    /// Reconcile one document. Never fails; failures become
    /// [`WorkStatus::Failed`] records.
    #[instrument(level = "debug", skip_all, fields(id = %input.id))]
    pub async fn reconcile(&self, input: WorkInput<DocumentInput>) -> WorkOutput<DocumentOutput> {
        let document_id = match &input.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let mut output = DocumentOutput::for_input(&input.data);
        match self.try_reconcile(&document_id, &input.data, &mut output).await {
            Ok(warnings) => {
                let token_usage = output
                    .fields
                    .as_ref()
                    .map(|fields| fields.token_usage.clone())
                    .filter(|usage| !usage.is_zero());
                let status = if warnings.is_empty() {
                    WorkStatus::Ok
                } else {
                    WorkStatus::Incomplete
                };
                info!(
                    id = %document_id,
                    pages = output.page_count,
                    ocr_pages = output.ocr_page_count,
                    ?status,
                    "Reconciled document"
                );
                WorkOutput {
                    id: input.id,
                    status,
                    token_usage,
                    errors: warnings,
                    data: output,
                }
            }
            Err(err) => {
                error!(id = %document_id, "Could not reconcile document: {err:#}");
                WorkOutput::new_failed(input.id, vec![format!("{err:?}")], output)
            }
        }
    }

    /// Fill in `output` as we go, so a failure still reports how far we got.
    /// Returns warnings about degraded pages and fields.
    async fn try_reconcile(
        &self,
        document_id: &str,
        input: &DocumentInput,
        output: &mut DocumentOutput,
    ) -> Result<Vec<String>> {
        let bytes = self.store.load(&input.location).await?;
        let document = match input.page_count {
            Some(page_count) => Document::new(document_id, bytes, page_count),
            None => Document::load(document_id, bytes).await?,
        };
        output.byte_count = document.bytes().len();
        output.page_count = document.page_count();

        let run = self.driver.process_document(&document).await?;
        output.ocr_page_count = run.ocr_page_count();
        output.saved_to = self.store.save_combined(document_id, &run.combined).await?;
        let mut warnings = run.warnings;
        output.stages = run.stages;
        output.pages = run.pages;

        // The run is complete, so the chunks are final.
        if let Some(extractor) = &self.fields {
            match input.kind {
                Some(kind) => {
                    let merged = extract_document_fields(
                        extractor.as_ref(),
                        document_id,
                        kind,
                        &run.chunks,
                    )
                    .await?;
                    warnings.extend(
                        merged
                            .errors
                            .iter()
                            .map(|err| format!("field extraction failed for a chunk: {err}")),
                    );
                    output.fields = Some(merged);
                }
                None => {
                    warn!(id = %document_id, "No document kind, skipping field extraction");
                    warnings.push("no document kind given, so no fields were extracted".to_owned());
                }
            }
        }
        output.chunks = run.chunks;
        Ok(warnings)
    }
}

/// The output of [`reconcile_stream`].
pub struct ReconcileStreamInfo {
    /// One future per input record. Resolve with `buffered` or
    /// `buffer_unordered`.
    pub stream: BoxedStream<BoxedFuture<Result<WorkOutput<DocumentOutput>>>>,

    /// Finishes once the stream has been drained and dropped.
    pub worker: JoinWorker,
}

/// Reconcile a stream of documents, at most `job_count` at a time.
pub fn reconcile_stream(
    reconciler: Reconciler,
    input: BoxedStream<Result<WorkInput<DocumentInput>>>,
    job_count: usize,
) -> Result<ReconcileStreamInfo> {
    let reconciler = Arc::new(reconciler);
    let work_fn = move |input: WorkInput<DocumentInput>| {
        let reconciler = reconciler.clone();
        async move { Ok(reconciler.reconcile(input).await) }.boxed()
    };
    let (queue, worker) = WorkQueue::new(job_count, Arc::new(work_fn))?;
    let stream = queue.handle().process_stream(input);
    Ok(ReconcileStreamInfo { stream, worker })
}
