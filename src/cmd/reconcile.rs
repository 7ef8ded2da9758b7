//! The `reconcile` subcommand.

use std::sync::Arc;

use clap::{Args, builder::RangedU64ValueParser};
use futures::{StreamExt as _, stream};

use super::StreamOpts;
use crate::{
    assemble::DEFAULT_CHUNK_SIZE,
    async_utils::{
        JoinWorker,
        io::{count_jsonl_or_csv_records, read_json_or_toml},
    },
    cpu_limit::{DEFAULT_OCR_JOBS, WorkerPools},
    extract::{
        pdftotext::PdfToTextExtractor,
        tesseract::{DEFAULT_OCR_DPI, TesseractExtractor},
    },
    fields::{
        FieldExtractor,
        openai::{FieldOpts, OpenAiFieldExtractor},
    },
    manifest::{DocumentInput, UploadManifest},
    pipeline::{OcrMode, PipelineDriver, PipelineOptions},
    prelude::*,
    queues::{
        reconcile::{ReconcileStreamInfo, Reconciler, reconcile_stream},
        work::{WorkInput, WorkOutput},
    },
    storage::LocalStore,
    ui::Ui,
};

/// Options for the `reconcile` subcommand.
#[derive(Debug, Args)]
pub struct ReconcileOpts {
    /// JSONL or CSV input with `id` and `location` fields, plus optional
    /// `carrier_name`, `kind` and `page_count`. Reads stdin if omitted.
    #[clap(value_name = "INPUT", conflicts_with = "manifest")]
    pub input_path: Option<PathBuf>,

    /// Read documents from an upload manifest (JSON or TOML) instead.
    #[clap(long)]
    pub manifest: Option<PathBuf>,

    /// Which upload in the manifest to process. Optional if there is only
    /// one.
    #[clap(long, requires = "manifest")]
    pub upload_id: Option<String>,

    /// Write JSONL output here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Resolve document locations relative to this directory. `gs://bucket/`
    /// prefixes are stripped.
    #[clap(long, default_value = ".")]
    pub store_root: PathBuf,

    /// Save each combined document here, as JSON and as a text report.
    #[clap(long)]
    pub combined_dir: Option<PathBuf>,

    /// Which pages to OCR.
    #[clap(long, value_enum, default_value_t = OcrMode::Auto)]
    pub ocr_mode: OcrMode,

    /// Pages per chunk.
    #[clap(
        long,
        default_value_t = DEFAULT_CHUNK_SIZE,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..),
    )]
    pub chunk_size: usize,

    /// Max pages being OCRed at once, across all documents.
    #[clap(long, default_value_t = DEFAULT_OCR_JOBS)]
    pub ocr_jobs: usize,

    /// Resolution for rasterizing pages before OCR.
    #[clap(long, default_value_t = DEFAULT_OCR_DPI)]
    pub ocr_dpi: u32,

    /// Tesseract language code(s), like "eng" or "eng+spa".
    #[clap(long, default_value = "eng")]
    pub tesseract_lang: String,

    #[clap(flatten)]
    pub stream_opts: StreamOpts,

    #[clap(flatten)]
    pub field_opts: FieldOpts,
}

/// Run the `reconcile` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_reconcile(ui: Ui, opts: &ReconcileOpts) -> Result<()> {
    let job_count = opts.stream_opts.job_count.max(1);

    // Open up our input stream, and count it if we can.
    let (input, available) = match &opts.manifest {
        Some(path) => {
            let manifest = read_json_or_toml::<UploadManifest>(path).await?;
            let inputs = manifest.document_inputs(opts.upload_id.as_deref())?;
            let count = inputs.len();
            (
                stream::iter(inputs.into_iter().map(Ok::<_, anyhow::Error>)).boxed(),
                Some(count),
            )
        }
        None => {
            let count = match &opts.input_path {
                Some(path) => count_jsonl_or_csv_records(&ui, path).await?,
                None => None,
            };
            (
                WorkInput::<DocumentInput>::read_stream(opts.input_path.as_deref()).await?,
                count,
            )
        }
    };
    let input = opts.stream_opts.apply_stream_input_opts(input);
    let count = opts.stream_opts.limit_count(available);

    // Build our collaborators.
    let store = Arc::new(LocalStore::new(
        opts.store_root.clone(),
        opts.combined_dir.clone(),
    ));
    let driver = PipelineDriver::new(
        Arc::new(PdfToTextExtractor::new()),
        Arc::new(TesseractExtractor::new(opts.ocr_dpi, &opts.tesseract_lang)),
        WorkerPools::new(num_cpus::get(), opts.ocr_jobs),
        PipelineOptions {
            ocr_mode: opts.ocr_mode,
            chunk_size: opts.chunk_size,
            ..PipelineOptions::default()
        },
    );
    let (fields, llm_worker) = if opts.field_opts.extract_fields {
        let (extractor, worker) = OpenAiFieldExtractor::new(&opts.field_opts).await?;
        (Some(Arc::new(extractor) as Arc<dyn FieldExtractor>), worker)
    } else {
        (None, JoinWorker::noop())
    };

    let progress = ui.reconcile_progress(count);

    let ReconcileStreamInfo { stream, worker } =
        reconcile_stream(Reconciler::new(store, driver, fields), input, job_count)?;

    // Documents are independent, so write each one as soon as it's done.
    let output = {
        let progress = progress.clone();
        stream
            .buffer_unordered(job_count)
            .inspect(move |output| {
                if let Ok(output) = output {
                    progress.record(output);
                }
            })
            .boxed()
    };
    WorkOutput::write_stream(&ui, opts.output_path.as_deref(), output, &opts.stream_opts)
        .await?;
    progress.finish();

    // The reconcile worker owns the last handle to the LLM queue, so join it
    // first.
    worker.join().await?;
    llm_worker.join().await
}
