//! The `score` subcommand.

use clap::Args;
use schemars::JsonSchema;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::{create_writer, read_text},
    prelude::*,
    quality::{self, QualityLabel, QualityMetrics},
};

/// Options for the `score` subcommand.
#[derive(Debug, Args)]
pub struct ScoreOpts {
    /// A text file holding one page of text. Reads stdin if omitted.
    #[clap(value_name = "FILE")]
    pub input_path: Option<PathBuf>,

    /// Write JSON here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The quality of one page of text.
#[derive(Debug, JsonSchema, Serialize)]
pub struct PageScore {
    #[serde(flatten)]
    pub metrics: QualityMetrics,
    pub label: QualityLabel,
}

impl PageScore {
    pub fn new(text: &str) -> Self {
        let (metrics, label) = quality::assess(text);
        Self { metrics, label }
    }
}

/// Run the `score` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_score(opts: &ScoreOpts) -> Result<()> {
    let text = read_text(opts.input_path.as_deref()).await?;
    let score = PageScore::new(&text);
    debug!(label = %score.label, confidence = score.metrics.confidence_score, "Scored page");

    let mut json =
        serde_json::to_string_pretty(&score).context("failed to serialize score")?;
    json.push('\n');
    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    wtr.write_all(json.as_bytes())
        .await
        .context("failed to write score")?;
    wtr.flush().await.context("failed to flush score")?;
    Ok(())
}
