//! Bounded async work queues, and the input and output records that flow
//! through them.
//!
//! A [`WorkQueue`] runs at most `concurrency_limit` items at once, and lets at
//! most `concurrency_limit` more wait. Submitting beyond that blocks the
//! submitter until something finishes, so a slow LLM endpoint or a pile of
//! scanned PDFs slows down input reading instead of filling memory. See
//! ["Queues Don't Fix Overload"](https://ferd.ca/queues-don-t-fix-overload.html).
//!
//! This is an in-process queue for subtasks of one run. It makes no attempt at
//! fairness between unrelated clients.

use std::sync::{Arc, Mutex};

use futures::{
    FutureExt, SinkExt as _, StreamExt,
    channel::{mpsc, oneshot},
};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::{
    async_utils::{
        BoxedFuture, BoxedStream, JoinWorker,
        io::{read_jsonl_or_csv, write_output},
    },
    cmd::StreamOpts,
    fields::TokenUsage,
    prelude::*,
    ui::Ui,
};

/// An input record: an ID plus whatever the work function needs.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WorkInput<T>
where
    T: 'static,
{
    /// Unique ID, copied to the output record.
    pub id: Value,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkInput<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn from_json(value: Value) -> Result<Self> {
        serde_json::from_value::<Self>(value).context("failed to deserialize input")
    }

    /// Read JSONL or CSV records from a [`Path`] or from standard input.
    pub async fn read_stream(path: Option<&Path>) -> Result<BoxedStream<Result<Self>>> {
        Ok(read_jsonl_or_csv(path)
            .await?
            .map(|value| Self::from_json(value?))
            .boxed())
    }
}

/// How did a work item go?
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Ok,
    /// We produced output, but some of it is degraded.
    Incomplete,
    Failed,
}

/// An output record.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct WorkOutput<T>
where
    T: 'static,
{
    /// The ID of the input record.
    pub id: Value,

    pub status: WorkStatus,

    /// LLM tokens spent on this item, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,

    /// Everything that went wrong, including problems we worked around.
    pub errors: Vec<String>,

    #[serde(flatten)]
    pub data: T,
}

impl<T> WorkOutput<T>
where
    T: Clone + Serialize + Send + 'static,
{
    pub fn new_failed(id: Value, errors: Vec<String>, data: T) -> Self {
        Self {
            id,
            status: WorkStatus::Failed,
            token_usage: None,
            errors,
            data,
        }
    }

    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to serialize output")
    }

    /// Write outputs as JSONL to a [`Path`] or to standard output, then
    /// report totals. Fails if too many items failed.
    pub async fn write_stream(
        ui: &Ui,
        path: Option<&Path>,
        stream: BoxedStream<Result<Self>>,
        stream_opts: &StreamOpts,
    ) -> Result<()> {
        let (stream, counters) = WorkOutputCounters::wrap_stream(stream);
        let output = stream.map(|value| value?.to_json()).boxed();
        write_output(path, output).await?;
        counters.finish(ui, stream_opts)
    }
}

/// Totals across a stream of outputs.
#[derive(Clone, Debug, Default)]
pub struct WorkOutputCounters {
    pub total_record_count: usize,
    pub failure_count: usize,
    pub incomplete_count: usize,
    /// Errors attached to records that didn't fail.
    pub non_fatal_error_count: usize,
    pub token_usage: TokenUsage,
}

impl WorkOutputCounters {
    /// Wrap a stream so that every output passing through is counted.
    pub fn wrap_stream<T>(
        stream: BoxedStream<Result<WorkOutput<T>>>,
    ) -> (
        BoxedStream<Result<WorkOutput<T>>>,
        Arc<Mutex<WorkOutputCounters>>,
    ) {
        let counters = Arc::new(Mutex::new(Self::default()));
        let counters_clone = counters.clone();
        let stream = stream
            .map(move |value| {
                let value = value?;
                counters_clone.update(&value);
                Ok(value)
            })
            .boxed();
        (stream, counters)
    }

    /// What fraction of records failed?
    pub fn failure_rate(&self) -> f32 {
        if self.total_record_count == 0 {
            0.0
        } else {
            self.failure_count as f32 / self.total_record_count as f32
        }
    }
}

/// Methods on the shared `Mutex<WorkOutputCounters>`, which is the type we
/// actually pass around.
pub trait WorkItemCounterExt {
    fn update<T>(&self, item: &WorkOutput<T>);

    /// Show totals to the user, and check the failure rate.
    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()>;
}

impl WorkItemCounterExt for Mutex<WorkOutputCounters> {
    fn update<T>(&self, item: &WorkOutput<T>) {
        let Ok(mut counters) = self.lock() else {
            return;
        };
        counters.total_record_count += 1;
        match item.status {
            WorkStatus::Failed => counters.failure_count += 1,
            WorkStatus::Incomplete => {
                counters.incomplete_count += 1;
                counters.non_fatal_error_count += item.errors.len();
            }
            WorkStatus::Ok => counters.non_fatal_error_count += item.errors.len(),
        }
        if let Some(token_usage) = &item.token_usage {
            counters.token_usage += token_usage.clone();
        }
    }

    fn finish(self: Arc<Self>, ui: &Ui, stream_opts: &StreamOpts) -> Result<()> {
        let counters = self
            .lock()
            .map_err(|_| anyhow!("output counters lock poisoned"))?
            .to_owned();
        if !counters.token_usage.is_zero() {
            ui.display_message(
                "📈",
                &format!(
                    "{} input tokens and {} output tokens used",
                    counters.token_usage.prompt_tokens,
                    counters.token_usage.completion_tokens,
                ),
            );
        }
        let failure_rate = counters.failure_rate();
        if failure_rate > stream_opts.allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of outputs were failures, but only {:.2}% were allowed",
                counters.failure_count,
                counters.total_record_count,
                failure_rate * 100.0,
                stream_opts.allowed_failure_rate * 100.0
            ));
        }
        if counters.incomplete_count > 0 {
            ui.display_message(
                "🩹",
                &format!(
                    "{} records have degraded pages or fields",
                    counters.incomplete_count
                ),
            );
        }
        if counters.non_fatal_error_count > 0 {
            ui.display_message(
                "⚠️",
                &format!(
                    "{} non-fatal errors encountered",
                    counters.non_fatal_error_count
                ),
            );
        }
        if counters.failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} records could not be processed", counters.failure_count),
            );
        }
        Ok(())
    }
}

/// An input, plus a one-shot channel for its output.
#[derive(Debug)]
pub struct WorkItem<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    pub input: WorkInput<InputData>,
    pub tx: oneshot::Sender<Result<WorkOutput<OutputData>>>,
}

/// Something that accepts work items.
pub trait WorkItemProcessor {
    type InputData: 'static;
    type OutputData: 'static;

    /// Hand off a work item. Only blocks if we're at capacity.
    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()>;

    /// Submit an input and wait for its output.
    async fn process_blocking(
        &self,
        input: WorkInput<Self::InputData>,
    ) -> Result<WorkOutput<Self::OutputData>> {
        let (tx, rx) = oneshot::channel();
        self.submit_work_item(WorkItem { input, tx }).await?;
        rx.await.context("failed to receive work item result")?
    }
}

/// An async work function.
type WorkFn<InputData, OutputData> = Arc<
    dyn Fn(WorkInput<InputData>) -> BoxedFuture<Result<WorkOutput<OutputData>>>
        + Send
        + Sync
        + 'static,
>;

/// A cheap, cloneable handle for submitting to a [`WorkQueue`].
pub struct WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueueHandle<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Turn a stream of inputs into a stream of futures for their outputs.
    /// Resolve them with [`StreamExt::buffered`] or
    /// [`StreamExt::buffer_unordered`]. The queue's own limit still applies,
    /// whatever buffer size you pick.
    pub fn process_stream(
        &self,
        input: BoxedStream<Result<WorkInput<InputData>>>,
    ) -> BoxedStream<BoxedFuture<Result<WorkOutput<OutputData>>>> {
        let handle = self.clone();
        input
            .map(move |input| {
                let handle = handle.clone();
                async move { handle.process_blocking(input?).await }.boxed()
            })
            .boxed()
    }
}

// Written by hand so that the data types don't need to be `Clone`.
impl<InputData, OutputData> Clone for WorkQueueHandle<InputData, OutputData> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<InputData, OutputData> WorkItemProcessor for WorkQueueHandle<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    type InputData = InputData;
    type OutputData = OutputData;

    async fn submit_work_item(
        &self,
        item: WorkItem<Self::InputData, Self::OutputData>,
    ) -> Result<()> {
        let mut tx = self.tx.clone();
        tx.send(item).await.context("failed to send work item")?;
        Ok(())
    }
}

/// Runs a work function on submitted items, with a concurrency limit.
pub struct WorkQueue<InputData, OutputData>
where
    InputData: 'static,
    OutputData: 'static,
{
    tx: mpsc::Sender<WorkItem<InputData, OutputData>>,
}

impl<InputData, OutputData> WorkQueue<InputData, OutputData>
where
    InputData: Send + 'static,
    OutputData: Send + 'static,
{
    /// Start a queue. Up to `concurrency_limit` items run at once, and as many
    /// again may be waiting.
    ///
    /// The worker exits once the queue and every handle have been dropped.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<InputData, OutputData>,
    ) -> Result<(Self, JoinWorker)> {
        let concurrency_limit = concurrency_limit.max(1);
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(
                concurrency_limit,
                |item: WorkItem<InputData, OutputData>| async {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!("work item receiver dropped before result was ready");
                    }
                },
            )
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    pub fn handle(&self) -> WorkQueueHandle<InputData, OutputData> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}
