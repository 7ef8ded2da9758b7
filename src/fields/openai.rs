//! Field extraction through an OpenAI-compatible `/chat/completions`
//! endpoint, using strict JSON Schema responses.
//!
//! Every chunk request from every document goes through one [`WorkQueue`], so
//! `--llm-jobs` is a global limit.

use std::{
    iter,
    sync::{Arc, LazyLock},
    time::Duration,
};

use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{CreateChatCompletionResponse, FinishReason},
};
use clap::Args;
use futures::FutureExt as _;
use keen_retry::{ExponentialJitter, ResolvedResult, RetryResult};
use leaky_bucket::RateLimiter;
use regex::Regex;
use schemars::JsonSchema;
use serde_json::json;
use tokio::time;

use super::{ChunkFields, ChunkRequest, FieldExtractor, FieldList, TokenUsage};
use crate::{
    async_utils::{JoinWorker, io::read_json_or_toml},
    llm_client::create_llm_client,
    prelude::*,
    prompt::ChatPrompt,
    queues::work::{
        WorkInput, WorkItemProcessor as _, WorkOutput, WorkQueue, WorkQueueHandle,
        WorkStatus,
    },
    rate_limit::RateLimit,
    retry::{
        IntoRetryResult as _, IsKnownTransient as _, SimpleRetryResult,
        retry_result_fatal, retry_result_ok, try_with_retry_result,
    },
};

/// The prompt used unless `--prompt` is given.
const DEFAULT_PROMPT: &str = include_str!("default_prompt.toml");

/// Options for field extraction.
#[derive(Args, Clone, Debug)]
pub struct FieldOpts {
    /// Extract coverage fields from each document's chunks using an LLM.
    /// Documents need a `kind`.
    #[clap(long)]
    pub extract_fields: bool,

    /// The model to use.
    #[clap(long, default_value = "gpt-4o-mini")]
    pub model: String,

    /// A prompt file (TOML or JSON) to use instead of the built-in one.
    #[clap(long)]
    pub prompt: Option<PathBuf>,

    /// Max LLM requests in flight, across all documents.
    #[clap(long, default_value = "4")]
    pub llm_jobs: usize,

    /// Rate limit for LLM requests, like "10/s" or "500/m".
    #[clap(long)]
    pub rate_limit: Option<RateLimit>,

    /// Upper limit on completion tokens per chunk.
    #[clap(long)]
    pub max_completion_tokens: Option<u32>,

    /// Sampling temperature, between 0.0 and 2.0.
    #[clap(long)]
    pub temperature: Option<f32>,

    /// Seconds to wait for each LLM response.
    #[clap(long, default_value = "120")]
    pub llm_timeout: u64,
}

/// Our built-in prompt.
pub fn default_prompt() -> Result<ChatPrompt> {
    toml::from_str(DEFAULT_PROMPT).context("Built-in field extraction prompt is invalid")
}

/// Queue output for one chunk.
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct ChunkResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<ChunkFields>,
}

/// A [`FieldExtractor`] that calls an OpenAI-compatible API.
#[derive(Clone)]
pub struct OpenAiFieldExtractor {
    handle: WorkQueueHandle<ChunkRequest, ChunkResponse>,
}

impl OpenAiFieldExtractor {
    /// Start the LLM queue. Join the returned worker after dropping every
    /// copy of the extractor.
    pub async fn new(opts: &FieldOpts) -> Result<(Self, JoinWorker)> {
        let prompt = match &opts.prompt {
            Some(path) => read_json_or_toml::<ChatPrompt>(path).await?,
            None => default_prompt()?,
        };
        let state = Arc::new(ExtractorState {
            client: create_llm_client()?,
            prompt,
            rate_limiter: opts.rate_limit.as_ref().map(RateLimit::to_rate_limiter),
            opts: opts.clone(),
        });
        let work_fn = move |input: WorkInput<ChunkRequest>| {
            let state = state.clone();
            async move { state.process(input).await }.boxed()
        };
        let (queue, worker) = WorkQueue::new(opts.llm_jobs, Arc::new(work_fn))?;
        Ok((
            Self {
                handle: queue.handle(),
            },
            worker,
        ))
    }
}

#[async_trait]
impl FieldExtractor for OpenAiFieldExtractor {
    async fn extract_chunk(&self, request: ChunkRequest) -> Result<ChunkFields> {
        let id = Value::String(format!(
            "{}#{}",
            request.document_id, request.chunk.chunk_number
        ));
        let output = self
            .handle
            .process_blocking(WorkInput { id, data: request })
            .await?;
        match output.data.fields {
            Some(mut fields) => {
                fields.token_usage = output.token_usage;
                Ok(fields)
            }
            None => Err(anyhow!("{}", output.errors.join("; "))),
        }
    }
}

/// Shared by every request on the queue.
struct ExtractorState {
    client: Client<OpenAIConfig>,
    prompt: ChatPrompt,
    rate_limiter: Option<RateLimiter>,
    opts: FieldOpts,
}

impl ExtractorState {
    #[instrument(level = "debug", skip_all, fields(id = %input.id))]
    async fn process(
        &self,
        input: WorkInput<ChunkRequest>,
    ) -> Result<WorkOutput<ChunkResponse>> {
        let request = input.data;
        let fields = FieldList::for_kind(request.kind)?;
        let messages = self.prompt.render_prompt(&request.prompt_bindings(&fields))?;
        let body = build_request(&self.opts, messages, fields.response_schema());
        trace!(%body, "Request");

        let result = self
            .chat_once(&body)
            .await
            .retry_with_async(|_| self.chat_once(&body))
            .with_exponential_jitter(|| ExponentialJitter::FromBackoffRange {
                backoff_range_millis: 1..=30_000,
                re_attempts: 5,
                jitter_ratio: 0.2,
            })
            .await
            .inspect_recovered(|_, _, retry_errors_list| {
                warn!(
                    "succeeded after retrying {} times (failed attempts: [{}])",
                    retry_errors_list.len(),
                    keen_retry::loggable_retry_errors(retry_errors_list)
                )
            })
            .inspect_given_up(|_, retry_errors_list, fatal_error| {
                error!(
                    "FAILED after {} retries with error {fatal_error:?}",
                    retry_errors_list.len()
                )
            })
            .inspect_fatal(|_, fatal_error| error!("FAILED with error {fatal_error:?}"));

        Ok(output_from_resolved(input.id, &request, result))
    }

    /// One attempt at a chat completion, returning the parsed JSON content.
    async fn chat_once(&self, body: &Value) -> SimpleRetryResult<(Value, Option<TokenUsage>)> {
        if let Some(rate_limiter) = &self.rate_limiter {
            rate_limiter.acquire_one().await;
        }

        let timeout = Duration::from_secs(self.opts.llm_timeout);
        let chat = self.client.chat();
        let raw: Value = match time::timeout(timeout, chat.create_byot(body)).await {
            Ok(result) => try_with_retry_result!(
                result.into_retry_result(|err: &OpenAIError| err.is_known_transient())
            ),
            Err(_) => {
                return RetryResult::Transient {
                    input: (),
                    error: anyhow!("No LLM response after {timeout:?}"),
                };
            }
        };
        let response = try_with_retry_result!(
            serde_json::from_value::<CreateChatCompletionResponse>(raw)
                .context("Error parsing chat completion response")
                .into_fatal()
        );
        let token_usage = response.usage.as_ref().map(|usage| TokenUsage {
            prompt_tokens: u64::from(usage.prompt_tokens),
            completion_tokens: u64::from(usage.completion_tokens),
        });

        let Some(choice) = response.choices.first() else {
            return retry_result_fatal(anyhow!("No choices in chat completion response"));
        };
        if choice.finish_reason == Some(FinishReason::ContentFilter) {
            return retry_result_fatal(anyhow!("Content filter triggered"));
        }
        let content = choice.message.content.as_deref().unwrap_or_default();
        debug!(%content, "Response");
        let parsed = try_with_retry_result!(
            serde_json::from_str::<Value>(strip_code_fence(content))
                .with_context(|| format!("LLM response was not JSON: {content:?}"))
                // The model may do better next time.
                .into_transient()
        );
        retry_result_ok((parsed, token_usage))
    }
}

/// Build a `/chat/completions` request body.
fn build_request(opts: &FieldOpts, messages: Value, schema: Value) -> Value {
    let mut body = json!({
        "model": opts.model,
        "messages": messages,
        "store": false,
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "ChunkFields",
                "schema": schema,
                "strict": true,
            },
        },
    });
    if let Some(max_completion_tokens) = opts.max_completion_tokens {
        body["max_completion_tokens"] = json!(max_completion_tokens);
    }
    if let Some(temperature) = opts.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

/// Remove a Markdown code fence around a response, if present. Some
/// endpoints add one even in JSON mode.
fn strip_code_fence(content: &str) -> &str {
    static FENCE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)\A\s*```(?:json)?\s*(.*?)\s*```\s*\z")
            .expect("code fence regex should be valid")
    });
    match FENCE.captures(content).and_then(|caps| caps.get(1)) {
        Some(inner) => inner.as_str(),
        None => content.trim(),
    }
}

fn output_from_resolved(
    id: Value,
    request: &ChunkRequest,
    result: ResolvedResult<(), (), (Value, Option<TokenUsage>), anyhow::Error>,
) -> WorkOutput<ChunkResponse> {
    let full_err = |err: anyhow::Error| format!("{err:?}");
    let parse = |response: Value| ChunkFields::from_response(&request.chunk, &response);
    let (parsed, token_usage, mut errors) = match result {
        ResolvedResult::Ok {
            output: (response, token_usage),
            ..
        } => (parse(response), token_usage, vec![]),
        ResolvedResult::Recovered {
            output: (response, token_usage),
            retry_errors,
            ..
        } => (
            parse(response),
            token_usage,
            retry_errors.into_iter().map(full_err).collect(),
        ),
        ResolvedResult::Fatal { error, .. } => {
            return WorkOutput::new_failed(
                id,
                vec![full_err(error)],
                ChunkResponse { fields: None },
            );
        }
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            return WorkOutput::new_failed(
                id,
                retry_errors
                    .into_iter()
                    .chain(iter::once(fatal_error))
                    .map(full_err)
                    .collect(),
                ChunkResponse { fields: None },
            );
        }
    };
    match parsed {
        Ok(fields) => WorkOutput {
            id,
            status: WorkStatus::Ok,
            token_usage,
            errors,
            data: ChunkResponse {
                fields: Some(fields),
            },
        },
        Err(err) => {
            errors.push(full_err(err));
            WorkOutput {
                id,
                status: WorkStatus::Failed,
                token_usage,
                errors,
                data: ChunkResponse { fields: None },
            }
        }
    }
}
