//! Client for OpenAI-compatible APIs (OpenAI itself, LiteLLM or Ollama).

use async_openai::{Client, config::OpenAIConfig};

use crate::prelude::*;

/// Create a client from `OPENAI_API_KEY` and `OPENAI_API_BASE`.
///
/// Field extraction can't work without a key, so we check for one here
/// instead of failing on the first chunk. Local servers which ignore keys
/// still need a placeholder.
pub fn create_llm_client() -> Result<Client<OpenAIConfig>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("OPENAI_API_KEY must be set to extract fields")?;
    let mut client_config = OpenAIConfig::new().with_api_key(api_key);
    if let Ok(api_base) = std::env::var("OPENAI_API_BASE") {
        debug!(%api_base, "Using custom LLM endpoint");
        client_config = client_config.with_api_base(api_base);
    }
    Ok(Client::with_config(client_config))
}
