//! Text-generation capability and backend selection.
//!
//! Stages only see `Arc<dyn TextGenerator>`. Which backend sits behind it is
//! decided once by [`select_provider`] at process start: the primary
//! (Gemini, OpenAI-compatible surface) when its endpoint answers, otherwise
//! the fallback (DeepSeek).

pub mod openai_compat;
pub mod structured;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{check_endpoint, ProviderEndpoint, RefinerConfig};
use crate::refine::errors::RefineError;

pub use openai_compat::OpenAiCompatProvider;
pub use structured::{decode_structured, extract_json_block, format_instructions, generate_structured};

/// A single chat-style generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// System preamble.
    pub system: String,
    /// User turn.
    pub user: String,
    pub temperature: f64,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f64) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature,
        }
    }
}

/// Backend that turns a request into text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RefineError>;

    /// Streamed variant. `on_token` sees each fragment in order and the
    /// return value is their concatenation.
    ///
    /// Backends without incremental output report the whole text as one
    /// fragment.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<String, RefineError> {
        let text = self.generate(request).await?;
        if !text.is_empty() {
            on_token(&text);
        }
        Ok(text)
    }
}

/// Choose the backend for this process.
///
/// Probes the primary endpoint once; an unreachable primary is logged and the
/// fallback is used without probing (it will fail loudly on first use).
pub async fn select_provider(config: &RefinerConfig) -> Result<Arc<dyn TextGenerator>, RefineError> {
    if let Some(primary) = &config.primary {
        if check_endpoint(&primary.base_url, Some(&primary.api_key)).await {
            info!(provider = %primary.name, model = %primary.model, "Primary provider reachable");
            return build(primary);
        }
        warn!(provider = %primary.name, "Primary provider unreachable, trying fallback");
    }

    match &config.fallback {
        Some(fallback) => {
            info!(provider = %fallback.name, model = %fallback.model, "Using fallback provider");
            build(fallback)
        }
        None => Err(RefineError::Configuration(
            "no reachable text-generation provider configured".into(),
        )),
    }
}

fn build(endpoint: &ProviderEndpoint) -> Result<Arc<dyn TextGenerator>, RefineError> {
    let provider = OpenAiCompatProvider::new(endpoint.clone())?;
    Ok(Arc::new(provider))
}
