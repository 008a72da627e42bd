//! OpenAI-compatible chat backend (Gemini's `/v1beta/openai` surface, DeepSeek).
//!
//! One-shot calls go through a rig agent built per request (the preamble and
//! temperature differ per stage). Streaming talks to
//! `{base_url}/chat/completions` directly with `stream: true` and decodes the
//! SSE body line by line.

use async_trait::async_trait;
use futures::StreamExt;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{GenerationRequest, TextGenerator};
use crate::config::ProviderEndpoint;
use crate::refine::errors::RefineError;

pub struct OpenAiCompatProvider {
    endpoint: ProviderEndpoint,
    client: openai::CompletionsClient,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Result<Self, RefineError> {
        let client = openai::CompletionsClient::builder()
            .api_key(&endpoint.api_key)
            .base_url(&endpoint.base_url)
            .build()
            .map_err(|e| {
                RefineError::Configuration(format!(
                    "failed to build {} client: {e}",
                    endpoint.name
                ))
            })?;

        Ok(Self {
            endpoint,
            client,
            http: reqwest::Client::new(),
        })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }

    fn failure(&self, message: impl std::fmt::Display) -> RefineError {
        RefineError::provider(self.endpoint.name.clone(), message)
    }
}

#[async_trait]
impl TextGenerator for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RefineError> {
        let agent = self
            .client
            .agent(&self.endpoint.model)
            .preamble(&request.system)
            .temperature(request.temperature)
            .build();

        agent
            .prompt(request.user.as_str())
            .await
            .map_err(|e| self.failure(e))
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
        on_token: &(dyn for<'t> Fn(&'t str) + Send + Sync),
    ) -> Result<String, RefineError> {
        let body = json!({
            "model": self.endpoint.model,
            "stream": true,
            "temperature": request.temperature,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.user },
            ],
        });

        let response = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.endpoint.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.failure(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(self.failure(format!("HTTP {status}: {detail}")));
        }

        let mut decoder = SseLineDecoder::default();
        let mut text = String::new();
        let mut stream = response.bytes_stream();
        let mut saw_done = false;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.failure(e))?;
            for line in decoder.push(&chunk) {
                match parse_sse_line(&line)? {
                    SseLine::Delta(fragment) => {
                        on_token(&fragment);
                        text.push_str(&fragment);
                    }
                    SseLine::Done => {
                        saw_done = true;
                        break 'read;
                    }
                    SseLine::Skip => {}
                }
            }
        }

        // body closed mid-line, without a trailing newline or `[DONE]`
        if !saw_done {
            if let Some(line) = decoder.finish() {
                if let SseLine::Delta(fragment) = parse_sse_line(&line)? {
                    on_token(&fragment);
                    text.push_str(&fragment);
                }
            }
        }

        debug!(provider = %self.endpoint.name, chars = text.len(), "stream finished");
        Ok(text)
    }
}

// ── SSE decoding ─────────────────────────────────────────────────────────────

/// Splits a byte stream into complete lines without breaking UTF-8 sequences
/// that straddle chunk boundaries.
#[derive(Default)]
struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }

    /// Whatever is left once the body has ended.
    fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

#[derive(Deserialize)]
struct ChunkBody {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

fn parse_sse_line(line: &str) -> Result<SseLine, RefineError> {
    let Some(data) = line.strip_prefix("data:") else {
        // comments, `event:` and `id:` lines
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let body: ChunkBody = serde_json::from_str(data)
        .map_err(|e| RefineError::provider("stream", format!("bad chunk: {e}")))?;
    if let Some(error) = body.error {
        return Err(RefineError::provider("stream", error));
    }

    let fragment: String = body
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    if fragment.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Delta(fragment))
    }
}
