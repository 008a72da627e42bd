//! Structured generation: ask for JSON matching a Rust type, then decode it.
//!
//! The format instructions are derived from the target type's JSON schema so
//! the prompt and the decoder can never drift apart.

use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use super::{GenerationRequest, TextGenerator};
use crate::refine::errors::RefineError;

/// Instructions appended to the system preamble for type `T`.
pub fn format_instructions<T: JsonSchema>() -> String {
    let schema = schemars::schema_for!(T);
    let schema_json = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!(
        "Respond with exactly one JSON object that conforms to the JSON schema below. \
         Do not add commentary before or after it.\n```json\n{schema_json}\n```"
    )
}

/// Pull the JSON payload out of a model reply.
///
/// Prefers a fenced ```json block, otherwise takes the first `{` through the
/// last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

pub fn decode_structured<T: DeserializeOwned>(raw: &str) -> Result<T, RefineError> {
    let payload = extract_json_block(raw)
        .ok_or_else(|| RefineError::StructuredDecode("no JSON object in reply".into()))?;
    serde_json::from_str(payload).map_err(|e| RefineError::StructuredDecode(e.to_string()))
}

/// Run `request` and decode the reply into `T`.
pub async fn generate_structured<T>(
    generator: &dyn TextGenerator,
    request: &GenerationRequest,
) -> Result<T, RefineError>
where
    T: DeserializeOwned + JsonSchema,
{
    let mut request = request.clone();
    request.system = format!("{}\n\n{}", request.system, format_instructions::<T>());
    let raw = generator.generate(&request).await?;
    decode_structured(&raw)
}
