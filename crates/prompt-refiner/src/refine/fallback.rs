//! Degraded verdict used when the reviewer cannot produce one.

use tracing::error;

use crate::refine::errors::RefineError;
use crate::refine::types::ReflectionVerdict;

pub const FALLBACK_CRITIQUE: &str =
    "The review service is temporarily unavailable; continuing with the next refinement round.";

/// Replaces a failed reflection with a fixed, never-complete verdict.
#[derive(Debug, Clone)]
pub struct FallbackPolicy {
    critique: String,
}

impl Default for FallbackPolicy {
    fn default() -> Self {
        Self {
            critique: FALLBACK_CRITIQUE.into(),
        }
    }
}

impl FallbackPolicy {
    pub fn verdict(&self) -> ReflectionVerdict {
        ReflectionVerdict {
            critique: self.critique.clone(),
            is_complete: false,
        }
    }

    /// Log `cause` and hand back the fallback verdict.
    pub fn recover(&self, session_id: &str, cause: &RefineError) -> ReflectionVerdict {
        error!(
            session = session_id,
            kind = %cause.kind(),
            error = %cause,
            "Reflection failed, using fallback verdict"
        );
        self.verdict()
    }
}
