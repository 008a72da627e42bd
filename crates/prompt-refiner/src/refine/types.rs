//! Session record and the per-stage updates merged into it.
//!
//! `RefinementState` has no public setters. The only way to change it is
//! [`RefinementState::apply`], which takes a [`StageUpdate`] carrying exactly
//! the fields the finishing stage owns and bumps the iteration counter.

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Stage ────────────────────────────────────────────────────────────────────

/// One refinement pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "analyzer")]
    Analyze,
    #[serde(rename = "generator")]
    Generate,
    #[serde(rename = "reflector")]
    Reflect,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Self::Analyze => "analyzer",
            Self::Generate => "generator",
            Self::Reflect => "reflector",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── StageUpdate ──────────────────────────────────────────────────────────────

/// Partial result of one stage execution.
#[derive(Debug, Clone, PartialEq)]
pub enum StageUpdate {
    Analyzed {
        user_intent: String,
    },
    Generated {
        improved_text: String,
        retrieval_match: Option<String>,
    },
    Reflected {
        critique: String,
        is_complete: bool,
    },
}

impl StageUpdate {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Analyzed { .. } => Stage::Analyze,
            Self::Generated { .. } => Stage::Generate,
            Self::Reflected { .. } => Stage::Reflect,
        }
    }
}

// ── RefinementState ──────────────────────────────────────────────────────────

/// The single record a session's controller task owns.
///
/// Serialized field names follow the web client's `updates` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementState {
    session_id: String,
    #[serde(rename = "original_prompt")]
    original_text: String,
    user_intent: String,
    #[serde(rename = "improved_prompt")]
    improved_text: String,
    critique: String,
    #[serde(rename = "rag_match")]
    retrieval_match: Option<String>,
    iteration_count: u32,
    #[serde(rename = "is_perfect")]
    is_complete: bool,
    current_stage: Option<Stage>,
}

impl RefinementState {
    pub fn new(session_id: impl Into<String>, original_text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            original_text: original_text.into(),
            user_intent: String::new(),
            improved_text: String::new(),
            critique: String::new(),
            retrieval_match: None,
            iteration_count: 0,
            is_complete: false,
            current_stage: None,
        }
    }

    /// Merge a stage's result into the record.
    ///
    /// The counter moves by exactly one per call and `is_complete` never
    /// goes back to `false` once set.
    pub fn apply(&mut self, update: StageUpdate) {
        let stage = update.stage();
        match update {
            StageUpdate::Analyzed { user_intent } => {
                self.user_intent = user_intent;
            }
            StageUpdate::Generated {
                improved_text,
                retrieval_match,
            } => {
                self.improved_text = improved_text;
                self.retrieval_match = retrieval_match;
            }
            StageUpdate::Reflected {
                critique,
                is_complete,
            } => {
                self.critique = critique;
                self.is_complete = self.is_complete || is_complete;
            }
        }
        self.current_stage = Some(stage);
        self.iteration_count += 1;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn original_text(&self) -> &str {
        &self.original_text
    }

    pub fn user_intent(&self) -> &str {
        &self.user_intent
    }

    pub fn improved_text(&self) -> &str {
        &self.improved_text
    }

    pub fn critique(&self) -> &str {
        &self.critique
    }

    pub fn retrieval_match(&self) -> Option<&str> {
        self.retrieval_match.as_deref()
    }

    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    pub fn current_stage(&self) -> Option<Stage> {
        self.current_stage
    }
}

// ── ReflectionVerdict ────────────────────────────────────────────────────────

/// Structured reply expected from the reviewer model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReflectionVerdict {
    /// Review comments and concrete suggestions for the next revision.
    pub critique: String,
    /// True when the prompt needs no further revision.
    #[serde(alias = "is_perfect")]
    pub is_complete: bool,
}
