//! The three refinement passes.
//!
//! Each executor reads the session state, calls its capabilities under the
//! per-call timeout and returns the [`StageUpdate`] for the controller to
//! merge. Executors never mutate state and never emit lifecycle events;
//! only Generate writes `Token` events, through the shared sink.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::prompts::{self, ANALYZER_PREAMBLE, GENERATOR_PREAMBLE, REFLECTOR_PREAMBLE};
use crate::providers::{generate_structured, GenerationRequest, TextGenerator};
use crate::refine::errors::{RefineError, Recovery};
use crate::refine::events::EventSink;
use crate::refine::fallback::FallbackPolicy;
use crate::refine::types::{ReflectionVerdict, RefinementState, Stage, StageUpdate};
use crate::retrieval::{Retriever, TemplateMatch};

/// Per-session handles every stage may use.
#[derive(Clone)]
pub struct StageContext {
    pub session_id: Arc<str>,
    pub events: EventSink,
    pub call_timeout: Duration,
}

#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        state: &RefinementState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, RefineError>;
}

/// Run `fut` under `after`, mapping expiry to [`RefineError::Timeout`].
pub async fn bounded<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, RefineError>
where
    F: Future<Output = Result<T, RefineError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(RefineError::Timeout { operation, after }),
    }
}

// ── Analyze ──────────────────────────────────────────────────────────────────

pub struct AnalyzeStage {
    generator: Arc<dyn TextGenerator>,
    temperature: f64,
}

impl AnalyzeStage {
    pub fn new(generator: Arc<dyn TextGenerator>, temperature: f64) -> Self {
        Self {
            generator,
            temperature,
        }
    }
}

#[async_trait]
impl StageExecutor for AnalyzeStage {
    async fn execute(
        &self,
        state: &RefinementState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, RefineError> {
        let request = GenerationRequest::new(
            ANALYZER_PREAMBLE,
            state.original_text(),
            self.temperature,
        );
        let intent = bounded("analyze", ctx.call_timeout, self.generator.generate(&request)).await?;
        let user_intent = intent.trim().to_string();
        if user_intent.is_empty() {
            warn!(session = %ctx.session_id, "Analyzer returned no intent");
        }
        debug!(session = %ctx.session_id, chars = user_intent.len(), "Intent analyzed");
        Ok(StageUpdate::Analyzed { user_intent })
    }
}

// ── Generate ─────────────────────────────────────────────────────────────────

pub struct GenerateStage {
    generator: Arc<dyn TextGenerator>,
    retriever: Arc<dyn Retriever>,
    temperature: f64,
}

impl GenerateStage {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        retriever: Arc<dyn Retriever>,
        temperature: f64,
    ) -> Self {
        Self {
            generator,
            retriever,
            temperature,
        }
    }

    /// Template lookup that cannot fail the stage.
    async fn lookup(&self, query: &str, ctx: &StageContext) -> Option<TemplateMatch> {
        match bounded("retrieve", ctx.call_timeout, self.retriever.retrieve(query)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(session = %ctx.session_id, error = %e, "Template retrieval failed, continuing without one");
                None
            }
        }
    }
}

#[async_trait]
impl StageExecutor for GenerateStage {
    async fn execute(
        &self,
        state: &RefinementState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, RefineError> {
        let template = self.lookup(state.user_intent(), ctx).await;
        if let Some(m) = &template {
            info!(session = %ctx.session_id, template = %m.label, score = m.score, "Reference template matched");
        }

        let brief = prompts::build_generation_brief(
            state.original_text(),
            state.user_intent(),
            state.critique(),
            template.as_ref(),
        );
        let request = GenerationRequest::new(GENERATOR_PREAMBLE, brief, self.temperature);

        let events = ctx.events.clone();
        let on_token = move |fragment: &str| {
            events.token(Stage::Generate, fragment);
        };
        let improved_text = bounded(
            "generate",
            ctx.call_timeout,
            self.generator.generate_stream(&request, &on_token),
        )
        .await?;

        if improved_text.trim().is_empty() {
            return Err(RefineError::EmptyResponse(Stage::Generate));
        }

        Ok(StageUpdate::Generated {
            improved_text,
            retrieval_match: template.map(|m| m.label),
        })
    }
}

// ── Reflect ──────────────────────────────────────────────────────────────────

pub struct ReflectStage {
    generator: Arc<dyn TextGenerator>,
    temperature: f64,
    fallback: FallbackPolicy,
}

impl ReflectStage {
    pub fn new(generator: Arc<dyn TextGenerator>, temperature: f64, fallback: FallbackPolicy) -> Self {
        Self {
            generator,
            temperature,
            fallback,
        }
    }
}

#[async_trait]
impl StageExecutor for ReflectStage {
    async fn execute(
        &self,
        state: &RefinementState,
        ctx: &StageContext,
    ) -> Result<StageUpdate, RefineError> {
        let request = GenerationRequest::new(
            REFLECTOR_PREAMBLE,
            state.improved_text(),
            self.temperature,
        );
        let outcome = bounded(
            "reflect",
            ctx.call_timeout,
            generate_structured::<ReflectionVerdict>(self.generator.as_ref(), &request),
        )
        .await;

        let verdict = match outcome {
            Ok(verdict) => verdict,
            Err(e) if e.recovery(Stage::Reflect) == Recovery::FallbackVerdict => {
                self.fallback.recover(&ctx.session_id, &e)
            }
            Err(e) => return Err(e),
        };

        info!(
            session = %ctx.session_id,
            is_complete = verdict.is_complete,
            "Reflection verdict"
        );
        Ok(StageUpdate::Reflected {
            critique: verdict.critique,
            is_complete: verdict.is_complete,
        })
    }
}
