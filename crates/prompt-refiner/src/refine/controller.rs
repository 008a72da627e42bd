//! Session driver: Analyze → (Generate → Reflect)* with a hard step bound.
//!
//! ## Lifecycle
//!
//! ```text
//! RefinementController::start(text)
//!   → spawn run(session_id, text, sink, cancel)
//!       emit Init
//!       loop:
//!         check cancellation / consumer
//!         advance phase, emit StageStart
//!         execute stage (raced against cancellation)
//!         merge update, spawn checkpoint, emit StageEnd
//!         next_after() → next stage or stop
//!       emit Done | Error (Error also on panic)
//!       release the stream, then settle checkpoint writes
//! ```
//!
//! A session owns its state outright; nothing here is shared between
//! sessions except the capability handles, which are `Arc<dyn _>`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::RefinerConfig;
use crate::providers::TextGenerator;
use crate::refine::errors::RefineError;
use crate::refine::events::{event_channel, EventSink, EventStream};
use crate::refine::fallback::FallbackPolicy;
use crate::refine::stages::{AnalyzeStage, GenerateStage, ReflectStage, StageContext, StageExecutor};
use crate::refine::state_machine::{
    next_after, round_number, NextStep, Phase, StateMachine, StopReason, TransitionRecord,
    MAX_STEPS,
};
use crate::refine::types::{RefinementState, Stage};
use crate::retrieval::Retriever;
use crate::storage::{CheckpointRecord, CheckpointSink};

// ── Settings ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RefinementSettings {
    pub max_steps: u32,
    pub call_timeout: Duration,
    pub analyzer_temperature: f64,
    pub generator_temperature: f64,
    pub reflector_temperature: f64,
}

impl Default for RefinementSettings {
    fn default() -> Self {
        Self {
            max_steps: MAX_STEPS,
            call_timeout: Duration::from_secs(120),
            analyzer_temperature: 0.3,
            generator_temperature: 0.7,
            reflector_temperature: 0.0,
        }
    }
}

impl From<&RefinerConfig> for RefinementSettings {
    fn from(config: &RefinerConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            call_timeout: config.call_timeout(),
            analyzer_temperature: config.analyzer_temperature,
            generator_temperature: config.generator_temperature,
            reflector_temperature: config.reflector_temperature,
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    Completed(StopReason),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub state: RefinementState,
    pub termination: Termination,
    pub transitions: Vec<TransitionRecord>,
}

impl SessionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.termination, Termination::Completed(_))
    }
}

// ── Session handle ───────────────────────────────────────────────────────────

/// A running session: its id, its event stream and a handle on the task.
pub struct RefinementSession {
    pub session_id: String,
    pub events: EventStream,
    pub handle: SessionHandle,
}

pub struct SessionHandle {
    cancel: CancellationToken,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    /// Ask the session to stop at the next opportunity.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the session task, including its checkpoint writes.
    pub async fn join(self) -> Result<SessionOutcome, RefineError> {
        self.task
            .await
            .map_err(|e| RefineError::Internal(anyhow::anyhow!("session task failed: {e}")))
    }
}

/// Message sent to the consumer when a session dies unexpectedly.
const INTERNAL_ERROR: &str = "internal error";

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

// ── Controller ───────────────────────────────────────────────────────────────

pub struct RefinementController {
    analyze: Box<dyn StageExecutor>,
    generate: Box<dyn StageExecutor>,
    reflect: Box<dyn StageExecutor>,
    checkpoints: Arc<dyn CheckpointSink>,
    settings: RefinementSettings,
}

impl RefinementController {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        retriever: Arc<dyn Retriever>,
        checkpoints: Arc<dyn CheckpointSink>,
        settings: RefinementSettings,
    ) -> Self {
        Self {
            analyze: Box::new(AnalyzeStage::new(
                generator.clone(),
                settings.analyzer_temperature,
            )),
            generate: Box::new(GenerateStage::new(
                generator.clone(),
                retriever,
                settings.generator_temperature,
            )),
            reflect: Box::new(ReflectStage::new(
                generator,
                settings.reflector_temperature,
                FallbackPolicy::default(),
            )),
            checkpoints,
            settings,
        }
    }

    pub fn settings(&self) -> &RefinementSettings {
        &self.settings
    }

    fn executor(&self, stage: Stage) -> &dyn StageExecutor {
        match stage {
            Stage::Analyze => self.analyze.as_ref(),
            Stage::Generate => self.generate.as_ref(),
            Stage::Reflect => self.reflect.as_ref(),
        }
    }

    /// Spawn a session and return immediately.
    pub fn start(self: &Arc<Self>, original_text: impl Into<String>) -> RefinementSession {
        let session_id = new_session_id();
        let (sink, stream) = event_channel();
        let cancel = CancellationToken::new();

        let task = {
            let controller = Arc::clone(self);
            let session_id = session_id.clone();
            let cancel = cancel.clone();
            let original_text = original_text.into();
            tokio::spawn(async move { controller.run(session_id, original_text, sink, cancel).await })
        };

        RefinementSession {
            session_id,
            events: stream,
            handle: SessionHandle { cancel, task },
        }
    }

    /// Drive one session to completion on the current task.
    ///
    /// A panic inside a stage or collaborator still ends the stream with a
    /// single `Error` event.
    pub async fn run(
        &self,
        session_id: String,
        original_text: String,
        events: EventSink,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let span = info_span!("session", session = %session_id);
        let initial = RefinementState::new(session_id.clone(), original_text.clone());
        let mut checkpoints = JoinSet::new();

        let driven = AssertUnwindSafe(
            self.drive(session_id, original_text, events.clone(), cancel, &mut checkpoints)
                .instrument(span.clone()),
        )
        .catch_unwind()
        .await;

        let outcome = match driven {
            Ok(outcome) => outcome,
            Err(payload) => {
                let detail = panic_message(payload.as_ref());
                error!(parent: &span, panic = %detail, "Refinement session panicked");
                events.error(INTERNAL_ERROR);
                SessionOutcome {
                    state: initial,
                    termination: Termination::Failed(format!("{INTERNAL_ERROR}: {detail}")),
                    transitions: Vec::new(),
                }
            }
        };
        drop(events);

        while let Some(joined) = checkpoints.join_next().await {
            if let Err(e) = joined {
                warn!(parent: &span, error = %e, "Checkpoint task panicked");
            }
        }
        outcome
    }

    async fn drive(
        &self,
        session_id: String,
        original_text: String,
        events: EventSink,
        cancel: CancellationToken,
        checkpoints: &mut JoinSet<()>,
    ) -> SessionOutcome {
        let mut machine = StateMachine::new();
        let mut state = RefinementState::new(session_id.clone(), original_text);

        events.init(&session_id);
        info!(chars = state.original_text().len(), "Refinement session started");

        let termination = if state.original_text().trim().is_empty() {
            let err = RefineError::InvalidInput("original text is empty".into());
            self.abort(&mut machine, &events, &err)
        } else {
            self.drive_stages(&mut machine, &mut state, &events, &cancel, checkpoints)
                .await
        };

        info!(
            iterations = state.iteration_count(),
            outcome = ?termination,
            history = %machine.summary(),
            "Refinement session finished"
        );

        SessionOutcome {
            state,
            termination,
            transitions: machine.transitions().to_vec(),
        }
    }

    async fn drive_stages(
        &self,
        machine: &mut StateMachine,
        state: &mut RefinementState,
        events: &EventSink,
        cancel: &CancellationToken,
        checkpoints: &mut JoinSet<()>,
    ) -> Termination {
        let ctx = StageContext {
            session_id: Arc::from(state.session_id()),
            events: events.clone(),
            call_timeout: self.settings.call_timeout,
        };
        let mut next = Stage::Analyze;

        loop {
            if cancel.is_cancelled() || events.is_closed() {
                return self.cancelled(machine, events, cancel);
            }

            machine.set_iteration(state.iteration_count());
            if let Err(e) = machine.advance(Phase::running(next), None) {
                let err = RefineError::Internal(anyhow::anyhow!(e));
                return self.abort(machine, events, &err);
            }
            if next == Stage::Generate {
                info!(round = round_number(state.iteration_count()), "Refinement round");
            }
            events.stage_start(next);

            let executor = self.executor(next);
            let result = tokio::select! {
                _ = cancel.cancelled() => Err(RefineError::Cancelled),
                _ = events.closed() => Err(RefineError::Cancelled),
                r = executor.execute(state, &ctx) => r,
            };

            let update = match result {
                Ok(update) => update,
                Err(RefineError::Cancelled) => return self.cancelled(machine, events, cancel),
                Err(e) => {
                    error!(stage = %next, kind = %e.kind(), error = %e, "Stage failed");
                    return self.abort(machine, events, &e);
                }
            };

            state.apply(update);
            self.checkpoint(checkpoints, CheckpointRecord::capture(next, state));
            events.stage_end(next, state.clone());
            debug!(stage = %next, iteration = state.iteration_count(), "Stage merged");

            match next_after(next, state, self.settings.max_steps) {
                NextStep::Run(stage) => next = stage,
                NextStep::Stop(reason) => {
                    machine.set_iteration(state.iteration_count());
                    if let Err(e) = machine.advance(Phase::Done, Some(&reason.to_string())) {
                        let err = RefineError::Internal(anyhow::anyhow!(e));
                        return self.abort(machine, events, &err);
                    }
                    info!(%reason, iterations = state.iteration_count(), "Refinement complete");
                    events.done();
                    return Termination::Completed(reason);
                }
            }
        }
    }

    fn abort(&self, machine: &mut StateMachine, events: &EventSink, err: &RefineError) -> Termination {
        let message = err.to_string();
        if let Err(e) = machine.fail(&message) {
            warn!(error = %e, "Failed to record failure transition");
        }
        events.error(message.clone());
        Termination::Failed(message)
    }

    fn cancelled(
        &self,
        machine: &mut StateMachine,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Termination {
        cancel.cancel();
        info!(consumer_gone = events.is_closed(), "Refinement session cancelled");
        if let Err(e) = machine.fail("cancelled") {
            warn!(error = %e, "Failed to record cancellation transition");
        }
        events.error(RefineError::Cancelled.to_string());
        Termination::Cancelled
    }

    /// Fire-and-forget write; tracked only so the session can settle it
    /// before its task ends.
    fn checkpoint(&self, tasks: &mut JoinSet<()>, record: CheckpointRecord) {
        let sink = Arc::clone(&self.checkpoints);
        let timeout = self.settings.call_timeout;
        let stage = record.stage;
        let ordinal = record.iteration_count;
        tasks.spawn(
            async move {
                match tokio::time::timeout(timeout, sink.append_record(record)).await {
                    Ok(Ok(())) => debug!(%stage, ordinal, "Checkpoint written"),
                    Ok(Err(e)) => warn!(%stage, ordinal, error = %e, "Checkpoint write failed"),
                    Err(_) => warn!(%stage, ordinal, "Checkpoint write timed out"),
                }
            }
            .in_current_span(),
        );
    }
}
