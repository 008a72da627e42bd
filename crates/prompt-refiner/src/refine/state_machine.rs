//! Session state machine: explicit phases and legal transition guards.
//!
//! The controller calls `advance()` before every stage and once more on
//! termination. Each call validates the edge and appends a record to the
//! transition log.
//!
//! ```text
//! Start → Analyzing | Failed
//! Analyzing → Generating | Failed
//! Generating → Reflecting | Failed
//! Reflecting → Generating | Done | Failed
//! ```
//!
//! What comes after a stage is decided by [`next_after`], which applies the
//! step bound before the reviewer's completion signal.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::refine::types::{RefinementState, Stage};

/// Upper bound on stage executions counted after start (Analyze included).
pub const MAX_STEPS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Start,
    Analyzing,
    Generating,
    Reflecting,
    /// Terminal: approved or step bound reached.
    Done,
    /// Terminal: fatal error or cancellation.
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// The phase a stage runs in.
    pub fn running(stage: Stage) -> Self {
        match stage {
            Stage::Analyze => Self::Analyzing,
            Stage::Generate => Self::Generating,
            Stage::Reflect => Self::Reflecting,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Analyzing => write!(f, "Analyzing"),
            Self::Generating => write!(f, "Generating"),
            Self::Reflecting => write!(f, "Reflecting"),
            Self::Done => write!(f, "Done"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

fn is_legal_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Start, Analyzing)
            | (Analyzing, Generating)
            | (Generating, Reflecting)
            | (Reflecting, Generating)
            | (Reflecting, Done)
    )
}

// ── Decision ─────────────────────────────────────────────────────────────────

/// Why a session stopped successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The reviewer marked the draft complete.
    Approved,
    /// The step bound was reached first.
    StepLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "approved"),
            Self::StepLimit => write!(f, "step limit reached"),
        }
    }
}

/// What the controller does after a stage has been merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Run(Stage),
    Stop(StopReason),
}

/// Routing after a completed stage.
///
/// `state` must already include the merge of `completed`.
pub fn next_after(completed: Stage, state: &RefinementState, max_steps: u32) -> NextStep {
    match completed {
        Stage::Analyze => NextStep::Run(Stage::Generate),
        Stage::Generate => NextStep::Run(Stage::Reflect),
        Stage::Reflect => {
            if state.iteration_count() >= max_steps {
                NextStep::Stop(StopReason::StepLimit)
            } else if state.is_complete() {
                NextStep::Stop(StopReason::Approved)
            } else {
                NextStep::Run(Stage::Generate)
            }
        }
    }
}

/// Round number reported for a Generate pass about to start.
pub fn round_number(iteration_count: u32) -> u32 {
    (iteration_count + 1) / 2
}

// ── Transition log ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Phase,
    pub to: Phase,
    /// `iteration_count` of the session when the edge was taken.
    pub iteration: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IllegalTransition {
    pub from: Phase,
    pub to: Phase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal phase transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

pub struct StateMachine {
    current: Phase,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: Phase::Start,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> Phase {
        self.current
    }

    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    pub fn advance(&mut self, to: Phase, reason: Option<&str>) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            iteration = self.iteration,
            "Phase transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(Phase::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line history, e.g. `Start → Done (12ms, 4 transitions) [Analyzing → …]`.
    pub fn summary(&self) -> String {
        let path: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            Phase::Start,
            self.current,
            self.created_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !path.is_empty() {
            out.push_str(&format!(" [{}]", path.join(" → ")));
        }
        out
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
