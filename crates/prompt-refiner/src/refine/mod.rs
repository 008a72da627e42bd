//! Bounded iterative refinement: session state, stages, events and the
//! controller that sequences them.

pub mod controller;
pub mod errors;
pub mod events;
pub mod fallback;
pub mod stages;
pub mod state_machine;
pub mod types;

pub use controller::{
    RefinementController, RefinementSession, RefinementSettings, SessionHandle, SessionOutcome,
    Termination,
};
pub use errors::{ErrorKind, Recovery, RefineError};
pub use events::{event_channel, EventSink, EventStream, RefinementEvent};
pub use fallback::{FallbackPolicy, FALLBACK_CRITIQUE};
pub use state_machine::{StopReason, MAX_STEPS};
pub use types::{ReflectionVerdict, RefinementState, Stage, StageUpdate};
