//! Durable side effects: per-stage checkpoints and the saved-prompt library.
//!
//! Both are best-effort from the session's point of view. The controller
//! never reads checkpoints back, and a failed write is logged rather than
//! surfaced to the event stream.

pub mod postgres;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::refine::errors::RefineError;
use crate::refine::types::{RefinementState, Stage};

pub use postgres::PostgresStore;

pub const DEFAULT_LIBRARY_TITLE: &str = "Untitled prompt";
pub const DEFAULT_LIBRARY_TAGS: &str = "ai-refined";

// ── Checkpoints ──────────────────────────────────────────────────────────────

/// Write-once row describing one stage execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckpointRecord {
    pub session_id: String,
    pub stage: Stage,
    /// Stage ordinal within the session: the iteration count before the
    /// stage's merge (0 for Analyze).
    pub iteration_count: u32,
    pub original_text: String,
    pub user_intent: Option<String>,
    pub improved_text: Option<String>,
    pub critique: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointRecord {
    /// Capture the fields known once `stage` has been merged into `state`.
    ///
    /// Analyze rows carry the intent, Generate rows add the draft, and only
    /// Reflect rows carry a critique.
    pub fn capture(stage: Stage, state: &RefinementState) -> Self {
        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            session_id: state.session_id().to_string(),
            stage,
            iteration_count: state.iteration_count().saturating_sub(1),
            original_text: state.original_text().to_string(),
            user_intent: non_empty(state.user_intent()),
            improved_text: match stage {
                Stage::Analyze => None,
                _ => non_empty(state.improved_text()),
            },
            critique: match stage {
                Stage::Reflect => Some(state.critique().to_string()),
                _ => None,
            },
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait CheckpointSink: Send + Sync {
    async fn append_record(&self, record: CheckpointRecord) -> Result<(), RefineError>;
}

// ── Prompt library ───────────────────────────────────────────────────────────

/// A prompt the user chose to keep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub title: String,
    pub content: String,
    pub session_id: Option<String>,
    pub tags: String,
}

/// Body of a save-to-library call. Absent fields take the library defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub success: bool,
    pub message: String,
}

impl SaveOutcome {
    fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: &str) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait PromptLibrary: Send + Sync {
    async fn save_entry(&self, entry: &LibraryEntry) -> Result<(), RefineError>;
}

/// Validate `request`, fill defaults and store it.
///
/// Empty content is rejected before the library is touched.
pub async fn save_to_library(library: &dyn PromptLibrary, request: SaveRequest) -> SaveOutcome {
    if request.content.trim().is_empty() {
        return SaveOutcome::failed("content cannot be empty");
    }

    let entry = LibraryEntry {
        title: request
            .title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LIBRARY_TITLE.into()),
        content: request.content,
        session_id: request.session_id.filter(|s| !s.is_empty()),
        tags: request
            .tags
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LIBRARY_TAGS.into()),
    };

    match library.save_entry(&entry).await {
        Ok(()) => {
            info!(title = %entry.title, session = ?entry.session_id, "Prompt saved to library");
            SaveOutcome::ok("saved to library")
        }
        Err(e) => {
            warn!(error = %e, "Saving prompt to library failed");
            SaveOutcome::failed("failed to save prompt; check the database connection")
        }
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Process-local store used when no database is configured, and in tests.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<CheckpointRecord>>,
    entries: Mutex<Vec<LibraryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkpoints sorted by session, then by stage ordinal.
    pub fn records(&self) -> Vec<CheckpointRecord> {
        let mut records = self
            .records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.session_id
                .cmp(&b.session_id)
                .then(a.iteration_count.cmp(&b.iteration_count))
        });
        records
    }

    pub fn entries(&self) -> Vec<LibraryEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CheckpointSink for MemoryStore {
    async fn append_record(&self, record: CheckpointRecord) -> Result<(), RefineError> {
        self.records
            .lock()
            .map_err(|e| RefineError::Persistence(e.to_string()))?
            .push(record);
        Ok(())
    }
}

#[async_trait]
impl PromptLibrary for MemoryStore {
    async fn save_entry(&self, entry: &LibraryEntry) -> Result<(), RefineError> {
        self.entries
            .lock()
            .map_err(|e| RefineError::Persistence(e.to_string()))?
            .push(entry.clone());
        Ok(())
    }
}
