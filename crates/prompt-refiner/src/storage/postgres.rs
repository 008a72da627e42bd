//! PostgreSQL-backed checkpoint sink and prompt library.
//!
//! The connection is opened lazily on first use and reopened if the previous
//! one has closed, so a database that comes up after the service does is
//! picked up without a restart. Opening, schema setup included, is bounded by
//! twice [`CONNECT_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{info, warn};

use super::{CheckpointRecord, CheckpointSink, LibraryEntry, PromptLibrary};
use crate::refine::errors::RefineError;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS prompt_history (
    id SERIAL PRIMARY KEY,
    session_id VARCHAR(50) NOT NULL,
    stage VARCHAR(16),
    original_prompt TEXT,
    user_intent TEXT,
    improved_prompt TEXT,
    critique TEXT,
    iteration_count INTEGER NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
ALTER TABLE prompt_history ADD COLUMN IF NOT EXISTS stage VARCHAR(16);
CREATE INDEX IF NOT EXISTS idx_prompt_history_session ON prompt_history (session_id);
CREATE TABLE IF NOT EXISTS user_prompts (
    id SERIAL PRIMARY KEY,
    session_id VARCHAR(50),
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    tags TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
";

/// Applied when the URL does not set `connect_timeout` itself.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INSERT_CHECKPOINT: &str = "
INSERT INTO prompt_history
    (session_id, stage, original_prompt, user_intent, improved_prompt, critique, iteration_count, created_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)";

const INSERT_ENTRY: &str = "
INSERT INTO user_prompts (session_id, title, content, tags)
VALUES ($1, $2, $3, $4)";

pub struct PostgresStore {
    url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl PostgresStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Mutex::new(None),
        }
    }

    /// Open the connection eagerly and make sure the tables exist.
    pub async fn connect(&self) -> Result<(), RefineError> {
        self.client().await.map(|_| ())
    }

    async fn client(&self) -> Result<Arc<Client>, RefineError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            warn!("PostgreSQL connection closed, reconnecting");
        }

        let config = connect_config(&self.url)?;
        let budget = CONNECT_TIMEOUT * 2;
        let client = tokio::time::timeout(budget, open(config))
            .await
            .map_err(|_| {
                RefineError::Persistence(format!("connect timed out after {}s", budget.as_secs()))
            })??;
        info!("PostgreSQL connected, schema ready");

        let client = Arc::new(client);
        *guard = Some(client.clone());
        Ok(client)
    }
}

fn connect_config(url: &str) -> Result<Config, RefineError> {
    let mut config: Config = url
        .parse()
        .map_err(|e| RefineError::Persistence(format!("invalid database url: {e}")))?;
    if config.get_connect_timeout().is_none() {
        config.connect_timeout(CONNECT_TIMEOUT);
    }
    Ok(config)
}

async fn open(config: Config) -> Result<Client, RefineError> {
    let (client, connection) = config
        .connect(NoTls)
        .await
        .map_err(|e| RefineError::Persistence(format!("connect failed: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "PostgreSQL connection error");
        }
    });

    client
        .batch_execute(SCHEMA)
        .await
        .map_err(|e| RefineError::Persistence(format!("schema setup failed: {e}")))?;
    Ok(client)
}

#[async_trait]
impl CheckpointSink for PostgresStore {
    async fn append_record(&self, record: CheckpointRecord) -> Result<(), RefineError> {
        let client = self.client().await?;
        let stage = record.stage.label();
        let iteration = record.iteration_count as i32;
        client
            .execute(
                INSERT_CHECKPOINT,
                &[
                    &record.session_id,
                    &stage,
                    &record.original_text,
                    &record.user_intent,
                    &record.improved_text,
                    &record.critique,
                    &iteration,
                    &record.recorded_at,
                ],
            )
            .await
            .map_err(|e| RefineError::Persistence(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PromptLibrary for PostgresStore {
    async fn save_entry(&self, entry: &LibraryEntry) -> Result<(), RefineError> {
        let client = self.client().await?;
        client
            .execute(
                INSERT_ENTRY,
                &[&entry.session_id, &entry.title, &entry.content, &entry.tags],
            )
            .await
            .map_err(|e| RefineError::Persistence(e.to_string()))?;
        Ok(())
    }
}
