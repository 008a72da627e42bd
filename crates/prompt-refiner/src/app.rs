//! Wiring: turn a validated `RefinerConfig` into running services, plus the
//! one-shot terminal runner used by the `refine` subcommand.

use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::RefinerConfig;
use crate::providers::select_provider;
use crate::refine::{
    RefinementController, RefinementEvent, RefinementSettings, SessionOutcome, Stage, Termination,
};
use crate::retrieval::load_retriever;
use crate::storage::postgres::PostgresStore;
use crate::storage::{CheckpointSink, MemoryStore, PromptLibrary};

/// Shared handles every front end needs.
pub struct Services {
    pub controller: Arc<RefinementController>,
    pub library: Arc<dyn PromptLibrary>,
}

pub async fn build_services(config: &RefinerConfig) -> Result<Services> {
    let generator = select_provider(config)
        .await
        .context("No usable text-generation provider")?;
    info!(provider = generator.name(), "Provider selected");

    let retriever = load_retriever(&config.templates_path);

    let (checkpoints, library): (Arc<dyn CheckpointSink>, Arc<dyn PromptLibrary>) =
        match &config.database_url {
            Some(url) => {
                let store = Arc::new(PostgresStore::new(url.clone()));
                if let Err(e) = store.connect().await {
                    warn!(error = %e, "PostgreSQL unavailable at startup; will retry on first write");
                }
                (store.clone(), store)
            }
            None => {
                warn!("POSTGRES_URL not set; checkpoints and saved prompts stay in memory");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };

    let controller = Arc::new(RefinementController::new(
        generator,
        retriever,
        checkpoints,
        RefinementSettings::from(config),
    ));

    Ok(Services {
        controller,
        library,
    })
}

/// Run one session, echoing its progress to `out`. Fails when the session
/// does not reach `Done`.
pub async fn refine_to_writer<W: Write>(
    controller: &Arc<RefinementController>,
    text: &str,
    out: &mut W,
) -> Result<SessionOutcome> {
    let session = controller.start(text);
    let mut events = session.events;

    while let Some(event) = events.recv().await {
        match event {
            RefinementEvent::Init { session_id } => writeln!(out, "session {session_id}")?,
            RefinementEvent::StageStart { stage } => writeln!(out, "\n== {stage} ==")?,
            RefinementEvent::Token { text, .. } => {
                write!(out, "{text}")?;
                out.flush()?;
            }
            RefinementEvent::StageEnd { stage, snapshot } => match stage {
                Stage::Analyze => writeln!(out, "{}", snapshot.user_intent())?,
                Stage::Generate => writeln!(out)?,
                Stage::Reflect => writeln!(
                    out,
                    "{}\n(complete: {})",
                    snapshot.critique(),
                    snapshot.is_complete()
                )?,
            },
            RefinementEvent::Error { message } => writeln!(out, "\nerror: {message}")?,
            RefinementEvent::Done => writeln!(out, "\n[done]")?,
        }
    }

    let outcome = session.handle.join().await?;
    match &outcome.termination {
        Termination::Completed(reason) => {
            writeln!(out, "\n== final prompt ({reason}) ==\n{}", outcome.state.improved_text())?;
            Ok(outcome)
        }
        Termination::Failed(message) => bail!("refinement failed: {message}"),
        Termination::Cancelled => bail!("refinement cancelled"),
    }
}
