use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use prompt_refiner::config::RefinerConfig;
use prompt_refiner::prompts::PROMPT_VERSION;
use prompt_refiner::{app, server, telemetry};

#[derive(Parser)]
#[command(name = "prompt-refiner")]
#[command(version, about = "Iteratively analyze, rewrite and review prompts with an LLM")]
struct Cli {
    /// TOML config file; environment variables override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API
    Serve {
        /// Address to bind, e.g. 127.0.0.1:8000
        #[arg(long)]
        bind: Option<String>,
    },
    /// Refine a single prompt and print the progress to stdout
    Refine {
        /// The prompt to refine
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = RefinerConfig::load(cli.config.as_deref())?;
    let _telemetry = telemetry::init(&config.log_dir);
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .context("Invalid configuration")?;

    info!(
        prompt_version = PROMPT_VERSION,
        max_steps = config.max_steps,
        timeout_secs = config.call_timeout_secs,
        "prompt-refiner starting"
    );

    let services = app::build_services(&config).await?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            server::start_server(&config.bind_addr, services).await
        }
        Commands::Refine { text } => {
            let mut stdout = std::io::stdout();
            app::refine_to_writer(&services.controller, &text, &mut stdout).await?;
            Ok(())
        }
    }
}
