//! Thin CLI over the retrieval core. Flag parsing and exit-code mapping
//! live here; all behavior is in the `retrieval-pipeline` and `learning`
//! crates.

mod commands;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::{error::PampaxError, utils::config::get_config};
use retrieval_pipeline::ops;

#[derive(Parser)]
#[command(name = "pampax", about = "Code-aware indexing and retrieval engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the store and bring the schema up to date.
    Init,
    /// Ranked search results without packing.
    Search(commands::SearchArgs),
    /// Assemble a token-budgeted context bundle.
    Assemble(commands::AssembleArgs),
    /// Rerank candidate lists through a provider.
    Rerank(commands::RerankArgs),
    /// Store a session memory.
    Remember(commands::RememberArgs),
    /// List session memories.
    Recall(commands::RecallArgs),
    /// Delete memories by id or filter.
    Forget(commands::ForgetArgs),
    /// Pin a span into session memory.
    Pin(commands::PinArgs),
    /// Run the offline learner over recent interactions.
    Learn(commands::LearnArgs),
    /// Show, validate, or export the effective configuration.
    Config(commands::ConfigArgs),
    /// Component health report.
    Health,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let command_name = command_name(&cli.command);

    let config = match get_config() {
        Ok(config) => config,
        Err(err) => {
            let err = PampaxError::InvalidInput(format!("configuration error: {err}"));
            emit(&ops::error_envelope(command_name, &err));
            std::process::exit(err.exit_code());
        }
    };

    match commands::run(cli.command, config).await {
        Ok(value) => emit(&value),
        Err(err) => {
            error!(error = %err, command = command_name, "Command failed");
            emit(&ops::error_envelope(command_name, &err));
            std::process::exit(err.exit_code());
        }
    }
}

const fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Init => "init",
        Command::Search(_) => "search",
        Command::Assemble(_) => "assemble",
        Command::Rerank(_) => "rerank",
        Command::Remember(_) => "remember",
        Command::Recall(_) => "recall",
        Command::Forget(_) => "forget",
        Command::Pin(_) => "pin",
        Command::Learn(_) => "learn",
        Command::Config(_) => "config",
        Command::Health => "health",
    }
}

fn emit(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => {
            eprintln!("failed to render response: {err}");
            std::process::exit(6);
        }
    }
}
