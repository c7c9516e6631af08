// Starflow CLI
// Entry point for the `starflow` binary: run or validate a pipeline file

mod commands;
mod logging;
mod output;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Batch star-schema ETL runner
#[derive(Parser, Debug)]
#[command(name = "starflow", version, about)]
struct Cli {
    /// Log level used when RUST_LOG is not set (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "warn", value_name = "LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline to its terminal outcome
    Run(commands::run::RunArgs),

    /// Check a pipeline file without running it
    Validate(commands::validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logging::init(&cli.log_level);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
    }
}
