//! formprobe CLI - Main Entry Point
//!
//! Runs end-to-end form scenarios against a locally launched web server.

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use commands::{check, doctor, run, serve};

/// formprobe - launch a server, drive a form, check the result
#[derive(Parser)]
#[command(name = "formprobe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run scenarios end to end
    Run(run::RunArgs),

    /// Parse and validate scenario files without running them
    Check(check::CheckArgs),

    /// Start a project's server and keep it up until Ctrl-C
    Serve(serve::ServeArgs),

    /// Check that the browser bridge can run
    Doctor(doctor::DoctorArgs),
}

/// Exit code when a scenario or check failed
const EXIT_FAILED: i32 = 1;
/// Exit code when the harness itself could not do its job
const EXIT_HARNESS_ERROR: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }

    let result = match cli.command {
        Commands::Run(args) => run::execute(args, cli.format).await,
        Commands::Check(args) => check::execute(args, cli.format).await,
        Commands::Serve(args) => serve::execute(args).await,
        Commands::Doctor(args) => doctor::execute(args).await,
    };

    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(EXIT_FAILED),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            std::process::exit(EXIT_HARNESS_ERROR);
        }
    }
}
