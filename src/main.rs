use anyhow::{Context, Result};
use cde::{cli::Cli, manifest::Manifest, session::CaptureSession, supervisor};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Exit status when the command could not be launched or traced at all
const TOOL_FAILURE_EXIT: i32 = 125;

/// Initialize tracing subscriber; warnings always reach stderr
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli) -> Result<i32> {
    let config = cli.capture_config()?;
    let session = CaptureSession::start(config).context("Failed to start capture session")?;

    if let Err(e) = session.cancellation().install_ctrlc_handler() {
        tracing::warn!("Interrupt handler not installed: {}", e);
    }

    let traced = supervisor::trace_command(&session, &cli.command);
    // Finish even on failure so queued copies land and the worker stops
    let capture = session.finish();
    let outcome = traced.with_context(|| format!("Failed to trace {}", cli.command[0]))?;

    if let Some(path) = &cli.manifest {
        if let Err(e) = Manifest::new(&cli.command, &outcome, &capture).write(path) {
            tracing::error!("{:#}", e);
        }
    }

    Ok(outcome.exit_code)
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("cde: {:#}", e);
            std::process::exit(TOOL_FAILURE_EXIT);
        }
    }
}
