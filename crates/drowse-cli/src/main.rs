//! drowse command-line entry point.
//!
//! Logs go to stderr so command output on stdout stays scriptable.
//! `RUST_LOG` overrides the default `drowse=info` filter.

mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::Cli;
use drowse_core::CoreError;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(verbose: bool) {
    let default = if verbose { "drowse=debug" } else { "drowse=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn report(err: &anyhow::Error) {
    eprintln!("Error: {err:#}");
    if let Some(hint) = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<CoreError>())
        .and_then(CoreError::hint)
    {
        eprintln!("Hint: {hint}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match commands::dispatch(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}
