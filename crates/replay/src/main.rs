//! `pipedash-replay`: feed a recorded event log through the cache sync engine
//! and print the resulting cache state as JSON.

mod cli;
mod logging;
mod replay;

use crate::cli::Cli;
use crate::logging::{TracingConfig, replay_id};
use clap::Parser;
use miette::{Context, IntoDiagnostic};
use std::io::Write;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    logging::init_tracing(&TracingConfig {
        format: cli.format,
        level: cli.level.into(),
    })?;

    let config = cli.sync_config()?;
    tracing::debug!(?config, "Resolved sync configuration");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted; finishing replay");
                cancel.cancel();
            }
        });
    }

    let summary = if cli.reads_stdin() {
        replay::replay(BufReader::new(tokio::io::stdin()), config, replay_id(), cancel).await?
    } else {
        let file = tokio::fs::File::open(&cli.log)
            .await
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to open event log {}", cli.log.display()))?;
        replay::replay(BufReader::new(file), config, replay_id(), cancel).await?
    };

    let json = serde_json::to_string_pretty(&summary).into_diagnostic()?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}").into_diagnostic()?;
    Ok(())
}
