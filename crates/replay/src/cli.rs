use crate::logging::{LogLevel, TracingFormat};
use clap::Parser;
use miette::Result;
use pipedash_sync::SyncConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pipedash-replay")]
#[command(about = "Replay a JSON-lines event log through the cache sync engine")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[arg(help = "Event log, one wire message per line ('-' reads stdin)")]
    pub log: PathBuf,

    #[arg(
        long,
        env = "PIPEDASH_SYNC_CONFIG",
        help = "TOML file with sync engine settings"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Override the batch window in milliseconds")]
    pub batch_window_ms: Option<u64>,

    #[arg(
        short = 'l',
        long,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    #[arg(long, help = "Log output format", default_value = "compact", value_enum)]
    pub format: TracingFormat,
}

impl Cli {
    /// Whether the log should be read from stdin
    pub fn reads_stdin(&self) -> bool {
        self.log.as_os_str() == "-"
    }

    /// Resolve the engine configuration: file, then environment, then flags
    pub fn sync_config(&self) -> Result<SyncConfig> {
        let config = match &self.config {
            Some(path) => SyncConfig::load(path)?,
            None => SyncConfig::default(),
        };
        let mut config = config.with_env_overrides()?;
        if let Some(ms) = self.batch_window_ms {
            config.batch_window_ms = ms;
            config.validate()?;
        }
        Ok(config)
    }
}
