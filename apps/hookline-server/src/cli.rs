//! Command-line argument parsing

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "hookline-server",
    about = "Hookline webhook ingestion server",
    version,
    long_about = "Receives provider webhooks, verifies their signatures, \
                  deduplicates and persists events, and dispatches them to \
                  the business-event handler."
)]
pub struct Args {
    /// Path to configuration file (optional; environment variables override it)
    #[arg(
        short,
        long,
        env = "CONFIG_PATH",
        default_value = "config/hookline.toml"
    )]
    pub config: PathBuf,

    /// HTTP server port, overriding `server.port`
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short,
        long,
        env = "LOG_LEVEL",
        default_value = "info",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: String,

    /// Environment (dev, staging, prod)
    #[arg(
        short,
        long,
        env = "ENVIRONMENT",
        default_value = "dev",
        value_parser = ["dev", "staging", "prod"]
    )]
    pub env: String,

    /// Enable JSON log format (useful for production)
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Args {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == Some(0) {
            anyhow::bail!("port must be non-zero");
        }
        Ok(())
    }
}
