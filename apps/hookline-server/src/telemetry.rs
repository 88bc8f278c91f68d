//! Telemetry initialization (logging)

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::Args;

/// Guards that must be kept alive for the duration of the program
pub struct TelemetryGuards;

/// Initialize the tracing subscriber; `RUST_LOG` wins over `--log-level`
pub fn init_telemetry(args: &Args) -> Result<TelemetryGuards> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&args.log_level)))
        .context("Failed to create environment filter")?;

    if args.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true),
            )
            .init();
    };

    Ok(TelemetryGuards)
}

/// Pipeline crates at the requested level, HTTP plumbing one notch quieter
fn default_directives(level_str: &str) -> String {
    let level = get_log_level(level_str);
    let plumbing = if level == Level::TRACE { Level::DEBUG } else { Level::WARN };
    format!(
        "{level},hookline_webhook={level},hookline_server={level},tower_http={plumbing},hyper={plumbing}",
        level = level.as_str().to_lowercase(),
        plumbing = plumbing.as_str().to_lowercase(),
    )
}

/// Helper to get the current log level
pub fn get_log_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}
