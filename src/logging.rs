use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::fmt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Filter directive for a configured level. Bare levels apply to this crate
/// only; anything containing `=` or `,` is passed through as a directive.
pub fn directive(level: &str) -> String {
    let level = level.trim();
    if level.is_empty() {
        "social_tui=info".to_string()
    } else if level.contains('=') || level.contains(',') {
        level.to_string()
    } else {
        format!("social_tui={level}")
    }
}

/// Installs the global subscriber. The terminal belongs to the UI, so events
/// go to the configured log file; without one, logging stays off.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let Some(path) = config.file.as_ref() else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("logging: failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("logging: failed to open {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(directive(&config.level)))
        .context("logging: invalid level")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("logging: subscriber already installed")?;

    tracing::info!(version = crate::VERSION, "logging to {}", path.display());
    Ok(())
}
