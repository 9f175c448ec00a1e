//! Subscriber setup for the daemon

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use tracing::Level;

/// How the daemon reports what it does, fixed once at startup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Log at DEBUG instead of INFO
    pub verbose: bool,
    /// Append to this file instead of writing to stderr
    pub file: Option<PathBuf>,
}

impl LogConfig {
    pub fn level(&self) -> Level {
        if self.verbose { Level::DEBUG } else { Level::INFO }
    }

    /// Install the global `tracing` subscriber
    pub fn init(&self) -> Result<()> {
        let builder = tracing_subscriber::fmt().with_max_level(self.level());

        match &self.file {
            Some(path) => {
                let file = open_log_file(path)?;
                builder
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .try_init()
                    .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
            }
            None => builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow!("Failed to install log subscriber: {}", e)),
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}
