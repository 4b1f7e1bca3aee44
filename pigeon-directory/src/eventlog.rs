//! Append-only event log: human-readable timestamped lines, one file per
//! server run. Independent of the registry snapshot; diagnostics only.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

/// Writer for the directory's audit log. Each append opens, writes one line,
/// and closes, so a crash never leaves more than one partial line.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Create a new log file named after the start time, with a header.
    pub fn create(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let started = Utc::now();
        let path = dir.join(format!(
            "directory_server_{}.log",
            started.format("%Y%m%d_%H%M%S")
        ));
        let mut f = std::fs::File::create(&path)?;
        writeln!(
            f,
            "Directory Server Log - Started at {}",
            started.format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f)?;
        Ok(Self { path })
    }

    /// Append one `[timestamp] TYPE: message` line.
    pub fn append(&self, event_type: &str, message: &str) -> std::io::Result<()> {
        let mut f = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        writeln!(
            f,
            "[{}] {}: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            event_type,
            message
        )
    }

    /// Like `append`, but a write failure only produces a warning. The event
    /// log is best-effort; it must never fail an operation.
    pub fn record(&self, event_type: &str, message: &str) {
        if let Err(e) = self.append(event_type, message) {
            tracing::warn!("event log write failed: {e}");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
