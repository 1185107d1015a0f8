//! JSON-lines trade journal of finalized positions.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// Append-only journal, one JSON object per line.
pub struct TradeJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TradeJournal {
    /// Open (or create) the journal file for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Journal file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }

    /// Append, logging instead of failing. The journal is not authoritative.
    pub fn record<T: Serialize>(&self, record: &T) {
        if let Err(e) = self.append(record) {
            warn!(path = %self.path.display(), error = %e, "Failed to write trade journal");
        }
    }
}
