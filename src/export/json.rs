use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::SinkError;
use crate::state::MetricsSnapshot;

/// Destination for periodic and final snapshots
pub trait SnapshotSink: Send {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError>;
}

impl<F> SnapshotSink for F
where
    F: FnMut(&MetricsSnapshot) -> Result<(), SinkError> + Send,
{
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        self(snapshot)
    }
}

/// Discards every snapshot
#[derive(Debug, Default)]
pub struct NullSink;

impl SnapshotSink for NullSink {
    fn publish(&mut self, _snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps one JSON document on disk up to date
///
/// Each write goes to a sibling temp file that is then renamed over the
/// target, so a reader polling the file never sees a partial document.
#[derive(Debug)]
pub struct JsonFileSink {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        Self {
            path,
            tmp_path: PathBuf::from(tmp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotSink for JsonFileSink {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        let data = serde_json::to_vec(snapshot)?;
        fs::write(&self.tmp_path, data)?;
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}

/// Writes one JSON object per line to stdout
#[derive(Debug, Default)]
pub struct StdoutSink;

impl SnapshotSink for StdoutSink {
    fn publish(&mut self, snapshot: &MetricsSnapshot) -> Result<(), SinkError> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        serde_json::to_writer(&mut lock, snapshot)?;
        writeln!(lock)?;
        lock.flush()?;
        Ok(())
    }
}
