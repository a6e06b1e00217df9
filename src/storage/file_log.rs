//! Append-only text file sink
//!
//! One `"<txID>: <event>"` line per entry, synced before `append` returns.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{LogEntry, LogError, TransactionLog};

pub struct FileLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLog {
    /// Open (or create) the log file at `path`, appending to existing content
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TransactionLog for FileLog {
    async fn append(&self, entry: &LogEntry) -> Result<(), LogError> {
        let line = format!("{}\n", entry);
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LogEntry>, LogError> {
        // Hold the writer lock so a concurrent append is not read half-written
        let _guard = self.file.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::parse::<LogEntry>)
            .collect()
    }
}
