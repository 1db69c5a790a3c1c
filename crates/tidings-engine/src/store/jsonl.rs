use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tidings_protocol::Event;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{EventQuery, EventStore, MemoryEventStore};
use crate::error::Result;

/// Append-only JSON-lines file backed by an in-memory index.
///
/// Every stored event is written as one line and flushed before the call
/// returns. Lines already in the file are loaded on open; lines that fail to
/// parse are skipped with a warning.
pub struct JsonlEventStore {
    path: PathBuf,
    file: Mutex<File>,
    index: MemoryEventStore,
}

impl JsonlEventStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_index(path, MemoryEventStore::unbounded()).await
    }

    /// Open with a custom index, e.g. a bounded [`MemoryEventStore`] to cap
    /// memory while the file keeps the full history
    pub async fn open_with_index(path: impl AsRef<Path>, index: MemoryEventStore) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;

        let loaded = load_existing(&path, &index).await?;
        info!(path = %path.display(), loaded, "Opened event log");

        Ok(Self {
            path,
            file: Mutex::new(file),
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

async fn load_existing(path: &Path, index: &MemoryEventStore) -> Result<usize> {
    let reader = BufReader::new(File::open(path).await?);
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut loaded = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                index.store(event).await?;
                loaded += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), line = line_no, "Skipping malformed event: {}", e);
            }
        }
    }

    Ok(loaded)
}

#[async_trait]
impl EventStore for JsonlEventStore {
    async fn store(&self, event: Event) -> Result<()> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        // Holding the file lock across the index update keeps both in the same order
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        self.index.store(event).await
    }

    async fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.index.query(query).await
    }

    async fn count(&self) -> Result<usize> {
        self.index.count().await
    }

    async fn clear(&self) -> Result<()> {
        let file = self.file.lock().await;
        file.set_len(0).await?;
        self.index.clear().await
    }
}
