//! Bulk export and import of stored events as JSON lines.

use serde::{Deserialize, Serialize};
use tidings_protocol::Event;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;

use super::{EventQuery, EventStore, MAX_QUERY_LIMIT};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportFailure {
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportReport {
    pub imported: usize,
    pub failures: Vec<ImportFailure>,
}

/// Write every stored event, oldest first, one JSON object per line.
///
/// Returns the number of events written.
pub async fn export_jsonl<W>(store: &dyn EventStore, writer: &mut W) -> Result<usize>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut offset = 0;
    loop {
        let page = store
            .query(
                &EventQuery::new()
                    .with_limit(MAX_QUERY_LIMIT)
                    .with_offset(offset),
            )
            .await?;

        for event in &page {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');
            writer.write_all(&line).await?;
        }
        offset += page.len();

        if page.len() < MAX_QUERY_LIMIT {
            break;
        }
    }

    writer.flush().await?;
    Ok(offset)
}

/// Read JSON lines into the store. A line that fails to parse or store is
/// reported in the result and does not stop the import.
pub async fn import_jsonl<R>(store: &dyn EventStore, reader: R) -> Result<ImportReport>
where
    R: AsyncBufRead + Unpin,
{
    let mut report = ImportReport::default();
    let mut lines = reader.lines();
    let mut line_no = 0;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<Event>(&line) {
            Ok(event) => store.store(event).await,
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(()) => report.imported += 1,
            Err(e) => {
                warn!(line = line_no, "Failed to import event: {}", e);
                report.failures.push(ImportFailure {
                    line: line_no,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(report)
}
