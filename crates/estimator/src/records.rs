//! Drains learning records into a JSON-lines file

use estimator_lib::sink::PredictionRecord;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Consume records until every sender is dropped
///
/// With no `path` records are counted and discarded. Returns how many
/// records were written.
pub async fn drain(mut rx: mpsc::Receiver<PredictionRecord>, path: Option<PathBuf>) -> anyhow::Result<u64> {
    let mut file = match &path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path).await?;
            info!(path = %path.display(), "Writing learning records");
            Some(file)
        }
        None => None,
    };

    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        let Some(file) = file.as_mut() else {
            debug!(record_id = %record.record_id, "Discarding learning record");
            continue;
        };

        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(record_id = %record.record_id, error = %e, "Failed to serialize learning record");
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = file.write_all(&line).await {
            warn!(error = %e, "Failed to write learning record");
            continue;
        }
        written += 1;
    }

    if let Some(file) = file.as_mut() {
        file.flush().await?;
    }
    Ok(written)
}
