//! Scratchpad de auditoría: registro sólo-añadir en JSON Lines.
//!
//! Se guarda en orden de creación; quien lo muestra lo invierte.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::models::AuditEntry;

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<()>;

    /// Últimas `limit` entradas, en orden de creación.
    async fn read(&self, limit: usize) -> Result<Vec<AuditEntry>>;

    async fn clear(&self) -> Result<()>;
}

pub struct JsonlScratchpad {
    path: PathBuf,
    // Serializa las escrituras y guarda el último timestamp emitido.
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl JsonlScratchpad {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PipelineError::AuditWrite(e.to_string()))?;
        }
        let pad = Self {
            path,
            last_timestamp: Mutex::new(None),
        };
        let last = pad.read(1).await?.pop().map(|e| e.timestamp);
        *pad.last_timestamp.lock().await = last;
        Ok(pad)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlScratchpad {
    async fn append(&self, mut entry: AuditEntry) -> Result<()> {
        let mut last = self.last_timestamp.lock().await;
        // Timestamps no decrecientes aunque el reloj retroceda.
        if let Some(prev) = *last {
            if entry.timestamp < prev {
                entry.timestamp = prev;
            }
        }

        let mut line =
            serde_json::to_vec(&entry).map_err(|e| PipelineError::AuditWrite(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PipelineError::AuditWrite(e.to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| PipelineError::AuditWrite(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| PipelineError::AuditWrite(e.to_string()))?;

        *last = Some(entry.timestamp);
        Ok(())
    }

    async fn read(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PipelineError::AuditRead(e.to_string())),
        };

        let mut entries: Vec<AuditEntry> = Vec::new();
        for (i, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Línea {} del scratchpad ilegible: {e}", i + 1),
            }
        }

        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    async fn clear(&self) -> Result<()> {
        let _guard = self.last_timestamp.lock().await;
        tokio::fs::write(&self.path, b"")
            .await
            .map_err(|e| PipelineError::AuditWrite(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditStep;

    #[tokio::test]
    async fn test_append_read_clear() {
        let dir = tempfile::tempdir().unwrap();
        let pad = JsonlScratchpad::open(dir.path().join("pad.jsonl")).await.unwrap();

        for step in [AuditStep::Start, AuditStep::Retrieval, AuditStep::Completion] {
            pad.append(AuditEntry::new("q", step, format!("{step:?}"))).await.unwrap();
        }

        let all = pad.read(50).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].step, AuditStep::Start);

        let last_two = pad.read(2).await.unwrap();
        assert_eq!(last_two.len(), 2);
        assert_eq!(last_two[0].step, AuditStep::Retrieval);
        assert_eq!(last_two[1].step, AuditStep::Completion);

        pad.clear().await.unwrap();
        assert!(pad.read(50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let dir = tempfile::tempdir().unwrap();
        let pad = JsonlScratchpad::open(dir.path().join("pad.jsonl")).await.unwrap();

        let late = AuditEntry::new("q", AuditStep::Start, "late");
        let mut early = AuditEntry::new("q", AuditStep::Retrieval, "early");
        early.timestamp = late.timestamp - chrono::Duration::seconds(5);

        pad.append(late.clone()).await.unwrap();
        pad.append(early).await.unwrap();

        let entries = pad.read(10).await.unwrap();
        assert_eq!(entries[1].timestamp, late.timestamp);
        assert!(entries.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[tokio::test]
    async fn test_reopen_keeps_history_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pad.jsonl");
        {
            let pad = JsonlScratchpad::open(&path).await.unwrap();
            pad.append(AuditEntry::new("q", AuditStep::Start, "one")).await.unwrap();
        }
        tokio::fs::write(&path, {
            let mut bytes = tokio::fs::read(&path).await.unwrap();
            bytes.extend_from_slice(b"not json\n");
            bytes
        })
        .await
        .unwrap();

        let pad = JsonlScratchpad::open(&path).await.unwrap();
        let entries = pad.read(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].content, "one");
    }
}
