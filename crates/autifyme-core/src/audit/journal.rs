//! AuditJournal: JSONL mirror of the audit trail for compliance export.
//!
//! Layout: `<journal_dir>/{YYYY-MM-DD}/audit-{datetime}.jsonl`, one entry per
//! line, bucketed by the entry's UTC day. Files are only ever appended to.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::models::AuditEntry;

#[derive(Clone)]
pub struct AuditJournal {
    base_dir: PathBuf,
    current_file: Arc<Mutex<Option<DayFile>>>,
}

struct DayFile {
    day: String,
    path: PathBuf,
}

impl AuditJournal {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            current_file: Arc::new(Mutex::new(None)),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn append(&self, entry: &AuditEntry) -> Result<(), JournalError> {
        let line = serde_json::to_string(entry)
            .map_err(|e| JournalError::Serialization(e.to_string()))?;

        // hold the lock across the write so lines never interleave
        let mut current = self.current_file.lock().await;
        let day = entry.timestamp.format("%Y-%m-%d").to_string();
        let path = match current.as_ref() {
            Some(f) if f.day == day => f.path.clone(),
            _ => {
                let day_dir = self.base_dir.join(&day);
                fs::create_dir_all(&day_dir)
                    .await
                    .map_err(|e| JournalError::Io(format!("Failed to create journal dir: {}", e)))?;
                let path = day_dir.join(format!(
                    "audit-{}.jsonl",
                    Utc::now().format("%Y%m%d-%H%M%S")
                ));
                *current = Some(DayFile {
                    day,
                    path: path.clone(),
                });
                path
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| JournalError::Io(e.to_string()))?;
        file.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| JournalError::Io(e.to_string()))?;
        file.flush().await.map_err(|e| JournalError::Io(e.to_string()))?;
        Ok(())
    }

    /// Append, logging failures instead of returning them.
    pub async fn append_safe(&self, entry: &AuditEntry) {
        if let Err(e) = self.append(entry).await {
            tracing::warn!("[AuditJournal] Failed to mirror audit entry {}: {}", entry.id, e);
        }
    }

    /// Every entry in the journal, ordered by day directory then file name
    /// then line. Unparseable lines are skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<AuditEntry>, JournalError> {
        let mut entries = Vec::new();
        if !fs::try_exists(&self.base_dir).await.unwrap_or(false) {
            return Ok(entries);
        }

        for day_dir in sorted_children(&self.base_dir).await? {
            if !day_dir.is_dir() {
                continue;
            }
            for file in sorted_children(&day_dir).await? {
                if file.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let content = fs::read_to_string(&file)
                    .await
                    .map_err(|e| JournalError::Io(e.to_string()))?;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<AuditEntry>(line) {
                        Ok(entry) => entries.push(entry),
                        Err(e) => tracing::warn!(
                            "[AuditJournal] Skipping bad line in {}: {}",
                            file.display(),
                            e
                        ),
                    }
                }
            }
        }
        Ok(entries)
    }
}

async fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, JournalError> {
    let mut children = Vec::new();
    let mut rd = fs::read_dir(dir)
        .await
        .map_err(|e| JournalError::Io(e.to_string()))?;
    while let Some(entry) = rd
        .next_entry()
        .await
        .map_err(|e| JournalError::Io(e.to_string()))?
    {
        children.push(entry.path());
    }
    children.sort();
    Ok(children)
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}
