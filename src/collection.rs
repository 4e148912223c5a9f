//! `chessmate collection` — orchestrates vector-store snapshots.
//!
//! Every successful snapshot/restore is appended as one JSON line to a
//! local log file so operators have a durable record independent of
//! whatever the vector store itself retains.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::vector_store::VectorStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub name: String,
    pub location: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub size_bytes: Option<u64>,
    pub note: Option<String>,
}

pub async fn snapshot(
    vectors: &dyn VectorStore,
    log_path: &Path,
    note: Option<String>,
) -> Result<SnapshotRecord, AppError> {
    let location = vectors.snapshot().await?;
    let name = location
        .rsplit('/')
        .next()
        .unwrap_or(&location)
        .to_string();
    let record = SnapshotRecord {
        name,
        location,
        created_at: chrono::Utc::now(),
        size_bytes: None,
        note,
    };
    append_record(log_path, &record)?;
    Ok(record)
}

pub async fn restore(vectors: &dyn VectorStore, snapshot_name: &str) -> Result<(), AppError> {
    vectors.restore(snapshot_name).await
}

pub async fn list(vectors: &dyn VectorStore) -> Result<Vec<String>, AppError> {
    vectors.list_snapshots().await
}

/// Reads the local snapshot log back, most recent first. Used by
/// `collection list` to enrich the vector store's own listing with notes
/// that the store itself doesn't retain.
pub fn read_log(log_path: &Path) -> Result<Vec<SnapshotRecord>, AppError> {
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(log_path)
        .map_err(|e| AppError::Fatal(format!("cannot read {}: {e}", log_path.display())))?;
    let mut records: Vec<SnapshotRecord> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    records.reverse();
    Ok(records)
}

fn append_record(log_path: &Path, record: &SnapshotRecord) -> Result<(), AppError> {
    let line = serde_json::to_string(record)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| AppError::Fatal(format!("cannot open {}: {e}", log_path.display())))?;
    writeln!(file, "{line}").map_err(|e| AppError::Fatal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::models::{QueryPlan, VectorHit};
    use crate::vector_store::VectorPoint;

    struct FakeVectors;
    #[async_trait]
    impl VectorStore for FakeVectors {
        async fn search(&self, _plan: &QueryPlan, _limit: i64) -> Result<Vec<VectorHit>, AppError> {
            Ok(Vec::new())
        }
        async fn upsert_points(&self, _points: Vec<VectorPoint>) -> Result<(), AppError> {
            Ok(())
        }
        async fn health(&self) -> Result<(), AppError> {
            Ok(())
        }
        async fn snapshot(&self) -> Result<String, AppError> {
            Ok("snapshots/2026-01-01-abcd".to_string())
        }
        async fn restore(&self, _snapshot_name: &str) -> Result<(), AppError> {
            Ok(())
        }
        async fn list_snapshots(&self) -> Result<Vec<String>, AppError> {
            Ok(vec!["2026-01-01-abcd".to_string()])
        }
    }

    #[tokio::test]
    async fn snapshot_appends_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("snapshots.jsonl");
        let record = snapshot(&FakeVectors, &log_path, Some("before bulk import".to_string()))
            .await
            .unwrap();
        assert_eq!(record.name, "2026-01-01-abcd");

        let records = read_log(&log_path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].note.as_deref(), Some("before bulk import"));
    }

    #[test]
    fn read_log_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("missing.jsonl");
        assert!(read_log(&log_path).unwrap().is_empty());
    }
}
