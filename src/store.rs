//! Event persistence.
//!
//! Stores each received payload as pretty JSON under
//! `<data_dir>/<yyyyMMdd>/<code>/<_id>.json`. Inserting an `_id` that is
//! already on disk is a silent no-op.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::event::Event;

/// Format of the feed's `time` field, e.g. `2025/10/20 23:47:39.183`.
const TIME_FORMAT: &str = "%Y/%m/%d %H:%M:%S%.f";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid event time {0:?}")]
    InvalidTime(String),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Idempotent insert keyed by the event `_id`.
    async fn insert(&self, event: &Event) -> Result<(), StoreError>;
}

/// Used when persistence is disabled.
pub struct NullStore;

#[async_trait]
impl EventStore for NullStore {
    async fn insert(&self, _event: &Event) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct JsonFileStore {
    data_dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn event_path(&self, event: &Event) -> Result<PathBuf, StoreError> {
        let time = NaiveDateTime::parse_from_str(&event.time, TIME_FORMAT)
            .map_err(|_| StoreError::InvalidTime(event.time.clone()))?;

        Ok(self
            .data_dir
            .join(time.format("%Y%m%d").to_string())
            .join(event.code.to_string())
            .join(format!("{}.json", sanitize_id(&event.id))))
    }
}

/// Ids are opaque; keep them from escaping the code directory.
fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}

#[async_trait]
impl EventStore for JsonFileStore {
    async fn insert(&self, event: &Event) -> Result<(), StoreError> {
        let path = self.event_path(event)?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let json = serde_json::to_string_pretty(&event.raw)?;
        match write_new(&path, json.as_bytes()).await {
            Ok(()) => {
                debug!("Saved: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Already stored: {}", event.id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_new(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("eqmon-store-{}-{name}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn event(id: &str, time: &str) -> Event {
        Event::parse(&format!(
            r#"{{"_id":"{id}","code":551,"time":"{time}","points":[{{"pref":"石川県","scale":30}}]}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_writes_raw_payload() {
        let dir = data_dir("insert");
        let store = JsonFileStore::new(&dir);
        let event = event("abc123", "2025/10/20 23:47:39.183");

        store.insert(&event).await.unwrap();

        let path = dir.join("20251020").join("551").join("abc123.json");
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, event.raw);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_duplicate_insert_is_ignored() {
        let dir = data_dir("dup");
        let store = JsonFileStore::new(&dir);
        let first = event("same", "2025/10/20 23:47:39.183");
        store.insert(&first).await.unwrap();

        // Same id, different content: first write wins, no error
        let second = event("same", "2025/10/20 23:59:00.000");
        store.insert(&second).await.unwrap();

        let path = dir.join("20251020").join("551").join("same.json");
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved, first.raw);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_invalid_time_is_rejected() {
        let dir = data_dir("time");
        let store = JsonFileStore::new(&dir);
        let err = store.insert(&event("x", "yesterday")).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTime(_)));
        assert!(!dir.exists());
    }

    #[test]
    fn test_id_cannot_escape() {
        let store = JsonFileStore::new("data");
        let path = store
            .event_path(&event("../../etc", "2025/10/20 23:47:39.183"))
            .unwrap();
        assert_eq!(path, PathBuf::from("data/20251020/551/.._.._etc.json"));
    }
}
