use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, postgres::PgPoolOptions, types::Json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::FileDescriptor;
use crate::workflow::WorkflowState;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_descriptor: Option<FileDescriptor>,
    #[serde(default)]
    pub recovery_count: u32,
}

/// A saved workflow, keyed by `session_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub version: u32,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub session_id: String,
    pub workflow: WorkflowState,
    #[serde(default)]
    pub metadata: SnapshotMetadata,
}

/// Key/value store for workflow snapshots. Policy lives in
/// [`crate::recovery::WorkflowPersistence`]; implementations only store.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    async fn put(&self, snapshot: &PersistedSnapshot) -> StorageResult<()>;
    async fn get(&self, session_id: &str) -> StorageResult<Option<PersistedSnapshot>>;
    async fn delete(&self, session_id: &str) -> StorageResult<()>;
    async fn list(&self) -> StorageResult<Vec<PersistedSnapshot>>;
}

/// In-memory implementation of SnapshotStorage
#[derive(Default, Clone)]
pub struct InMemorySnapshotStorage {
    snapshots: Arc<DashMap<String, PersistedSnapshot>>,
}

impl InMemorySnapshotStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStorage for InMemorySnapshotStorage {
    async fn put(&self, snapshot: &PersistedSnapshot) -> StorageResult<()> {
        self.snapshots
            .insert(snapshot.session_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<PersistedSnapshot>> {
        Ok(self.snapshots.get(session_id).map(|entry| entry.clone()))
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        self.snapshots.remove(session_id);
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<PersistedSnapshot>> {
        Ok(self
            .snapshots
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}

/// One JSON file per session in a directory.
pub struct FileSnapshotStorage {
    dir: PathBuf,
}

impl FileSnapshotStorage {
    pub async fn open(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "Using file snapshot storage");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// ASCII letters, digits and `-` are kept; every other byte becomes `_xx`,
    /// so distinct ids never share a file.
    fn path_for(&self, session_id: &str) -> PathBuf {
        let mut stem = String::with_capacity(session_id.len());
        for byte in session_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                stem.push(byte as char);
            } else {
                stem.push_str(&format!("_{byte:02x}"));
            }
        }
        self.dir.join(format!("{stem}.json"))
    }
}

#[async_trait]
impl SnapshotStorage for FileSnapshotStorage {
    async fn put(&self, snapshot: &PersistedSnapshot) -> StorageResult<()> {
        let path = self.path_for(&snapshot.session_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<PersistedSnapshot>> {
        match tokio::fs::read(self.path_for(session_id)).await {
            Ok(bytes) => {
                let snapshot: PersistedSnapshot = serde_json::from_slice(&bytes)?;
                if snapshot.session_id != session_id {
                    warn!(
                        requested = session_id,
                        found = %snapshot.session_id,
                        "Snapshot file belongs to another session"
                    );
                    return Ok(None);
                }
                Ok(Some(snapshot))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        match tokio::fs::remove_file(self.path_for(session_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self) -> StorageResult<Vec<PersistedSnapshot>> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read(&path)
                .await
                .map_err(StorageError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?));
            match parsed {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %path.display(), "Skipping unreadable snapshot: {}", e),
            }
        }
        Ok(snapshots)
    }
}

/// Snapshots in a Postgres table, one JSONB row per session.
pub struct PostgresSnapshotStorage {
    pool: PgPool,
}

impl PostgresSnapshotStorage {
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_snapshots (
                session_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                saved_at BIGINT NOT NULL,
                snapshot JSONB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        info!("Using Postgres snapshot storage");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SnapshotStorage for PostgresSnapshotStorage {
    async fn put(&self, snapshot: &PersistedSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_snapshots (session_id, version, saved_at, snapshot)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (session_id) DO UPDATE
            SET version = EXCLUDED.version,
                saved_at = EXCLUDED.saved_at,
                snapshot = EXCLUDED.snapshot
            "#,
        )
        .bind(&snapshot.session_id)
        .bind(snapshot.version as i32)
        .bind(snapshot.timestamp)
        .bind(Json(snapshot))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> StorageResult<Option<PersistedSnapshot>> {
        let row = sqlx::query_scalar::<_, Json<PersistedSnapshot>>(
            "SELECT snapshot FROM workflow_snapshots WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(snapshot)| snapshot))
    }

    async fn delete(&self, session_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM workflow_snapshots WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list(&self) -> StorageResult<Vec<PersistedSnapshot>> {
        let rows = sqlx::query_scalar::<_, Json<PersistedSnapshot>>(
            "SELECT snapshot FROM workflow_snapshots ORDER BY saved_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|Json(snapshot)| snapshot).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: &str, timestamp: i64) -> PersistedSnapshot {
        PersistedSnapshot {
            version: 1,
            timestamp,
            session_id: id.to_string(),
            workflow: WorkflowState::new(id),
            metadata: SnapshotMetadata::default(),
        }
    }

    #[tokio::test]
    async fn in_memory_put_get_delete() {
        let storage = InMemorySnapshotStorage::new();
        storage.put(&snapshot("a", 1)).await.unwrap();
        storage.put(&snapshot("a", 2)).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().unwrap().timestamp, 2);
        assert_eq!(storage.list().await.unwrap().len(), 1);
        storage.delete("a").await.unwrap();
        assert!(storage.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_storage_round_trip() {
        let dir = std::env::temp_dir().join(format!("bloodgas-snapshots-{}", uuid::Uuid::new_v4()));
        let storage = FileSnapshotStorage::open(&dir).await.unwrap();

        storage.put(&snapshot("s-1", 10)).await.unwrap();
        storage.put(&snapshot("../escape", 11)).await.unwrap();
        tokio::fs::write(dir.join("junk.json"), b"not json").await.unwrap();

        assert_eq!(storage.get("s-1").await.unwrap(), Some(snapshot("s-1", 10)));
        assert!(storage.get("missing").await.unwrap().is_none());
        assert_eq!(storage.list().await.unwrap().len(), 2);
        assert!(dir.join("_2e_2e_2fescape.json").exists());

        storage.delete("s-1").await.unwrap();
        storage.delete("s-1").await.unwrap();
        assert!(storage.get("s-1").await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn file_names_do_not_collide() {
        let dir = std::env::temp_dir().join(format!("bloodgas-snapshots-{}", uuid::Uuid::new_v4()));
        let storage = FileSnapshotStorage::open(&dir).await.unwrap();

        storage.put(&snapshot("a.b", 1)).await.unwrap();
        storage.put(&snapshot("a_b", 2)).await.unwrap();
        assert_eq!(storage.get("a.b").await.unwrap(), Some(snapshot("a.b", 1)));
        assert_eq!(storage.get("a_b").await.unwrap(), Some(snapshot("a_b", 2)));
        assert_eq!(storage.list().await.unwrap().len(), 2);

        // A file whose content names another session is not returned.
        let stolen = serde_json::to_vec(&snapshot("other", 3)).unwrap();
        tokio::fs::write(storage.path_for("mine"), stolen).await.unwrap();
        assert!(storage.get("mine").await.unwrap().is_none());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn snapshot_wire_format_is_camel_case() {
        let value = serde_json::to_value(snapshot("s", 5)).unwrap();
        assert_eq!(value["sessionId"], "s");
        assert_eq!(value["metadata"]["recoveryCount"], 0);
        assert_eq!(value["workflow"]["currentStep"], "Upload");
    }
}
