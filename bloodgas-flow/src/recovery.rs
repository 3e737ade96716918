//! Snapshot policy on top of a [`SnapshotStorage`]: versioning, retention,
//! max-count eviction and debounced auto-saving.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::error::Result;
use crate::model::FileDescriptor;
use crate::storage::{PersistedSnapshot, SnapshotMetadata, SnapshotStorage};
use crate::workflow::{ProcessingStatus, WorkflowState, WorkflowStep};

type KeyLocks = DashMap<String, Arc<Mutex<()>>>;

/// Exclusive access to one session's snapshot. The lock entry is dropped from
/// the map once nobody else holds or waits on it.
struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct WorkflowPersistence {
    storage: Arc<dyn SnapshotStorage>,
    config: PersistenceConfig,
    key_locks: KeyLocks,
    /// Session id to the millisecond it was closed.
    tombstones: DashMap<String, i64>,
    last_timestamp: AtomicI64,
}

impl WorkflowPersistence {
    pub fn new(storage: Arc<dyn SnapshotStorage>, config: PersistenceConfig) -> Self {
        Self {
            storage,
            config,
            key_locks: DashMap::new(),
            tombstones: DashMap::new(),
            last_timestamp: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    async fn lock(&self, session_id: &str) -> KeyGuard<'_> {
        let lock = self
            .key_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            locks: &self.key_locks,
            session_id: session_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Wall-clock milliseconds, strictly increasing within this process.
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    /// Persist `state`. Returns whether a snapshot was written.
    ///
    /// Idle and completed sessions are skipped, as is any session already
    /// finished or discarded. A `None` descriptor keeps the stored one.
    pub async fn save(
        &self,
        state: &WorkflowState,
        descriptor: Option<FileDescriptor>,
    ) -> Result<bool> {
        if matches!(
            state.processing_status,
            ProcessingStatus::Idle | ProcessingStatus::Completed
        ) || state.current_step == WorkflowStep::Completed
        {
            return Ok(false);
        }

        {
            let _guard = self.lock(&state.session_id).await;
            if self.is_closed(&state.session_id) {
                debug!(session_id = %state.session_id, "Skipping save for finished session");
                return Ok(false);
            }

            let previous = self.storage.get(&state.session_id).await?;
            if let Some(stored) = previous
                .as_ref()
                .filter(|p| p.workflow.revision > state.revision)
            {
                debug!(
                    session_id = %state.session_id,
                    stored = stored.workflow.revision,
                    offered = state.revision,
                    "Skipping save of an older workflow revision"
                );
                return Ok(false);
            }
            let metadata = SnapshotMetadata {
                file_descriptor: descriptor.or_else(|| {
                    previous
                        .as_ref()
                        .and_then(|p| p.metadata.file_descriptor.clone())
                }),
                recovery_count: previous.map(|p| p.metadata.recovery_count).unwrap_or(0),
            };
            let snapshot = PersistedSnapshot {
                version: self.config.schema_version,
                timestamp: self.next_timestamp(),
                session_id: state.session_id.clone(),
                workflow: state.clone(),
                metadata,
            };
            self.storage.put(&snapshot).await?;
            debug!(
                session_id = %state.session_id,
                step = ?state.current_step,
                progress = state.progress,
                "Workflow snapshot saved"
            );
        }

        self.evict().await?;
        Ok(true)
    }

    /// Fetch a snapshot for resumption and bump its recovery count.
    ///
    /// A snapshot written under another schema version is deleted and
    /// reported as absent.
    pub async fn load(&self, session_id: &str) -> Result<Option<PersistedSnapshot>> {
        let _guard = self.lock(session_id).await;
        let Some(mut snapshot) = self.storage.get(session_id).await? else {
            return Ok(None);
        };

        if snapshot.version != self.config.schema_version {
            warn!(
                session_id,
                found = snapshot.version,
                expected = self.config.schema_version,
                "Discarding snapshot with incompatible version"
            );
            self.storage.delete(session_id).await?;
            return Ok(None);
        }

        snapshot.metadata.recovery_count += 1;
        self.storage.put(&snapshot).await?;
        info!(
            session_id,
            recovery_count = snapshot.metadata.recovery_count,
            "Workflow snapshot loaded for recovery"
        );
        Ok(Some(snapshot))
    }

    /// Resumable sessions, newest first.
    pub async fn list_recoverable(&self) -> Result<Vec<PersistedSnapshot>> {
        let mut snapshots: Vec<_> = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|s| s.version == self.config.schema_version && s.workflow.is_recoverable())
            .collect();
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(snapshots)
    }

    /// Drop snapshots past the retention window, then the oldest beyond the
    /// max count. Returns how many were removed.
    pub async fn evict(&self) -> Result<usize> {
        let cutoff = chrono::Utc::now().timestamp_millis() - self.config.retention.as_millis() as i64;
        let mut snapshots = self.storage.list().await?;
        snapshots.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let doomed: Vec<(String, i64)> = snapshots
            .iter()
            .enumerate()
            .filter(|(rank, s)| s.timestamp < cutoff || *rank >= self.config.max_snapshots)
            .map(|(_, s)| (s.session_id.clone(), s.timestamp))
            .collect();

        let mut removed = 0;
        for (session_id, timestamp) in doomed {
            let _guard = self.lock(&session_id).await;
            // A save may have refreshed it since the listing.
            match self.storage.get(&session_id).await? {
                Some(current) if current.timestamp == timestamp => {
                    self.storage.delete(&session_id).await?;
                    removed += 1;
                }
                _ => continue,
            }
        }
        if removed > 0 {
            info!(removed, "Evicted workflow snapshots");
        }
        self.prune_tombstones();
        Ok(removed)
    }

    /// Delete a session's snapshot and refuse saves for it until the
    /// tombstone expires.
    pub async fn discard(&self, session_id: &str) -> Result<()> {
        self.prune_tombstones();
        let _guard = self.lock(session_id).await;
        self.tombstones
            .insert(session_id.to_string(), chrono::Utc::now().timestamp_millis());
        self.storage.delete(session_id).await?;
        debug!(session_id, "Workflow snapshot discarded");
        Ok(())
    }

    /// True once the session was finished or discarded, until the tombstone
    /// expires.
    pub fn is_closed(&self, session_id: &str) -> bool {
        self.tombstones
            .get(session_id)
            .is_some_and(|closed_at| !self.tombstone_expired(*closed_at))
    }

    fn tombstone_expired(&self, closed_at: i64) -> bool {
        chrono::Utc::now().timestamp_millis() - closed_at > self.config.tombstone_ttl.as_millis() as i64
    }

    fn prune_tombstones(&self) {
        self.tombstones
            .retain(|_, closed_at| !self.tombstone_expired(*closed_at));
    }
}

/// Saves a machine's state after it has been quiet for the configured
/// debounce period. The pending state is flushed when the machine is dropped.
pub struct AutoSaver {
    handle: JoinHandle<()>,
}

impl AutoSaver {
    pub fn spawn(
        persistence: Arc<WorkflowPersistence>,
        mut updates: watch::Receiver<WorkflowState>,
        descriptor: Option<FileDescriptor>,
    ) -> Self {
        let debounce = persistence.config().debounce;
        let handle = tokio::spawn(async move {
            loop {
                if updates.changed().await.is_err() {
                    break;
                }
                let mut closed = false;
                loop {
                    tokio::select! {
                        changed = updates.changed() => {
                            if changed.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }

                let state = updates.borrow_and_update().clone();
                if let Err(e) = persistence.save(&state, descriptor.clone()).await {
                    warn!(session_id = %state.session_id, "Auto-save failed: {}", e);
                }
                if closed {
                    break;
                }
            }
        });
        Self { handle }
    }

    /// Wait until the machine is dropped and the last save has run.
    pub async fn join(self) {
        let _ = self.handle.await;
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}
