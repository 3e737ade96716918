use bloodgas_flow::{FileDescriptor, WorkflowMachine};
use dashmap::{DashMap, mapref::entry::Entry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How long a completed or failed session stays readable.
pub const FINISHED_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

/// A live session: its state machine and what was uploaded.
#[derive(Clone)]
pub struct SessionHandle {
    pub machine: WorkflowMachine,
    pub descriptor: Option<FileDescriptor>,
}

/// Live sessions of this process plus the cancellation token of each
/// in-flight run. At most one run per session at a time.
///
/// Sessions whose last run ended in `Completed` or `Error` are dropped once
/// they have been idle for the finished-session TTL.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, SessionHandle>>,
    running: Arc<DashMap<String, CancellationToken>>,
    finished: Arc<DashMap<String, Instant>>,
    finished_ttl: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            running: Arc::new(DashMap::new()),
            finished: Arc::new(DashMap::new()),
            finished_ttl: FINISHED_SESSION_TTL,
        }
    }

    pub fn with_finished_ttl(mut self, ttl: Duration) -> Self {
        self.finished_ttl = ttl;
        self
    }

    pub fn insert(&self, handle: SessionHandle) -> String {
        self.prune();
        let session_id = handle.machine.session_id();
        self.finished.remove(&session_id);
        self.sessions.insert(session_id.clone(), handle);
        session_id
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, session_id: &str) {
        self.cancel(session_id);
        self.sessions.remove(session_id);
        self.finished.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Claim the session for a new run. `None` when a run is already active.
    pub fn begin_run(&self, session_id: &str) -> Option<CancellationToken> {
        match self.running.entry(session_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let token = CancellationToken::new();
                slot.insert(token.clone());
                self.finished.remove(session_id);
                Some(token)
            }
        }
    }

    /// Release the run claim. A session left completed or failed starts its
    /// expiry clock.
    pub fn end_run(&self, session_id: &str) {
        self.running.remove(session_id);
        let finished = self
            .sessions
            .get(session_id)
            .is_some_and(|handle| !handle.machine.snapshot().is_recoverable());
        if finished {
            self.finished.insert(session_id.to_string(), Instant::now());
        }
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.running.contains_key(session_id)
    }

    /// Signal the active run, if any. Returns whether there was one.
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.running.get(session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop finished sessions idle for longer than the TTL. Returns how many
    /// were removed.
    pub fn prune(&self) -> usize {
        let expired: Vec<String> = self
            .finished
            .iter()
            .filter(|entry| entry.value().elapsed() > self.finished_ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for session_id in expired {
            if self.is_running(&session_id) {
                continue;
            }
            self.finished.remove(&session_id);
            if self.sessions.remove(&session_id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "Dropped finished sessions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloodgas_flow::{CanonicalProgress, ProcessingStatus};

    fn handle() -> SessionHandle {
        SessionHandle {
            machine: WorkflowMachine::new(CanonicalProgress::default()),
            descriptor: None,
        }
    }

    #[test]
    fn one_run_per_session() {
        let registry = SessionRegistry::new();
        let session_id = registry.insert(handle());

        let token = registry.begin_run(&session_id).unwrap();
        assert!(registry.begin_run(&session_id).is_none());
        assert!(registry.is_running(&session_id));

        assert!(registry.cancel(&session_id));
        assert!(token.is_cancelled());

        registry.end_run(&session_id);
        assert!(!registry.cancel(&session_id));
        assert!(registry.begin_run(&session_id).is_some());
    }

    #[test]
    fn finished_sessions_expire_and_live_ones_stay() {
        let registry = SessionRegistry::new().with_finished_ttl(Duration::ZERO);

        let failed = handle();
        let failed_id = registry.insert(failed.clone());
        registry.begin_run(&failed_id).unwrap();
        failed.machine.fail("Analysis was cancelled.");
        registry.end_run(&failed_id);

        let paused = handle();
        let paused_id = registry.insert(paused.clone());
        registry.begin_run(&paused_id).unwrap();
        paused.machine.set_status(ProcessingStatus::Interpreting);
        registry.end_run(&paused_id);

        let running_id = registry.insert(handle());
        registry.begin_run(&running_id).unwrap();

        std::thread::sleep(Duration::from_millis(2));
        registry.prune();
        assert!(registry.get(&failed_id).is_none());
        assert!(registry.get(&paused_id).is_some());
        assert!(registry.get(&running_id).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn a_new_run_stops_the_expiry_clock() {
        let registry = SessionRegistry::new().with_finished_ttl(Duration::ZERO);
        let failed = handle();
        let session_id = registry.insert(failed.clone());
        registry.begin_run(&session_id).unwrap();
        failed.machine.fail("boom");
        registry.end_run(&session_id);

        registry.begin_run(&session_id).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.prune(), 0);
        assert!(registry.get(&session_id).is_some());
    }
}
