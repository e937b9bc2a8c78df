//! Durable session storage and the executor that writes to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tokio::runtime::Handle;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::{Session, SessionId};
use crate::Result;

/// Durable home of session records.
///
/// Calls run on tokio's blocking pool, so implementations may block.
pub trait SessionStore: Send + Sync {
    /// Insert or overwrite the record with `session.id`.
    fn save(&self, session: &Session) -> Result<()>;

    /// Read back a record.
    fn load(&self, id: SessionId) -> Result<Option<Session>>;
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of stored records.
    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl SessionStore for MemoryStore {
    fn save(&self, session: &Session) -> Result<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn load(&self, id: SessionId) -> Result<Option<Session>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| SessionError::LockPoisoned)?;
        Ok(sessions.get(&id).cloned())
    }
}

/// Runs store writes in the background so callers never wait on storage.
///
/// Failures are logged and do not roll back the in-memory registry.
pub struct PersistenceExecutor {
    store: Arc<dyn SessionStore>,
    handle: Handle,
    tasks: Mutex<JoinSet<()>>,
}

impl PersistenceExecutor {
    /// Create an executor spawning onto `handle`.
    pub fn new(store: Arc<dyn SessionStore>, handle: Handle) -> Self {
        Self {
            store,
            handle,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Create an executor on the current tokio runtime.
    pub fn current(store: Arc<dyn SessionStore>) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| SessionError::Runtime(e.to_string()))?;
        Ok(Self::new(store, handle))
    }

    /// The store written to.
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Run `work` on the blocking pool, logging its failure.
    pub fn submit<F>(&self, label: &'static str, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().map_err(|_| SessionError::LockPoisoned)?;
        // Reap finished work so the set does not grow without bound.
        while let Some(done) = tasks.try_join_next() {
            if let Err(e) = done {
                warn!(error = %e, "persistence task panicked");
            }
        }
        tasks.spawn_blocking_on(
            move || match work() {
                Ok(()) => debug!(op = label, "persisted"),
                Err(e) => warn!(op = label, error = %e, "persistence failed"),
            },
            &self.handle,
        );
        Ok(())
    }

    /// Persist a copy of `session` in the background.
    pub fn save(&self, label: &'static str, session: Session) -> Result<()> {
        let store = Arc::clone(&self.store);
        self.submit(label, move || store.save(&session))
    }

    /// Number of tasks submitted and not yet reaped.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    /// Wait for every submitted task to finish.
    pub async fn drain(&self) -> Result<()> {
        let mut tasks = {
            let mut guard = self.tasks.lock().map_err(|_| SessionError::LockPoisoned)?;
            std::mem::take(&mut *guard)
        };
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "persistence task panicked");
            }
        }
        Ok(())
    }
}
