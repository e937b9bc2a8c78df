//! Concurrent session registry.
//!
//! Contexts are indexed by token (authoritative) and by [`SessionId`]
//! (resolved to a token). Single-key operations only take the shared side
//! of a registry-wide gate plus the lock of the entry they touch. The bulk
//! reload pass ([`SessionCache::do_update`]) is the only operation that
//! takes the gate exclusively, so every caller blocked behind it resumes
//! against the same post-reload state.
//!
//! Expiry is two-phase: a lookup that finds a context past its limits marks
//! it stale and fails with [`SessionError::SessionTimeout`]; the next reload
//! pass evicts it, after which lookups fail with
//! [`SessionError::RemovedSession`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ContextState, Session, SessionCallback, SessionContext, SessionId};
use crate::error::SessionError;
use crate::events::{EventBus, RemovalReason, SessionEvent};
use crate::Result;

/// Strategy consulted by the reload pass for every cached context.
///
/// Implementations run while the registry is locked exclusively and must
/// not call back into the [`SessionCache`].
pub trait StaleCacheListener: Send + Sync {
    /// Called once per pass, before the registry is locked.
    fn prepare_reload(&self) {}

    /// Return the refreshed context, or `None` to evict it.
    ///
    /// The returned context keeps the lease counter of `context` no matter
    /// what it carries itself.
    fn reload(&self, context: &SessionContext) -> Option<SessionContext>;
}

/// Lookup key: either the external token or the internal id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKey<'a> {
    Token(&'a str),
    Id(SessionId),
}

impl<'a> From<&'a str> for SessionKey<'a> {
    fn from(token: &'a str) -> Self {
        SessionKey::Token(token)
    }
}

impl<'a> From<&'a String> for SessionKey<'a> {
    fn from(token: &'a String) -> Self {
        SessionKey::Token(token.as_str())
    }
}

impl From<SessionId> for SessionKey<'_> {
    fn from(id: SessionId) -> Self {
        SessionKey::Id(id)
    }
}

impl fmt::Display for SessionKey<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Token(token) => f.write_str(token),
            SessionKey::Id(id) => write!(f, "{}", id),
        }
    }
}

/// Private key/value store attached to one session.
///
/// Created on first use and discarded when the session leaves the registry.
#[derive(Default)]
pub struct SessionData {
    values: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for SessionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionData")
            .field("len", &self.values.len())
            .finish_non_exhaustive()
    }
}

impl SessionData {
    pub fn insert<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Arc::new(value));
    }

    /// Typed lookup; `None` if absent or stored with another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.values.get(key).map(|v| Arc::clone(v.value()))?;
        value.downcast::<T>().ok()
    }

    pub fn remove(&self, key: &str) -> bool {
        self.values.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&self) {
        self.values.clear();
    }
}

/// Outcome of one reload pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    /// Contexts kept, possibly with refreshed data.
    pub replaced: usize,
    /// Contexts evicted because they expired or the listener dropped them.
    pub evicted: usize,
}

impl ReloadSummary {
    /// Whether the pass actually ran.
    pub fn is_noop(&self) -> bool {
        self.replaced == 0 && self.evicted == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Liveness {
    state: ContextState,
    last_access: DateTime<Utc>,
}

struct CacheEntry {
    context: RwLock<SessionContext>,
    liveness: Mutex<Liveness>,
    callbacks: Mutex<Vec<Arc<dyn SessionCallback>>>,
    data: Mutex<Option<Arc<SessionData>>>,
}

impl CacheEntry {
    fn new(context: SessionContext) -> Self {
        Self {
            context: RwLock::new(context),
            liveness: Mutex::new(Liveness {
                state: ContextState::Live,
                last_access: Utc::now(),
            }),
            callbacks: Mutex::new(Vec::new()),
            data: Mutex::new(None),
        }
    }

    fn context(&self) -> Result<SessionContext> {
        self.context
            .read()
            .map(|c| c.clone())
            .map_err(|_| SessionError::LockPoisoned)
    }

    /// Swap in a new context. Returns the id of the one it replaced.
    fn set_context(&self, context: SessionContext) -> Result<SessionId> {
        let mut guard = self
            .context
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        let previous = guard.id();
        *guard = context;
        Ok(previous)
    }

    fn liveness(&self) -> Result<std::sync::MutexGuard<'_, Liveness>> {
        self.liveness.lock().map_err(|_| SessionError::LockPoisoned)
    }

    fn callbacks(&self) -> Vec<Arc<dyn SessionCallback>> {
        self.callbacks
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn take_callbacks(&self) -> Vec<Arc<dyn SessionCallback>> {
        self.callbacks
            .lock()
            .map(|mut c| std::mem::take(&mut *c))
            .unwrap_or_default()
    }

    fn discard_data(&self) {
        if let Ok(mut data) = self.data.lock() {
            if let Some(data) = data.take() {
                data.clear();
            }
        }
    }
}

/// Registry of live session contexts.
pub struct SessionCache {
    gate: RwLock<()>,
    by_token: DashMap<String, Arc<CacheEntry>>,
    by_id: DashMap<SessionId, String>,
    listener: RwLock<Option<Arc<dyn StaleCacheListener>>>,
    needs_update: AtomicBool,
    last_updated: Mutex<DateTime<Utc>>,
    events: EventBus,
}

impl SessionCache {
    /// Create an empty registry publishing on `events`.
    pub fn new(events: EventBus) -> Self {
        Self {
            gate: RwLock::new(()),
            by_token: DashMap::new(),
            by_id: DashMap::new(),
            listener: RwLock::new(None),
            needs_update: AtomicBool::new(false),
            last_updated: Mutex::new(Utc::now()),
            events,
        }
    }

    /// The event channel this registry publishes on.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn shared(&self) -> Result<RwLockReadGuard<'_, ()>> {
        self.gate.read().map_err(|_| SessionError::LockPoisoned)
    }

    fn resolve(&self, key: SessionKey<'_>) -> Result<Arc<CacheEntry>> {
        let token = match key {
            SessionKey::Token(token) => token.to_string(),
            SessionKey::Id(id) => self
                .by_id
                .get(&id)
                .map(|t| t.value().clone())
                .ok_or_else(|| SessionError::RemovedSession(key.to_string()))?,
        };
        self.by_token
            .get(&token)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SessionError::RemovedSession(key.to_string()))
    }

    /// Insert or replace the context registered under `token`.
    ///
    /// Replacing keeps the entry's callbacks and auxiliary data and marks it
    /// live again.
    pub fn put_session(&self, token: &str, context: SessionContext) -> Result<()> {
        if context.token() != token {
            return Err(SessionError::SecurityViolation(format!(
                "context token does not match key {}",
                token
            )));
        }

        let _gate = self.shared()?;
        let id = context.id();

        let previous_id = match self.by_token.entry(token.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = Arc::clone(occupied.get());
                if entry.liveness()?.state.is_terminal() {
                    // Released but not yet unlinked.
                    let previous = entry.context()?.id();
                    occupied.insert(Arc::new(CacheEntry::new(context)));
                    Some(previous)
                } else {
                    let previous = entry.set_context(context)?;
                    let mut live = entry.liveness()?;
                    live.state.transition_to(ContextState::Live);
                    live.last_access = Utc::now();
                    Some(previous)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(CacheEntry::new(context)));
                None
            }
        };

        if let Some(previous) = previous_id.filter(|p| *p != id) {
            self.by_id.remove(&previous);
        }
        self.by_id.insert(id, token.to_string());

        debug!(token, %id, replaced = previous_id.is_some(), "session cached");
        Ok(())
    }

    /// Whether `key` currently resolves to a registered context.
    ///
    /// Stale contexts are still registered.
    pub fn contains<'a>(&self, key: impl Into<SessionKey<'a>>) -> bool {
        match self.shared() {
            Ok(_gate) => self.resolve(key.into()).is_ok(),
            Err(_) => false,
        }
    }

    /// Look up a live context and refresh its access time.
    pub fn get_session_context<'a>(
        &self,
        key: impl Into<SessionKey<'a>>,
    ) -> Result<SessionContext> {
        let _gate = self.shared()?;
        self.access(key.into())
    }

    /// Refresh the access time without returning the context.
    pub fn touch<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<()> {
        let _gate = self.shared()?;
        self.access(key.into()).map(|_| ())
    }

    /// Last access time of a registered context.
    pub fn timestamp<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<DateTime<Utc>> {
        let key = key.into();
        let _gate = self.shared()?;
        let entry = self.resolve(key)?;
        let live = entry.liveness()?;
        if live.state.is_terminal() {
            return Err(SessionError::RemovedSession(key.to_string()));
        }
        Ok(live.last_access)
    }

    /// Registered context without expiry checks or access refresh.
    pub fn peek<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<SessionContext> {
        let _gate = self.shared()?;
        self.resolve(key.into())?.context()
    }

    /// Current value of the context's shared counter.
    pub fn reference_count<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<u64> {
        self.peek(key).map(|ctx| ctx.count().get())
    }

    // Caller holds the shared gate.
    fn access(&self, key: SessionKey<'_>) -> Result<SessionContext> {
        let entry = self.resolve(key)?;
        let context = entry.context()?;
        let mut live = entry.liveness()?;
        self.refresh(&mut live, &context, key)?;
        Ok(context)
    }

    // Caller holds the entry's liveness lock.
    fn refresh(
        &self,
        live: &mut Liveness,
        context: &SessionContext,
        key: SessionKey<'_>,
    ) -> Result<()> {
        let now = Utc::now();
        let state = live.state;
        match state {
            ContextState::Removed => Err(SessionError::RemovedSession(key.to_string())),
            ContextState::Stale => Err(SessionError::SessionTimeout(key.to_string())),
            ContextState::Live => {
                if context.session().is_expired(live.last_access, now) {
                    live.state.transition_to(ContextState::Stale);
                    debug!(token = context.token(), "session marked stale");
                    self.events.publish(SessionEvent::Stale {
                        id: context.id(),
                        token: context.token().to_string(),
                    });
                    return Err(SessionError::SessionTimeout(key.to_string()));
                }
                live.last_access = now;
                Ok(())
            }
        }
    }

    /// Attach another holder to a live session.
    ///
    /// Increments the shared counter and asks every registered callback to
    /// join. Returns the context with the new count. The increment happens
    /// under the same entry lock as [`release`](Self::release), so a join
    /// never lands on a session whose last holder already left.
    pub fn join<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<SessionContext> {
        let (context, callbacks, count) = {
            let _gate = self.shared()?;
            let key = key.into();
            let entry = self.resolve(key)?;
            let context = entry.context()?;
            let mut live = entry.liveness()?;
            self.refresh(&mut live, &context, key)?;
            let count = context.count().increment();
            drop(live);
            (context, entry.callbacks(), count)
        };

        for callback in &callbacks {
            callback.join(context.token());
        }
        info!(token = context.token(), count, "session joined");
        Ok(context)
    }

    /// Release one holder of the session registered under `token`.
    ///
    /// Returns the remaining count, and the removed context once the count
    /// reaches zero. Stale sessions can still be released.
    pub fn release(&self, token: &str) -> Result<(u64, Option<SessionContext>)> {
        let (entry, context) = {
            let _gate = self.shared()?;
            let entry = self.resolve(SessionKey::Token(token))?;
            let context = entry.context()?;
            let mut live = entry.liveness()?;
            if live.state.is_terminal() {
                return Err(SessionError::RemovedSession(token.to_string()));
            }
            let remaining = match context.count().decrement() {
                Ok(remaining) => remaining,
                Err(SessionError::CounterUnderflow) => {
                    warn!(token, "releasing session with no holders");
                    0
                }
                Err(e) => return Err(e),
            };
            if remaining > 0 {
                debug!(token, remaining, "session released");
                return Ok((remaining, None));
            }
            live.state = ContextState::Removed;
            drop(live);
            self.unlink(token, &entry, &context);
            (entry, context)
        };

        self.notify_removed(&entry, &context, RemovalReason::Closed);
        Ok((0, Some(context)))
    }

    /// Copy-on-write replacement of a registered session value.
    ///
    /// The session is located by its token; roles, groups and lease are kept.
    pub fn replace_session(&self, session: Session) -> Result<SessionContext> {
        let _gate = self.shared()?;
        let entry = self.resolve(SessionKey::Token(&session.token))?;
        let mut guard = entry
            .context
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        if guard.id() != session.id {
            return Err(SessionError::SecurityViolation(format!(
                "session id cannot change from {} to {}",
                guard.id(),
                session.id
            )));
        }
        let next = guard.with_session(session);
        *guard = next.clone();
        Ok(next)
    }

    /// Evict a context, discard its data and notify its callbacks.
    ///
    /// Returns the evicted context, or `None` if the token was unknown.
    pub fn remove_session(&self, token: &str) -> Result<Option<SessionContext>> {
        let entry = {
            let _gate = self.shared()?;
            self.detach(token)
        };

        match entry {
            Some(entry) => {
                let context = entry.context()?;
                self.notify_removed(&entry, &context, RemovalReason::Closed);
                Ok(Some(context))
            }
            None => Ok(None),
        }
    }

    // Caller holds the gate (either side).
    fn detach(&self, token: &str) -> Option<Arc<CacheEntry>> {
        let (_, entry) = self.by_token.remove(token)?;
        if let Ok(context) = entry.context() {
            self.by_id.remove_if(&context.id(), |_, t| t == token);
        }
        if let Ok(mut live) = entry.liveness() {
            live.state = ContextState::Removed;
        }
        Some(entry)
    }

    // Only drops the mappings if they still point at `entry`.
    fn unlink(&self, token: &str, entry: &Arc<CacheEntry>, context: &SessionContext) {
        self.by_token.remove_if(token, |_, e| Arc::ptr_eq(e, entry));
        self.by_id.remove_if(&context.id(), |_, t| t == token);
    }

    // Called without holding the gate so callbacks may use the registry.
    fn notify_removed(&self, entry: &CacheEntry, context: &SessionContext, reason: RemovalReason) {
        entry.discard_data();
        for callback in entry.take_callbacks() {
            debug!(token = context.token(), callback = callback.name(), "closing callback");
            callback.close();
        }
        info!(token = context.token(), id = %context.id(), ?reason, "session removed");
        self.events.publish(SessionEvent::Removed {
            id: context.id(),
            token: context.token().to_string(),
            reason,
        });
    }

    /// Register a callback for the session identified by `token`.
    pub fn add_session_callback(
        &self,
        token: &str,
        callback: Arc<dyn SessionCallback>,
    ) -> Result<()> {
        let _gate = self.shared()?;
        let entry = self.resolve(SessionKey::Token(token))?;
        let mut callbacks = entry
            .callbacks
            .lock()
            .map_err(|_| SessionError::LockPoisoned)?;
        callbacks.push(callback);
        Ok(())
    }

    /// Auxiliary data of a session, created on first use.
    pub fn session_data<'a>(&self, key: impl Into<SessionKey<'a>>) -> Result<Arc<SessionData>> {
        let _gate = self.shared()?;
        let entry = self.resolve(key.into())?;
        let mut data = entry.data.lock().map_err(|_| SessionError::LockPoisoned)?;
        Ok(Arc::clone(data.get_or_insert_with(Default::default)))
    }

    /// Whether the auxiliary data of a session has been created.
    pub fn has_session_data<'a>(&self, key: impl Into<SessionKey<'a>>) -> bool {
        let Ok(_gate) = self.shared() else {
            return false;
        };
        self.resolve(key.into())
            .ok()
            .and_then(|entry| entry.data.lock().ok().map(|d| d.is_some()))
            .unwrap_or(false)
    }

    /// Install the reload strategy, replacing any previous one.
    pub fn set_stale_cache_listener(&self, listener: Arc<dyn StaleCacheListener>) -> Result<()> {
        let mut slot = self
            .listener
            .write()
            .map_err(|_| SessionError::LockPoisoned)?;
        *slot = Some(listener);
        Ok(())
    }

    /// Note an event. Identity changes schedule a reload; nothing runs inline.
    pub fn update_event(&self, event: &SessionEvent) {
        if matches!(event, SessionEvent::IdentityChanged) {
            self.needs_update.store(true, Ordering::Release);
            debug!("session cache marked for reload");
        }
    }

    /// Whether an identity change is waiting for a reload pass.
    pub fn needs_update(&self) -> bool {
        self.needs_update.load(Ordering::Acquire)
    }

    /// Time the last reload pass finished.
    pub fn last_updated(&self) -> Result<DateTime<Utc>> {
        self.last_updated
            .lock()
            .map(|t| *t)
            .map_err(|_| SessionError::LockPoisoned)
    }

    fn has_expired_entries(&self) -> Result<bool> {
        let _gate = self.shared()?;
        let now = Utc::now();
        let entries: Vec<Arc<CacheEntry>> =
            self.by_token.iter().map(|e| Arc::clone(e.value())).collect();
        for entry in entries {
            let context = entry.context()?;
            let live = *entry.liveness()?;
            if live.state == ContextState::Stale
                || context.session().is_expired(live.last_access, now)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run the reload pass if one is pending.
    ///
    /// A pass is pending when an identity change was signalled or some
    /// context is past its limits. The listener is prepared first, then the
    /// registry is locked exclusively while every context is reloaded or
    /// evicted. Callbacks and removal events fire after the lock is released.
    pub fn do_update(&self) -> Result<ReloadSummary> {
        let dirty = self.needs_update.swap(false, Ordering::AcqRel);
        if !dirty && !self.has_expired_entries()? {
            return Ok(ReloadSummary::default());
        }

        let listener = self
            .listener
            .read()
            .map_err(|_| SessionError::LockPoisoned)?
            .clone();
        if let Some(listener) = &listener {
            listener.prepare_reload();
        }

        let mut summary = ReloadSummary::default();
        let mut evicted: Vec<(Arc<CacheEntry>, SessionContext, RemovalReason)> = Vec::new();
        {
            let _exclusive = self.gate.write().map_err(|_| SessionError::LockPoisoned)?;
            let now = Utc::now();
            let entries: Vec<(String, Arc<CacheEntry>)> = self
                .by_token
                .iter()
                .map(|e| (e.key().clone(), Arc::clone(e.value())))
                .collect();

            for (token, entry) in entries {
                let current = entry.context()?;
                let reloaded = match &listener {
                    Some(listener) => listener.reload(&current),
                    None => Some(current.clone()),
                };

                let next = match reloaded {
                    Some(next) if next.token() == token => next.inherit_lease(&current),
                    Some(_) => {
                        warn!(token = %token, "reload changed session token, evicting");
                        self.detach(&token);
                        evicted.push((entry, current, RemovalReason::Evicted));
                        continue;
                    }
                    None => {
                        self.detach(&token);
                        evicted.push((entry, current, RemovalReason::Evicted));
                        continue;
                    }
                };

                let last_access = entry.liveness()?.last_access;
                if next.session().is_expired(last_access, now) {
                    self.detach(&token);
                    evicted.push((entry, current, RemovalReason::Expired));
                    continue;
                }

                let next_id = next.id();
                let previous_id = entry.set_context(next)?;
                if previous_id != next_id {
                    self.by_id.remove(&previous_id);
                    self.by_id.insert(next_id, token.clone());
                }
                entry.liveness()?.state.transition_to(ContextState::Live);
                summary.replaced += 1;
            }

            if let Ok(mut last) = self.last_updated.lock() {
                *last = now;
            }
        }

        summary.evicted = evicted.len();
        for (entry, context, reason) in &evicted {
            self.notify_removed(entry, context, *reason);
        }

        info!(
            replaced = summary.replaced,
            evicted = summary.evicted,
            "session cache reloaded"
        );
        Ok(summary)
    }

    /// Number of registered contexts, stale ones included.
    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_token.is_empty()
    }

    /// Tokens of every registered context.
    pub fn tokens(&self) -> Vec<String> {
        self.by_token.iter().map(|e| e.key().clone()).collect()
    }

    /// Ids of every registered context.
    pub fn ids(&self) -> Vec<SessionId> {
        self.by_id.iter().map(|e| *e.key()).collect()
    }

    /// Run [`do_update`](Self::do_update) every `period` on the blocking pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || cache.do_update()).await {
                    Ok(Ok(summary)) if !summary.is_noop() => {
                        debug!(?summary, "periodic sweep finished")
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "periodic sweep failed"),
                    Err(e) => warn!(error = %e, "periodic sweep panicked"),
                }
            }
        })
    }

    /// Forward identity-change notifications from the event channel to
    /// [`update_event`](Self::update_event).
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.events.subscribe();
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = rx.recv().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => cache.update_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        // Missed events may include identity changes.
                        warn!(missed, "session event watcher lagged");
                        cache.update_event(&SessionEvent::IdentityChanged);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}
