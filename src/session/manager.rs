//! Session lifecycle on top of the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::id::new_token;
use super::{
    Principal, Session, SessionCache, SessionContext, SessionId, StaleCacheListener,
};
use crate::error::SessionError;
use crate::identity::{IdentityService, Memberships};
use crate::store::PersistenceExecutor;
use crate::Result;

/// Limits and defaults applied to new and updated sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub default_time_to_idle: Duration,
    pub default_time_to_live: Duration,
    /// Upper bound for `time_to_idle`; larger requests are clamped.
    pub max_time_to_idle: Duration,
    /// Upper bound for `time_to_live`; larger requests are clamped.
    pub max_time_to_live: Duration,
    /// Event type used when neither the principal nor identity names one.
    pub default_event_type: String,
    /// Period of the background reload pass.
    pub sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_time_to_idle: Duration::from_secs(600),
            default_time_to_live: Duration::from_secs(3600),
            max_time_to_idle: Duration::from_secs(3600),
            max_time_to_live: Duration::from_secs(86_400),
            default_event_type: "User".to_string(),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Creates, joins, updates and closes sessions.
///
/// Liveness is decided by the [`SessionCache`]; durable writes go through
/// the [`PersistenceExecutor`] and never block the caller.
pub struct SessionManager {
    config: SessionConfig,
    cache: Arc<SessionCache>,
    identity: Arc<dyn IdentityService>,
    executor: PersistenceExecutor,
}

impl SessionManager {
    /// Create a manager and install an [`IdentityReloader`] on `cache`.
    pub fn new(
        config: SessionConfig,
        cache: Arc<SessionCache>,
        identity: Arc<dyn IdentityService>,
        executor: PersistenceExecutor,
    ) -> Result<Self> {
        cache.set_stale_cache_listener(Arc::new(IdentityReloader::new(Arc::clone(&identity))))?;
        Ok(Self {
            config,
            cache,
            identity,
            executor,
        })
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn executor(&self) -> &PersistenceExecutor {
        &self.executor
    }

    /// [`create_with_agent`](Self::create_with_agent) without agent or address.
    pub fn create(&self, principal: &Principal, credentials: &str) -> Result<Session> {
        self.create_with_agent(principal, credentials, None, None)
    }

    /// Authenticate and either join the principal's live session or start
    /// a new one.
    ///
    /// A principal carrying the token of a registered session joins it and
    /// gets the existing session back. Otherwise a new session is created
    /// with a counter of one, keyed by the principal's token if it has one.
    pub fn create_with_agent(
        &self,
        principal: &Principal,
        credentials: &str,
        agent: Option<&str>,
        remote_ip: Option<&str>,
    ) -> Result<Session> {
        if principal.name.trim().is_empty() {
            return Err(SessionError::Authentication(
                "principal name is empty".to_string(),
            ));
        }
        if !self.identity.check_credentials(principal, credentials) {
            return Err(SessionError::Authentication(format!(
                "bad credentials for {}",
                principal.name
            )));
        }

        if let Some(token) = principal.token.as_deref() {
            match self.join(principal, token) {
                // Closed or swept since the client last saw it.
                Err(SessionError::RemovedSession(_)) => {}
                joined => return joined,
            }
        }

        let memberships = self.identity.memberships(&principal.name).ok_or_else(|| {
            SessionError::Authentication(format!("unknown user {}", principal.name))
        })?;

        let group = principal
            .group
            .clone()
            .or_else(|| self.identity.resolve_default_group(principal))
            .ok_or_else(|| {
                SessionError::Authentication(format!("no group for {}", principal.name))
            })?;
        if !memberships.member_of.contains(&group) {
            return Err(SessionError::Authentication(format!(
                "{} is not a member of {}",
                principal.name, group
            )));
        }

        let default_event_type = principal
            .event_type
            .clone()
            .or_else(|| self.identity.resolve_default_event_type(principal))
            .unwrap_or_else(|| self.config.default_event_type.clone());
        let roles = self.identity.resolve_roles(principal);
        let token = principal.token.clone().unwrap_or_else(new_token);

        let session = Session {
            id: SessionId::new(),
            token: token.clone(),
            owner: principal.name.clone(),
            group,
            default_event_type,
            started: Utc::now(),
            closed: None,
            time_to_idle: self.config.default_time_to_idle,
            time_to_live: self.config.default_time_to_live,
            user_agent: agent.map(str::to_string),
            user_ip: remote_ip.map(str::to_string),
            message: None,
        };

        let context = SessionContext::new(
            session.clone(),
            roles,
            memberships.member_of,
            memberships.leader_of,
        );
        context.count().increment();
        self.cache.put_session(&token, context)?;
        self.executor.save("create", session.clone())?;

        info!(
            token = %session.token,
            id = %session.id,
            owner = %session.owner,
            group = %session.group,
            "session created"
        );
        Ok(session)
    }

    fn join(&self, principal: &Principal, token: &str) -> Result<Session> {
        let existing = self.cache.peek(token)?;
        if existing.session().owner != principal.name {
            return Err(SessionError::Authentication(format!(
                "session {} belongs to another user",
                token
            )));
        }
        let context = self.cache.join(token)?;
        Ok(context.session().clone())
    }

    /// Apply the mutable subset of `session` to the registered session.
    ///
    /// Only group, user agent, message, default event type, time to idle
    /// and time to live are taken from the input; every other field keeps
    /// its registered value. Zero durations are rejected, durations above
    /// the configured maxima are clamped.
    pub fn update(&self, session: &Session) -> Result<Session> {
        let current = self.cache.get_session_context(session.token.as_str())?;
        let registered = current.session();

        let time_to_idle = self.bounded(
            "time_to_idle",
            session.time_to_idle,
            self.config.max_time_to_idle,
        )?;
        let time_to_live = self.bounded(
            "time_to_live",
            session.time_to_live,
            self.config.max_time_to_live,
        )?;

        if session.group != registered.group && !current.is_member_of(&session.group) {
            return Err(SessionError::SecurityViolation(format!(
                "{} is not a member of {}",
                registered.owner, session.group
            )));
        }
        if session.default_event_type.trim().is_empty() {
            return Err(SessionError::SecurityViolation(
                "default event type cannot be empty".to_string(),
            ));
        }

        let next = Session {
            group: session.group.clone(),
            user_agent: session.user_agent.clone(),
            message: session.message.clone(),
            default_event_type: session.default_event_type.clone(),
            time_to_idle,
            time_to_live,
            ..registered.clone()
        };
        if next == *registered {
            return Ok(next);
        }

        let updated = self.cache.replace_session(next)?;
        self.executor.save("update", updated.session().clone())?;
        debug!(token = %updated.token(), "session updated");
        Ok(updated.session().clone())
    }

    fn bounded(&self, field: &str, requested: Duration, max: Duration) -> Result<Duration> {
        if requested.is_zero() {
            return Err(SessionError::SecurityViolation(format!(
                "{} cannot be zero",
                field
            )));
        }
        if requested > max {
            debug!(field, ?requested, ?max, "clamping session duration");
            return Ok(max);
        }
        Ok(requested)
    }

    /// Release one holder of the session.
    ///
    /// Returns the remaining count. When it reaches zero the session is
    /// stamped closed, persisted in the background and removed.
    pub fn close(&self, token: &str) -> Result<u64> {
        let (remaining, removed) = self.cache.release(token)?;
        let Some(context) = removed else {
            return Ok(remaining);
        };

        let mut closed = context.session().clone();
        closed.closed = Some(Utc::now());
        self.executor.save("close", closed)?;
        info!(token, "session closed");
        Ok(0)
    }

    /// Look up a live session context.
    pub fn find(&self, token: &str) -> Result<SessionContext> {
        self.cache.get_session_context(token)
    }

    /// Value copy for local mutation before [`update`](Self::update).
    pub fn copy(&self, session: &Session) -> Session {
        session.clone()
    }

    /// Number of holders of a registered session.
    pub fn reference_count(&self, token: &str) -> Result<u64> {
        self.cache.reference_count(token)
    }
}

/// Reload strategy that re-reads roles and groups from the identity service.
///
/// Contexts whose owner no longer exists, or who lost membership of the
/// session's group, are evicted. Each owner is looked up once per pass.
pub struct IdentityReloader {
    identity: Arc<dyn IdentityService>,
    snapshot: Mutex<HashMap<String, Option<Memberships>>>,
}

impl IdentityReloader {
    pub fn new(identity: Arc<dyn IdentityService>) -> Self {
        Self {
            identity,
            snapshot: Mutex::new(HashMap::new()),
        }
    }

    fn memberships(&self, owner: &str) -> Option<Memberships> {
        let Ok(mut snapshot) = self.snapshot.lock() else {
            return self.identity.memberships(owner);
        };
        snapshot
            .entry(owner.to_string())
            .or_insert_with(|| self.identity.memberships(owner))
            .clone()
    }
}

impl StaleCacheListener for IdentityReloader {
    fn prepare_reload(&self) {
        if let Ok(mut snapshot) = self.snapshot.lock() {
            snapshot.clear();
        }
        debug!("identity snapshot reset for reload");
    }

    fn reload(&self, context: &SessionContext) -> Option<SessionContext> {
        let session = context.session();
        let memberships = self.memberships(&session.owner)?;
        if !memberships.member_of.contains(&session.group) {
            debug!(token = %session.token, group = %session.group, "owner left session group");
            return None;
        }
        Some(context.with_identity(
            memberships.roles,
            memberships.member_of,
            memberships.leader_of,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{InMemoryIdentity, UserAccount};
    use crate::store::{MemoryStore, SessionStore};

    struct Fixture {
        manager: SessionManager,
        identity: Arc<InMemoryIdentity>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let identity = Arc::new(InMemoryIdentity::from_accounts([
            UserAccount::new("alice", "secret")
                .with_groups(["users", "lab"])
                .with_roles(["user"]),
            UserAccount::new("bob", "hunter2").with_groups(["users"]),
        ]));
        let store = Arc::new(MemoryStore::new());
        let executor = PersistenceExecutor::current(store.clone()).unwrap();
        let manager = SessionManager::new(
            SessionConfig::default(),
            Arc::new(SessionCache::default()),
            identity.clone(),
            executor,
        )
        .unwrap();
        Fixture {
            manager,
            identity,
            store,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_session() {
        let f = fixture();
        let session = f
            .manager
            .create_with_agent(&Principal::new("alice"), "secret", Some("cli"), Some("10.0.0.1"))
            .unwrap();

        assert_eq!(session.owner, "alice");
        assert_eq!(session.group, "users");
        assert_eq!(session.default_event_type, "User");
        assert_eq!(session.user_agent.as_deref(), Some("cli"));
        assert_eq!(session.user_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(f.manager.reference_count(&session.token).unwrap(), 1);

        let ctx = f.manager.find(&session.token).unwrap();
        assert!(ctx.has_role("user"));
        assert!(ctx.is_member_of("lab"));

        f.manager.executor().drain().await.unwrap();
        assert_eq!(f.store.load(session.id).unwrap(), Some(session));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_authentication_failures() {
        let f = fixture();
        let err = f.manager.create(&Principal::new("alice"), "wrong").unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));

        let err = f.manager.create(&Principal::new(""), "secret").unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));

        let err = f
            .manager
            .create(&Principal::new("bob").with_group("lab"), "hunter2")
            .unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert!(f.manager.cache().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_explicit_group_and_event_type() {
        let f = fixture();
        let principal = Principal::new("alice")
            .with_group("lab")
            .with_event_type("Test");
        let session = f.manager.create(&principal, "secret").unwrap();
        assert_eq!(session.group, "lab");
        assert_eq!(session.default_event_type, "Test");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_and_close() {
        let f = fixture();
        let principal = Principal::new("alice").with_token("shared-token");

        let first = f.manager.create(&principal, "secret").unwrap();
        assert_eq!(first.token, "shared-token");
        assert_eq!(f.manager.reference_count("shared-token").unwrap(), 1);

        let second = f.manager.create(&principal, "secret").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(f.manager.reference_count("shared-token").unwrap(), 2);

        assert_eq!(f.manager.close("shared-token").unwrap(), 1);
        assert!(f.manager.find("shared-token").is_ok());

        assert_eq!(f.manager.close("shared-token").unwrap(), 0);
        assert!(f.manager.find("shared-token").unwrap_err().is_removed());
        assert!(f.manager.close("shared-token").unwrap_err().is_removed());

        f.manager.executor().drain().await.unwrap();
        let stored = f.store.load(first.id).unwrap().unwrap();
        assert!(stored.is_closed());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_join_by_other_user_is_rejected() {
        let f = fixture();
        let session = f.manager.create(&Principal::new("alice"), "secret").unwrap();

        let intruder = Principal::new("bob").with_token(session.token.clone());
        let err = f.manager.create(&intruder, "hunter2").unwrap_err();
        assert!(matches!(err, SessionError::Authentication(_)));
        assert_eq!(f.manager.reference_count(&session.token).unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_applies_mutable_subset_only() {
        let f = fixture();
        let original = f.manager.create(&Principal::new("alice"), "secret").unwrap();

        let mut edit = f.manager.copy(&original);
        edit.time_to_idle = Duration::from_secs(120);
        edit.message = Some("working".into());
        edit.owner = "mallory".into();
        edit.started = Utc::now() + chrono::Duration::days(1);

        let updated = f.manager.update(&edit).unwrap();
        assert_eq!(updated.time_to_idle, Duration::from_secs(120));
        assert_eq!(updated.message.as_deref(), Some("working"));
        assert_eq!(updated.owner, original.owner);
        assert_eq!(updated.started, original.started);
        assert_eq!(updated.id, original.id);

        let ctx = f.manager.find(&original.token).unwrap();
        assert_eq!(ctx.session(), &updated);
        assert_eq!(ctx.count().get(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_rejects_zero_and_clamps() {
        let f = fixture();
        let original = f.manager.create(&Principal::new("alice"), "secret").unwrap();

        let mut edit = f.manager.copy(&original);
        edit.time_to_idle = Duration::ZERO;
        let err = f.manager.update(&edit).unwrap_err();
        assert!(matches!(err, SessionError::SecurityViolation(_)));

        let mut edit = f.manager.copy(&original);
        edit.time_to_live = Duration::ZERO;
        assert!(f.manager.update(&edit).is_err());

        let mut edit = f.manager.copy(&original);
        edit.time_to_idle = Duration::from_secs(1_000_000);
        edit.time_to_live = Duration::from_secs(10_000_000);
        let updated = f.manager.update(&edit).unwrap();
        assert_eq!(updated.time_to_idle, f.manager.config().max_time_to_idle);
        assert_eq!(updated.time_to_live, f.manager.config().max_time_to_live);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_group_requires_membership() {
        let f = fixture();
        let original = f.manager.create(&Principal::new("alice"), "secret").unwrap();

        let mut edit = f.manager.copy(&original);
        edit.group = "lab".into();
        assert_eq!(f.manager.update(&edit).unwrap().group, "lab");

        let mut edit = f.manager.copy(&original);
        edit.group = "admins".into();
        let err = f.manager.update(&edit).unwrap_err();
        assert!(matches!(err, SessionError::SecurityViolation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_identity_reload_refreshes_and_evicts() {
        let f = fixture();
        let alice = f.manager.create(&Principal::new("alice"), "secret").unwrap();
        let bob = f.manager.create(&Principal::new("bob"), "hunter2").unwrap();

        f.identity.set_roles("alice", vec!["admin".into()]);
        f.identity.remove_user("bob");
        f.manager
            .cache()
            .update_event(&crate::events::SessionEvent::IdentityChanged);

        let summary = f.manager.cache().do_update().unwrap();
        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.evicted, 1);

        let ctx = f.manager.find(&alice.token).unwrap();
        assert!(ctx.has_role("admin"));
        assert!(!ctx.has_role("user"));
        assert_eq!(ctx.count().get(), 1);
        assert!(f.manager.find(&bob.token).unwrap_err().is_removed());
    }
}
