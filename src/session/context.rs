//! Cached session context and usage statistics.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use super::{Counter, Session, SessionId};

/// Snapshot of a session plus the authorization data derived from its owner.
///
/// The context itself is immutable; a change builds a new context. The
/// [`Counter`] and [`SessionStats`] handles are shared between a context and
/// every context derived from it, so outstanding holders keep seeing the
/// same lease count and usage numbers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: Session,
    leader_of_groups: BTreeSet<String>,
    member_of_groups: BTreeSet<String>,
    roles: Vec<String>,
    stats: SessionStats,
    count: Counter,
}

impl SessionContext {
    /// Create a context with a fresh counter at zero.
    pub fn new(
        session: Session,
        roles: Vec<String>,
        member_of_groups: impl IntoIterator<Item = String>,
        leader_of_groups: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            session,
            leader_of_groups: leader_of_groups.into_iter().collect(),
            member_of_groups: member_of_groups.into_iter().collect(),
            roles,
            stats: SessionStats::new(),
            count: Counter::new(),
        }
    }

    /// Build a context for `session` that shares the lease of `previous`.
    pub fn from_previous(previous: &SessionContext, session: Session) -> Self {
        Self {
            session,
            ..previous.clone()
        }
    }

    /// Copy-on-write replacement of the session value.
    pub fn with_session(&self, session: Session) -> Self {
        Self::from_previous(self, session)
    }

    /// Replace the derived authorization data, keeping session and lease.
    pub fn with_identity(
        &self,
        roles: Vec<String>,
        member_of_groups: impl IntoIterator<Item = String>,
        leader_of_groups: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            roles,
            member_of_groups: member_of_groups.into_iter().collect(),
            leader_of_groups: leader_of_groups.into_iter().collect(),
            ..self.clone()
        }
    }

    /// Adopt the counter and stats of `from`, whatever this context carried.
    pub(crate) fn inherit_lease(mut self, from: &SessionContext) -> Self {
        self.count = from.count.clone();
        self.stats = from.stats.clone();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn id(&self) -> SessionId {
        self.session.id
    }

    pub fn token(&self) -> &str {
        &self.session.token
    }

    /// The shared reference counter.
    pub fn count(&self) -> &Counter {
        &self.count
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn member_of_groups(&self) -> &BTreeSet<String> {
        &self.member_of_groups
    }

    pub fn leader_of_groups(&self) -> &BTreeSet<String> {
        &self.leader_of_groups
    }

    pub fn is_member_of(&self, group: &str) -> bool {
        self.member_of_groups.contains(group)
    }

    pub fn is_leader_of(&self, group: &str) -> bool {
        self.leader_of_groups.contains(group)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Usage counters for a session, consulted by metrics collaborators.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    inner: Arc<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    methods_in: AtomicU64,
    methods_out: AtomicU64,
    objects_read: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub methods_in: u64,
    pub methods_out: u64,
    pub objects_read: u64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record entry into a service method.
    pub fn method_in(&self) {
        self.inner.methods_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record exit from a service method.
    pub fn method_out(&self) {
        self.inner.methods_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn read_objects(&self, n: u64) {
        self.inner.objects_read.fetch_add(n, Ordering::Relaxed);
    }

    /// Methods entered but not yet exited.
    pub fn active_methods(&self) -> u64 {
        let snap = self.snapshot();
        snap.methods_in.saturating_sub(snap.methods_out)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            methods_in: self.inner.methods_in.load(Ordering::Relaxed),
            methods_out: self.inner.methods_out.load(Ordering::Relaxed),
            objects_read: self.inner.objects_read.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::record::sample;

    fn context() -> SessionContext {
        SessionContext::new(
            sample("tok-1"),
            vec!["user".into()],
            vec!["users".to_string(), "lab".to_string()],
            vec!["lab".to_string()],
        )
    }

    #[test]
    fn test_new_context() {
        let ctx = context();
        assert_eq!(ctx.token(), "tok-1");
        assert_eq!(ctx.count().get(), 0);
        assert!(ctx.is_member_of("lab"));
        assert!(ctx.is_leader_of("lab"));
        assert!(!ctx.is_leader_of("users"));
        assert!(ctx.has_role("user"));
        assert!(!ctx.has_role("admin"));
    }

    #[test]
    fn test_from_previous_shares_counter() {
        let original = context();
        original.count().increment();

        let mut changed = original.session().clone();
        changed.message = Some("hello".into());
        let joined = SessionContext::from_previous(&original, changed);

        joined.count().increment();
        assert_eq!(original.count().get(), 2);
        assert!(joined.count().shares_with(original.count()));
        assert_eq!(joined.session().message.as_deref(), Some("hello"));
        assert!(original.session().message.is_none());
    }

    #[test]
    fn test_with_identity_keeps_lease() {
        let original = context();
        let reloaded = original.with_identity(
            vec!["admin".into()],
            vec!["admins".to_string()],
            Vec::<String>::new(),
        );
        assert!(reloaded.has_role("admin"));
        assert!(!reloaded.is_member_of("lab"));
        assert!(reloaded.count().shares_with(original.count()));
        assert_eq!(reloaded.session(), original.session());
    }

    #[test]
    fn test_inherit_lease() {
        let original = context();
        let stranger = SessionContext::new(sample("tok-1"), vec![], Vec::new(), Vec::new());
        let adopted = stranger.inherit_lease(&original);
        assert!(adopted.count().shares_with(original.count()));
    }

    #[test]
    fn test_stats() {
        let ctx = context();
        ctx.stats().method_in();
        ctx.stats().method_in();
        ctx.stats().method_out();
        ctx.stats().read_objects(5);

        let copy = ctx.clone();
        let snap = copy.stats().snapshot();
        assert_eq!(snap.methods_in, 2);
        assert_eq!(snap.methods_out, 1);
        assert_eq!(snap.objects_read, 5);
        assert_eq!(copy.stats().active_methods(), 1);
    }
}
