//! Session record and identity claim.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::SessionId;

/// Durable record of one authenticated client interaction window.
///
/// Values are never mutated while shared: an update builds a new `Session`
/// and swaps it into the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Stable internal identifier.
    pub id: SessionId,
    /// Opaque external credential; immutable once assigned.
    pub token: String,
    /// Name of the principal that owns this session.
    pub owner: String,
    /// Group the session acts in.
    pub group: String,
    pub default_event_type: String,
    pub started: DateTime<Utc>,
    pub closed: Option<DateTime<Utc>>,
    /// Maximum time between accesses.
    #[serde(with = "duration_ms")]
    pub time_to_idle: Duration,
    /// Maximum time since `started`.
    #[serde(with = "duration_ms")]
    pub time_to_live: Duration,
    pub user_agent: Option<String>,
    pub user_ip: Option<String>,
    pub message: Option<String>,
}

impl Session {
    /// Whether the session has been closed by its owner.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    /// Whether `now - started` exceeds the lifetime.
    pub fn lifetime_exceeded(&self, now: DateTime<Utc>) -> bool {
        exceeds(now - self.started, self.time_to_live)
    }

    /// Whether `now - last_access` exceeds the idle limit.
    pub fn idle_exceeded(&self, last_access: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        exceeds(now - last_access, self.time_to_idle)
    }

    /// Combined idle and lifetime check.
    pub fn is_expired(&self, last_access: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.idle_exceeded(last_access, now) || self.lifetime_exceeded(now)
    }
}

fn exceeds(elapsed: chrono::Duration, limit: Duration) -> bool {
    let limit_ms = i64::try_from(limit.as_millis()).unwrap_or(i64::MAX);
    elapsed.num_milliseconds() > limit_ms
}

/// Identity claim presented when creating or joining a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub group: Option<String>,
    pub event_type: Option<String>,
    /// Token of an existing session to join, or to assign to a new one.
    pub token: Option<String>,
}

impl Principal {
    /// Create a principal with just a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
pub(crate) fn sample(token: &str) -> Session {
    Session {
        id: SessionId::new(),
        token: token.to_string(),
        owner: "alice".to_string(),
        group: "users".to_string(),
        default_event_type: "User".to_string(),
        started: Utc::now(),
        closed: None,
        time_to_idle: Duration::from_secs(600),
        time_to_live: Duration::from_secs(3600),
        user_agent: None,
        user_ip: None,
        message: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_not_expired() {
        let s = sample("t");
        let now = Utc::now();
        assert!(!s.is_expired(now, now));
    }

    #[test]
    fn test_idle_exceeded() {
        let mut s = sample("t");
        s.time_to_idle = Duration::from_millis(100);
        let last = Utc::now() - chrono::Duration::milliseconds(500);
        assert!(s.idle_exceeded(last, Utc::now()));
        assert!(s.is_expired(last, Utc::now()));
    }

    #[test]
    fn test_lifetime_exceeded() {
        let mut s = sample("t");
        s.time_to_live = Duration::from_millis(100);
        s.started = Utc::now() - chrono::Duration::seconds(1);
        let now = Utc::now();
        assert!(s.lifetime_exceeded(now));
        assert!(s.is_expired(now, now));
    }

    #[test]
    fn test_durations_serialize_as_millis() {
        let s = sample("t");
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["time_to_idle"], 600_000);
        assert_eq!(json["time_to_live"], 3_600_000);
    }

    #[test]
    fn test_principal_builder() {
        let p = Principal::new("bob").with_group("admins").with_token("abc");
        assert_eq!(p.name, "bob");
        assert_eq!(p.group.as_deref(), Some("admins"));
        assert_eq!(p.token.as_deref(), Some("abc"));
        assert!(p.event_type.is_none());
    }
}
