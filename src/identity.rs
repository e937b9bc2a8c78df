//! Identity and authentication collaborator.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::events::{EventBus, SessionEvent};
use crate::session::Principal;

/// Group memberships and roles of one user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships {
    pub member_of: Vec<String>,
    pub leader_of: Vec<String>,
    pub roles: Vec<String>,
}

/// Upstream source of users, groups and credentials.
pub trait IdentityService: Send + Sync {
    /// Whether `credentials` are valid for `principal`.
    fn check_credentials(&self, principal: &Principal, credentials: &str) -> bool;

    /// Group used when the principal does not name one.
    fn resolve_default_group(&self, principal: &Principal) -> Option<String>;

    /// Event type used when the principal does not name one.
    fn resolve_default_event_type(&self, _principal: &Principal) -> Option<String> {
        None
    }

    /// Role names of the principal, in order.
    fn resolve_roles(&self, principal: &Principal) -> Vec<String> {
        self.memberships(&principal.name)
            .map(|m| m.roles)
            .unwrap_or_default()
    }

    /// Current memberships, or `None` if the user no longer exists.
    fn memberships(&self, name: &str) -> Option<Memberships>;
}

/// A user known to [`InMemoryIdentity`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAccount {
    pub name: String,
    pub password: String,
    /// Groups the user belongs to; the first one is the default group.
    pub groups: Vec<String>,
    pub leader_of: Vec<String>,
    pub roles: Vec<String>,
    pub event_type: Option<String>,
}

impl UserAccount {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_leader_of<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leader_of = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Thread-safe user table.
///
/// Passwords are kept in plain text, so this is meant for demos and tests,
/// not production credentials. Every mutation publishes [`SessionEvent::IdentityChanged`] when an event
/// bus is attached, so cached sessions get reloaded.
#[derive(Debug, Default)]
pub struct InMemoryIdentity {
    users: RwLock<HashMap<String, UserAccount>>,
    events: Option<EventBus>,
}

impl InMemoryIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish identity changes on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Create a table from a list of accounts.
    pub fn from_accounts(accounts: impl IntoIterator<Item = UserAccount>) -> Self {
        let users = accounts
            .into_iter()
            .map(|account| (account.name.clone(), account))
            .collect();
        Self {
            users: RwLock::new(users),
            events: None,
        }
    }

    fn changed(&self) {
        if let Some(events) = &self.events {
            events.publish(SessionEvent::IdentityChanged);
        }
    }

    /// Add or replace a user.
    pub fn add_user(&self, account: UserAccount) {
        if let Ok(mut users) = self.users.write() {
            users.insert(account.name.clone(), account);
        }
        self.changed();
    }

    /// Remove a user. Returns whether it existed.
    pub fn remove_user(&self, name: &str) -> bool {
        let removed = self
            .users
            .write()
            .map(|mut users| users.remove(name).is_some())
            .unwrap_or(false);
        if removed {
            self.changed();
        }
        removed
    }

    /// Change a user's roles. Returns whether the user exists.
    pub fn set_roles(&self, name: &str, roles: Vec<String>) -> bool {
        let updated = self
            .users
            .write()
            .map(|mut users| match users.get_mut(name) {
                Some(account) => {
                    account.roles = roles;
                    true
                }
                None => false,
            })
            .unwrap_or(false);
        if updated {
            self.changed();
        }
        updated
    }

    /// Get the number of registered users.
    pub fn count(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }

    fn account(&self, name: &str) -> Option<UserAccount> {
        self.users.read().ok()?.get(name).cloned()
    }
}

impl IdentityService for InMemoryIdentity {
    fn check_credentials(&self, principal: &Principal, credentials: &str) -> bool {
        self.account(&principal.name)
            .map(|account| {
                constant_time_eq(account.password.as_bytes(), credentials.as_bytes())
            })
            .unwrap_or(false)
    }

    fn resolve_default_group(&self, principal: &Principal) -> Option<String> {
        self.account(&principal.name)?.groups.into_iter().next()
    }

    fn resolve_default_event_type(&self, principal: &Principal) -> Option<String> {
        self.account(&principal.name)?.event_type
    }

    fn memberships(&self, name: &str) -> Option<Memberships> {
        self.account(name).map(|account| Memberships {
            member_of: account.groups,
            leader_of: account.leader_of,
            roles: account.roles,
        })
    }
}

/// Compare without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
