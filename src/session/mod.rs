//! Session registry module.
//!
//! This module provides the session record, the cached context with its
//! shared reference counter, the concurrent registry and the manager that
//! drives session lifecycles.

mod cache;
mod callback;
mod context;
mod counter;
pub(crate) mod id;
mod manager;
pub(crate) mod record;
mod state;

pub use cache::{ReloadSummary, SessionCache, SessionData, SessionKey, StaleCacheListener};
pub use callback::SessionCallback;
pub use context::{SessionContext, SessionStats, StatsSnapshot};
pub use counter::Counter;
pub use id::{new_token, SessionId};
pub use manager::{IdentityReloader, SessionConfig, SessionManager};
pub use record::{Principal, Session};
pub use state::ContextState;
