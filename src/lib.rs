//! # session-registry
//!
//! In-process session registry: authenticate a client once, then let it
//! (and anyone else presenting the same token) make many cheap calls while
//! idle and lifetime limits, holder counts and upstream identity changes
//! are enforced.
//!
//! ## Features
//!
//! - **Shared leases**: joined sessions share one reference counter
//! - **Two-phase expiry**: lookups mark expired sessions stale, the reload
//!   pass evicts them
//! - **Bulk reload**: one exclusive pass reconciles every session with
//!   current identity data
//! - **Background persistence**: durable writes never block callers
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use session_registry::identity::{InMemoryIdentity, UserAccount};
//! use session_registry::store::{MemoryStore, PersistenceExecutor};
//! use session_registry::{Principal, SessionCache, SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> session_registry::Result<()> {
//!     session_registry::logging::try_init().ok();
//!
//!     let identity = Arc::new(InMemoryIdentity::from_accounts([
//!         UserAccount::new("alice", "secret").with_groups(["users"]),
//!     ]));
//!     let executor = PersistenceExecutor::current(Arc::new(MemoryStore::new()))?;
//!     let manager = SessionManager::new(
//!         SessionConfig::default(),
//!         Arc::new(SessionCache::default()),
//!         identity,
//!         executor,
//!     )?;
//!
//!     let session = manager.create(&Principal::new("alice"), "secret")?;
//!     let context = manager.find(&session.token)?;
//!     println!("{} holds {} lease(s)", context.token(), context.count().get());
//!
//!     manager.close(&session.token)?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod logging;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use error::{Result, SessionError};
pub use events::{EventBus, RemovalReason, SessionEvent};
pub use session::{
    ContextState, Counter, Principal, ReloadSummary, Session, SessionCache, SessionCallback,
    SessionConfig, SessionContext, SessionId, SessionKey, SessionManager, StaleCacheListener,
};
