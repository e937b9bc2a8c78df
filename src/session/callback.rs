//! Per-session callbacks registered by other subsystems.

use std::any::Any;
use std::sync::Arc;

/// Hook notified about lifecycle events of one session.
///
/// Callbacks run outside the registry's locks and must not block for long.
pub trait SessionCallback: Send + Sync {
    /// Human readable name, used in logs.
    fn name(&self) -> &str;

    /// Object the callback manages on behalf of the session, if any.
    fn object(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    /// Another caller attached to the session identified by `token`.
    fn join(&self, token: &str);

    /// The session was removed from the registry.
    fn close(&self);
}
