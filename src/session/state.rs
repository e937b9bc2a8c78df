//! Expiry state machine for cached contexts.

/// Liveness of a cached session context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextState {
    /// Within its idle and lifetime limits.
    #[default]
    Live,
    /// Logically expired; waiting for the next reload pass.
    Stale,
    /// Evicted from the registry. Terminal.
    Removed,
}

impl ContextState {
    /// Check if transition to target state is valid.
    ///
    /// Valid transitions:
    /// - Live -> Stale (expiry noticed on lookup)
    /// - Live -> Removed (explicit close or eviction)
    /// - Stale -> Live (reload pass refreshed it)
    /// - Stale -> Removed (reload pass evicted it)
    pub fn can_transition_to(&self, target: ContextState) -> bool {
        use ContextState::*;
        matches!(
            (*self, target),
            (Live, Stale) | (Live, Removed) | (Stale, Live) | (Stale, Removed)
        )
    }

    /// Attempt to transition to a new state.
    ///
    /// Returns `true` if the state changed.
    pub fn transition_to(&mut self, target: ContextState) -> bool {
        if self.can_transition_to(target) {
            *self = target;
            true
        } else {
            false
        }
    }

    /// Check if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextState::Removed)
    }

    /// Check if lookups may succeed in this state.
    pub fn is_live(&self) -> bool {
        matches!(self, ContextState::Live)
    }
}
