//! Persistence states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a persistent object relative to its context and the
/// database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any context.
    #[default]
    Transient,
    /// Registered, not yet inserted.
    New,
    /// Committed object with uncommitted changes.
    Modified,
    /// In sync with the last known database state.
    Committed,
    /// Only the id is known; properties load on first access.
    Hollow,
    /// Marked for deletion at the next commit.
    Deleted,
}

impl PersistenceState {
    /// States that produce row operations at commit.
    pub const fn is_dirty(self) -> bool {
        matches!(
            self,
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
        )
    }

    /// States whose object has a row in the database.
    pub const fn is_persistent(self) -> bool {
        matches!(
            self,
            PersistenceState::Committed
                | PersistenceState::Modified
                | PersistenceState::Hollow
                | PersistenceState::Deleted
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            PersistenceState::Transient => "transient",
            PersistenceState::New => "new",
            PersistenceState::Modified => "modified",
            PersistenceState::Committed => "committed",
            PersistenceState::Hollow => "hollow",
            PersistenceState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identity of an object context, also used as the event source of the
/// snapshot changes it publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_states() {
        assert!(PersistenceState::New.is_dirty());
        assert!(PersistenceState::Deleted.is_dirty());
        assert!(!PersistenceState::Hollow.is_dirty());
        assert!(PersistenceState::Hollow.is_persistent());
        assert!(!PersistenceState::New.is_persistent());
    }

    #[test]
    fn context_ids_are_unique() {
        assert_ne!(ContextId::next(), ContextId::next());
    }
}
