use std::fmt;

use serde::{Deserialize, Serialize};

/// Save state of a persisted object.
///
/// ```text
/// new ──► saving ──► persistent ──► dirty ──► saving ──► ...
///  │                    │
///  └──► pendingRemoval ◄┘        (any of new/dirty/pendingRemoval)
///                                  └──► abandoned  (lost update)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PersistenceState {
    /// Created in memory, never written.
    New,
    /// In memory and in storage with the same content.
    Persistent,
    /// Mutated since the last successful write.
    Dirty,
    /// A write is outstanding.
    Saving,
    /// Marked for deletion, not yet removed from storage.
    PendingRemoval,
    /// Released with unwritten changes; the changes are lost.
    Abandoned,
}

impl PersistenceState {
    /// Returns `true` if the state holds changes that storage has not seen.
    pub fn has_unsaved_changes(&self) -> bool {
        matches!(self, Self::New | Self::Dirty | Self::PendingRemoval)
    }
}

impl fmt::Display for PersistenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Persistent => write!(f, "persistent"),
            Self::Dirty => write!(f, "dirty"),
            Self::Saving => write!(f, "saving"),
            Self::PendingRemoval => write!(f, "pendingRemoval"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}
