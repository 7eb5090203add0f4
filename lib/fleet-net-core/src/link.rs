//! Link between a source object and its replica in another cluster
//!
//! A replica may only exist while its source holds the cleanup finalizer, so the source can
//! never disappear before its replica has been withdrawn:
//!
//! ```text
//! Unlinked --add finalizer--> Linking --create replica--> Linked
//!    ^                                                      |
//!    +--remove finalizer-- Unlinking <--deleting/ineligible-+
//! ```

use std::fmt;

use crate::error::{FleetError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    /// No finalizer and no replica
    Unlinked,
    /// Finalizer in place, replica not yet created
    Linking,
    /// Finalizer in place and replica created
    Linked,
    /// Replica being withdrawn before the finalizer is released
    Unlinking,
}

impl LinkState {
    /// Derives the state from what is observable on the source and in the replica's cluster.
    pub fn observe(finalized: bool, replica_exists: bool, withdrawing: bool) -> Self {
        match (finalized, replica_exists, withdrawing) {
            (false, false, _) => Self::Unlinked,
            (false, true, _) | (true, _, true) => Self::Unlinking,
            (true, false, false) => Self::Linking,
            (true, true, false) => Self::Linked,
        }
    }

    pub fn replica_allowed(self) -> bool {
        matches!(self, Self::Linking | Self::Linked)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use LinkState::*;
        matches!(
            (self, next),
            (Unlinked, Linking)
                | (Linking, Linked)
                | (Linking, Unlinking)
                | (Linked, Unlinking)
                | (Unlinking, Unlinked)
        ) || self == next
    }

    /// Moves to `next`, or fails if that would break the link order.
    pub fn advance(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(FleetError::Internal(format!("illegal link transition from {self} to {next}")))
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unlinked => "Unlinked",
            Self::Linking => "Linking",
            Self::Linked => "Linked",
            Self::Unlinking => "Unlinking",
        };
        write!(f, "{s}")
    }
}
