//! Transition guard for draft synchronization states.
//!
//! Upload, attachment and send jobs complete asynchronously and in no
//! particular order. The guard decides whether a proposed state is applied
//! or dropped so that a late completion cannot move a message backwards.

use super::model::DraftSyncState;

/// Outcome of evaluating a proposed state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The proposed state becomes the new state.
    Applied(DraftSyncState),
    /// The proposed state was dropped; the row keeps `current`.
    Ignored {
        /// State the row keeps.
        current: DraftSyncState,
        /// State that was proposed.
        proposed: DraftSyncState,
    },
}

impl Transition {
    /// State stored after the transition.
    #[must_use]
    pub const fn resulting_state(self) -> DraftSyncState {
        match self {
            Self::Applied(state) | Self::Ignored { current: state, .. } => state,
        }
    }

    /// Returns true if the proposed state was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Decides the state that follows `current` when `proposed` is requested.
///
/// - `Synchronized` is refused while the send job owns the message.
/// - `Local` is only re-entered through an explicit local edit, never
///   through a job completion.
#[must_use]
pub fn next_state(current: DraftSyncState, proposed: DraftSyncState) -> Transition {
    let refused = match proposed {
        DraftSyncState::Synchronized => current.is_sending(),
        DraftSyncState::Local => current != DraftSyncState::Local,
        _ => false,
    };

    if refused {
        Transition::Ignored { current, proposed }
    } else {
        Transition::Applied(proposed)
    }
}
