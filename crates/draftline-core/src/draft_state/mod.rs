//! Draft synchronization state.
//!
//! One row per draft tracks how far the draft has progressed towards the
//! server: local edits, upload, send. All writes go through
//! [`DraftStateRepository`], and state changes go through the guard in
//! [`transition`].

mod model;
mod observe;
mod repository;
pub mod transition;

pub use model::{DraftAction, DraftState, DraftSyncState, MessageId, SendingError, UserId};
pub use observe::{DraftStateSubscription, DraftStatesSubscription, Observed};
pub use repository::DraftStateRepository;
pub use transition::{Transition, next_state};
