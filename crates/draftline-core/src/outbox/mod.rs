//! Outbox tracking.
//!
//! The outbox is not stored: it is the join of the message labels with the
//! draft states, recomputed whenever either side changes.

mod labels;
mod view;

pub use labels::{LabelId, MessageLabelRepository, SystemLabel};
pub use view::{OutboxRepository, OutboxSubscription};
