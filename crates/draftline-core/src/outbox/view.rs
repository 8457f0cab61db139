//! Outbox projection.

use sqlx::Row;

use super::labels::LabelId;
use crate::Result;
use crate::database::{ChangeListener, Database, Table};
use crate::draft_state::{DraftSyncState, MessageId, UserId};

const OUTBOX_TABLES: &[Table] = &[Table::DraftStates, Table::MessageLabels];

/// Read-only view of the messages currently being sent.
///
/// A draft is in the outbox when its API message id carries the Outbox label
/// and its sync state is one of [`DraftSyncState::OUTBOX`]. Nothing is
/// cached: each read runs the join.
#[derive(Debug, Clone)]
pub struct OutboxRepository {
    db: Database,
}

impl OutboxRepository {
    /// Create a view over the given database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Local message ids currently in the outbox, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn outbox(&self, user_id: &UserId) -> Result<Vec<MessageId>> {
        let [first, second, third] = DraftSyncState::OUTBOX;

        let rows = sqlx::query(
            r"
            SELECT d.message_id
            FROM draft_states d
            JOIN message_labels l
                ON l.user_id = d.user_id AND l.message_id = d.api_message_id
            WHERE d.user_id = ?
              AND l.label_id = ?
              AND d.state IN (?, ?, ?)
            ORDER BY d.message_id ASC
            ",
        )
        .bind(user_id.as_str())
        .bind(LabelId::outbox().as_str())
        .bind(first.as_str())
        .bind(second.as_str())
        .bind(third.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| MessageId(row.get("message_id")))
            .collect())
    }

    /// Observe the outbox of a user.
    ///
    /// Recomputed after every committed change to draft states or labels of
    /// that user.
    #[must_use]
    pub fn observe_outbox(&self, user_id: &UserId) -> OutboxSubscription {
        OutboxSubscription {
            view: self.clone(),
            listener: self.db.listen(user_id, OUTBOX_TABLES),
            user_id: user_id.clone(),
            primed: false,
        }
    }
}

/// Subscription to the outbox of one user.
#[derive(Debug)]
pub struct OutboxSubscription {
    view: OutboxRepository,
    listener: ChangeListener,
    user_id: UserId,
    primed: bool,
}

impl OutboxSubscription {
    /// Next outbox content: the current one on the first call, then one per committed change.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next(&mut self) -> Result<Vec<MessageId>> {
        if self.primed {
            self.listener.changed().await;
        }
        self.primed = true;

        self.view.outbox(&self.user_id).await
    }
}
