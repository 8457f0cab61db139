//! Message-to-label relation.

use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::debug;

use crate::Result;
use crate::database::{Database, Table};
use crate::draft_state::{MessageId, UserId};

/// Identifier of a label or system folder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LabelId(pub String);

impl LabelId {
    /// Create a new label ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// All drafts, regardless of folder.
    #[must_use]
    pub fn all_drafts() -> Self {
        Self::new(SystemLabel::AllDrafts.id())
    }

    /// Drafts folder.
    #[must_use]
    pub fn drafts() -> Self {
        Self::new(SystemLabel::Drafts.id())
    }

    /// Outbox folder.
    #[must_use]
    pub fn outbox() -> Self {
        Self::new(SystemLabel::Outbox.id())
    }
}

impl std::fmt::Display for LabelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// System labels touched by the draft lifecycle, with their API ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemLabel {
    /// All drafts.
    AllDrafts,
    /// All sent messages.
    AllSent,
    /// Sent folder.
    Sent,
    /// Drafts folder.
    Drafts,
    /// Messages being sent.
    Outbox,
}

impl SystemLabel {
    /// API identifier of the label.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::AllDrafts => "1",
            Self::AllSent => "2",
            Self::Sent => "7",
            Self::Drafts => "8",
            Self::Outbox => "9",
        }
    }
}

/// Repository for the labels applied to remote messages.
///
/// Messages are referenced by their API id.
#[derive(Debug, Clone)]
pub struct MessageLabelRepository {
    db: Database,
}

impl MessageLabelRepository {
    /// Create a repository over the given database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Apply a label to a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn add_label(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        label_id: &LabelId,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT OR IGNORE INTO message_labels (user_id, message_id, label_id)
            VALUES (?, ?, ?)
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .bind(label_id.as_str())
        .execute(self.db.pool())
        .await?;

        self.db.notify(Table::MessageLabels, user_id);
        Ok(())
    }

    /// Remove a label from a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn remove_label(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        label_id: &LabelId,
    ) -> Result<()> {
        sqlx::query(
            r"
            DELETE FROM message_labels
            WHERE user_id = ? AND message_id = ? AND label_id = ?
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .bind(label_id.as_str())
        .execute(self.db.pool())
        .await?;

        self.db.notify(Table::MessageLabels, user_id);
        Ok(())
    }

    /// Labels applied to a message, sorted by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn labels_for(&self, user_id: &UserId, message_id: &MessageId) -> Result<Vec<LabelId>> {
        let rows = sqlx::query(
            r"
            SELECT label_id FROM message_labels
            WHERE user_id = ? AND message_id = ?
            ORDER BY label_id ASC
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows.iter().map(|row| LabelId(row.get("label_id"))).collect())
    }

    /// Move a message out of the drafts folders into the outbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn move_to_outbox(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        self.relabel(
            user_id,
            message_id,
            &[SystemLabel::Drafts, SystemLabel::AllDrafts],
            &[SystemLabel::Outbox],
        )
        .await
    }

    /// Move a message that finished sending from the outbox to the sent folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn move_to_sent(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        self.relabel(
            user_id,
            message_id,
            &[SystemLabel::Outbox],
            &[SystemLabel::Sent, SystemLabel::AllSent],
        )
        .await
    }

    /// Move a message whose send failed back to the drafts folders.
    ///
    /// # Errors
    ///
    /// Returns an error if the database transaction fails.
    pub async fn move_to_drafts(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        self.relabel(
            user_id,
            message_id,
            &[SystemLabel::Outbox, SystemLabel::Sent, SystemLabel::AllSent],
            &[SystemLabel::Drafts, SystemLabel::AllDrafts],
        )
        .await
    }

    async fn relabel(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        remove: &[SystemLabel],
        add: &[SystemLabel],
    ) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        for label in remove {
            sqlx::query(
                r"
                DELETE FROM message_labels
                WHERE user_id = ? AND message_id = ? AND label_id = ?
                ",
            )
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .bind(label.id())
            .execute(&mut *tx)
            .await?;
        }

        for label in add {
            sqlx::query(
                r"
                INSERT OR IGNORE INTO message_labels (user_id, message_id, label_id)
                VALUES (?, ?, ?)
                ",
            )
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .bind(label.id())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(%user_id, %message_id, ?remove, ?add, "message relabeled");
        self.db.notify(Table::MessageLabels, user_id);
        Ok(())
    }
}
