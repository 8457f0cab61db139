//! SQLite database shared by the draft state and label repositories.
//!
//! Besides the connection pool, the database owns a change feed: every
//! committed write publishes a `TableChange`, and subscriptions use it to
//! know when to re-run their query.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::Result;
use crate::draft_state::UserId;

const CHANGE_FEED_CAPACITY: usize = 256;

/// Table touched by a committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Table {
    /// `draft_states`.
    DraftStates,
    /// `message_labels`.
    MessageLabels,
}

/// Notification published after a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableChange {
    /// Table that was written.
    pub table: Table,
    /// User whose rows changed.
    pub user_id: UserId,
}

/// Connection pool plus change feed.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
    changes: broadcast::Sender<TableChange>,
}

impl Database {
    /// Open the database at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Self::with_pool(pool).await
    }

    /// Create an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        // A single connection that never expires, otherwise the data goes with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let db = Self { pool, changes };
        db.initialize().await?;
        Ok(db)
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS draft_states (
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                api_message_id TEXT,
                state TEXT NOT NULL,
                action TEXT NOT NULL,
                sending_error TEXT,
                sending_status_confirmed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (user_id, message_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_draft_states_user ON draft_states(user_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_draft_states_user_message
            ON draft_states(user_id, message_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        // Keyed by the API message id, the way labels come back from the server
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS message_labels (
                user_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                PRIMARY KEY (user_id, message_id, label_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_message_labels_user_label
            ON message_labels(user_id, label_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Publish a committed change. Having no subscribers is fine.
    pub(crate) fn notify(&self, table: Table, user_id: &UserId) {
        let _ = self.changes.send(TableChange {
            table,
            user_id: user_id.clone(),
        });
    }

    pub(crate) fn listen(&self, user_id: &UserId, tables: &'static [Table]) -> ChangeListener {
        ChangeListener {
            rx: self.changes.subscribe(),
            user_id: user_id.clone(),
            tables,
        }
    }
}

/// Waits for changes relevant to one user and a set of tables.
#[derive(Debug)]
pub(crate) struct ChangeListener {
    rx: broadcast::Receiver<TableChange>,
    user_id: UserId,
    tables: &'static [Table],
}

impl ChangeListener {
    fn is_relevant(&self, change: &TableChange) -> bool {
        change.user_id == self.user_id && self.tables.contains(&change.table)
    }

    /// Resolves once at least one relevant change was committed.
    ///
    /// Pending relevant changes are drained so that a burst of writes leads
    /// to a single recomputation.
    pub(crate) async fn changed(&mut self) {
        loop {
            match self.rx.recv().await {
                Ok(change) if self.is_relevant(&change) => break,
                Ok(_) => {}
                // Lagged: something was missed, recompute. Closed cannot happen
                // while the owning `Database` is alive.
                Err(RecvError::Lagged(_) | RecvError::Closed) => break,
            }
        }

        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }
}
