//! Draft state storage repository.
//!
//! Guarded writes are compare-and-swap updates: the row is read, the
//! transition guard picks the next state, and the `UPDATE` only matches if
//! the stored state is still the one that was read. A writer that loses the
//! race re-reads and re-evaluates the guard.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::{debug, warn};

use super::model::{DraftAction, DraftState, DraftSyncState, MessageId, SendingError, UserId};
use super::observe::{DraftStateSubscription, DraftStatesSubscription};
use super::transition::{Transition, next_state};
use crate::config::StoreConfig;
use crate::database::{Database, Table};
use crate::{Error, Result};

/// Repository for draft synchronization states.
#[derive(Debug, Clone)]
pub struct DraftStateRepository {
    db: Database,
    max_cas_attempts: u32,
}

impl DraftStateRepository {
    /// Create a repository with default settings.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self::with_config(db, &StoreConfig::default())
    }

    /// Create a repository with the given store settings.
    #[must_use]
    pub fn with_config(db: Database, config: &StoreConfig) -> Self {
        Self {
            db,
            max_cas_attempts: config.max_cas_attempts.max(1),
        }
    }

    /// Database backing this repository.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }

    /// Create the draft state as `Local`, or reset an existing one to `Local`.
    ///
    /// Used whenever the draft is edited locally. An existing row keeps its
    /// action, API id and sending error; the confirmation flag is cleared.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn create_or_update_local_state(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        action: &DraftAction,
    ) -> Result<()> {
        let action_json = serde_json::to_string(action)?;

        sqlx::query(
            r"
            INSERT INTO draft_states
                (user_id, message_id, api_message_id, state, action,
                 sending_error, sending_status_confirmed, updated_at)
            VALUES (?, ?, NULL, ?, ?, NULL, 0, ?)
            ON CONFLICT(user_id, message_id) DO UPDATE SET
                state = excluded.state,
                sending_status_confirmed = 0,
                updated_at = excluded.updated_at
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .bind(DraftSyncState::Local.as_str())
        .bind(&action_json)
        .bind(timestamp())
        .execute(self.db.pool())
        .await?;

        debug!(%user_id, %message_id, "draft state set to local");
        self.db.notify(Table::DraftStates, user_id);
        Ok(())
    }

    /// Propose a new sync state and record the sending error.
    ///
    /// The proposed state goes through the transition guard. When the guard
    /// refuses it the current state is kept and a warning is logged, but
    /// `sending_error` is written either way.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft state does not exist, the database
    /// query fails, or concurrent writers exhaust the retry budget.
    pub async fn update_sync_state(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        proposed: DraftSyncState,
        sending_error: Option<&SendingError>,
    ) -> Result<Transition> {
        let error_json = encode_sending_error(sending_error)?;

        for _ in 0..self.max_cas_attempts {
            let current = self.require(user_id, message_id).await?;
            let transition = next_state(current.state, proposed);

            let result = sqlx::query(
                r"
                UPDATE draft_states
                SET state = ?, sending_error = ?, updated_at = ?
                WHERE user_id = ? AND message_id = ? AND state = ?
                ",
            )
            .bind(transition.resulting_state().as_str())
            .bind(&error_json)
            .bind(timestamp())
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .bind(current.state.as_str())
            .execute(self.db.pool())
            .await?;

            if result.rows_affected() == 1 {
                log_transition(user_id, message_id, transition);
                self.db.notify(Table::DraftStates, user_id);
                return Ok(transition);
            }
            debug!(%user_id, %message_id, "draft state changed concurrently, retrying");
        }

        Err(Error::Contention {
            user_id: user_id.clone(),
            message_id: message_id.clone(),
        })
    }

    /// Store the API message id and propose `Synchronized`.
    ///
    /// The API id is only written when none is stored yet; a different id for
    /// an already synchronized draft is ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft state does not exist, the database
    /// query fails, or concurrent writers exhaust the retry budget.
    pub async fn update_api_message_id_and_mark_synchronized(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        api_message_id: &MessageId,
    ) -> Result<Transition> {
        for _ in 0..self.max_cas_attempts {
            let current = self.require(user_id, message_id).await?;
            if let Some(existing) = current
                .api_message_id
                .as_ref()
                .filter(|existing| *existing != api_message_id)
            {
                warn!(
                    %user_id,
                    %message_id,
                    %existing,
                    rejected = %api_message_id,
                    "api message id already assigned, keeping it"
                );
            }
            let transition = next_state(current.state, DraftSyncState::Synchronized);

            let result = sqlx::query(
                r"
                UPDATE draft_states
                SET api_message_id = COALESCE(api_message_id, ?), state = ?, updated_at = ?
                WHERE user_id = ? AND message_id = ? AND state = ?
                ",
            )
            .bind(api_message_id.as_str())
            .bind(transition.resulting_state().as_str())
            .bind(timestamp())
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .bind(current.state.as_str())
            .execute(self.db.pool())
            .await?;

            if result.rows_affected() == 1 {
                log_transition(user_id, message_id, transition);
                self.db.notify(Table::DraftStates, user_id);
                return Ok(transition);
            }
            debug!(%user_id, %message_id, "draft state changed concurrently, retrying");
        }

        Err(Error::Contention {
            user_id: user_id.clone(),
            message_id: message_id.clone(),
        })
    }

    /// Set or clear the sending error without touching the sync state.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft state does not exist or the database query fails.
    pub async fn update_sending_error(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        sending_error: Option<&SendingError>,
    ) -> Result<()> {
        let error_json = encode_sending_error(sending_error)?;

        let result = sqlx::query(
            r"
            UPDATE draft_states SET sending_error = ?, updated_at = ?
            WHERE user_id = ? AND message_id = ?
            ",
        )
        .bind(&error_json)
        .bind(timestamp())
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .execute(self.db.pool())
        .await?;

        self.finish_point_update(user_id, message_id, result.rows_affected())
    }

    /// Record whether the user acknowledged the terminal send outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft state does not exist or the database query fails.
    pub async fn update_sending_confirmed(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        confirmed: bool,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE draft_states SET sending_status_confirmed = ?, updated_at = ?
            WHERE user_id = ? AND message_id = ?
            ",
        )
        .bind(confirmed)
        .bind(timestamp())
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .execute(self.db.pool())
        .await?;

        self.finish_point_update(user_id, message_id, result.rows_affected())
    }

    /// Remove the draft state. Removing a missing row is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        let result = sqlx::query("DELETE FROM draft_states WHERE user_id = ? AND message_id = ?")
            .bind(user_id.as_str())
            .bind(message_id.as_str())
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() > 0 {
            debug!(%user_id, %message_id, "draft state deleted");
            self.db.notify(Table::DraftStates, user_id);
        }
        Ok(())
    }

    /// Get the draft state of a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or the row cannot be decoded.
    pub async fn get(&self, user_id: &UserId, message_id: &MessageId) -> Result<Option<DraftState>> {
        let row = sqlx::query(
            r"
            SELECT user_id, message_id, api_message_id, state, action,
                   sending_error, sending_status_confirmed, updated_at
            FROM draft_states
            WHERE user_id = ? AND message_id = ?
            ",
        )
        .bind(user_id.as_str())
        .bind(message_id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(row_to_draft_state).transpose()
    }

    /// Get all draft states of a user, oldest update first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails or a row cannot be decoded.
    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<DraftState>> {
        let rows = sqlx::query(
            r"
            SELECT user_id, message_id, api_message_id, state, action,
                   sending_error, sending_status_confirmed, updated_at
            FROM draft_states
            WHERE user_id = ?
            ORDER BY updated_at ASC, message_id ASC
            ",
        )
        .bind(user_id.as_str())
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_draft_state).collect()
    }

    /// Observe the draft state of a message.
    ///
    /// The first call to `next` yields the current value; later calls wait
    /// for a committed change.
    #[must_use]
    pub fn observe(&self, user_id: &UserId, message_id: &MessageId) -> DraftStateSubscription {
        DraftStateSubscription::new(self.clone(), user_id.clone(), message_id.clone())
    }

    /// Observe all draft states of a user.
    #[must_use]
    pub fn observe_all(&self, user_id: &UserId) -> DraftStatesSubscription {
        DraftStatesSubscription::new(self.clone(), user_id.clone())
    }

    async fn require(&self, user_id: &UserId, message_id: &MessageId) -> Result<DraftState> {
        self.get(user_id, message_id)
            .await?
            .ok_or_else(|| Error::DraftStateNotFound {
                user_id: user_id.clone(),
                message_id: message_id.clone(),
            })
    }

    fn finish_point_update(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        rows_affected: u64,
    ) -> Result<()> {
        if rows_affected == 0 {
            return Err(Error::DraftStateNotFound {
                user_id: user_id.clone(),
                message_id: message_id.clone(),
            });
        }
        self.db.notify(Table::DraftStates, user_id);
        Ok(())
    }
}

fn log_transition(user_id: &UserId, message_id: &MessageId, transition: Transition) {
    match transition {
        Transition::Applied(state) => debug!(%user_id, %message_id, %state, "draft state updated"),
        Transition::Ignored { current, proposed } => warn!(
            %user_id,
            %message_id,
            %current,
            %proposed,
            "ignoring draft state transition"
        ),
    }
}

/// Fixed-width UTC timestamp so that text ordering matches time ordering.
fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn encode_sending_error(error: Option<&SendingError>) -> Result<Option<String>> {
    Ok(error.map(serde_json::to_string).transpose()?)
}

fn row_to_draft_state(row: &SqliteRow) -> Result<DraftState> {
    let state_str: String = row.get("state");
    let state = DraftSyncState::parse(&state_str)
        .ok_or_else(|| Error::InvalidData(format!("unknown draft sync state '{state_str}'")))?;

    let action_json: String = row.get("action");
    let sending_error_json: Option<String> = row.get("sending_error");
    let updated_at_str: String = row.get("updated_at");
    let updated_at = DateTime::parse_from_rfc3339(&updated_at_str)
        .map_err(|e| Error::InvalidData(format!("bad updated_at '{updated_at_str}': {e}")))?
        .with_timezone(&Utc);

    Ok(DraftState {
        user_id: UserId(row.get("user_id")),
        message_id: MessageId(row.get("message_id")),
        api_message_id: row.get::<Option<String>, _>("api_message_id").map(MessageId),
        state,
        action: serde_json::from_str(&action_json)?,
        sending_error: sending_error_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        sending_status_confirmed: row.get("sending_status_confirmed"),
        updated_at,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::draft_state::Observed;

    async fn repo() -> DraftStateRepository {
        DraftStateRepository::new(Database::in_memory().await.unwrap())
    }

    fn ids() -> (UserId, MessageId) {
        (UserId::new("user-1"), MessageId::new("local-1"))
    }

    #[tokio::test]
    async fn test_create_local_state() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Local);
        assert_eq!(state.action, DraftAction::Compose);
        assert_eq!(state.api_message_id, None);
        assert!(!state.sending_status_confirmed);
    }

    #[tokio::test]
    async fn test_local_edit_resets_state_and_keeps_action() {
        let repo = repo().await;
        let (user, message) = ids();
        let action = DraftAction::Reply(MessageId::new("parent"));

        repo.create_or_update_local_state(&user, &message, &action)
            .await
            .unwrap();
        repo.update_api_message_id_and_mark_synchronized(&user, &message, &MessageId::new("api"))
            .await
            .unwrap();
        repo.update_sending_confirmed(&user, &message, true)
            .await
            .unwrap();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Local);
        assert_eq!(state.action, action);
        assert_eq!(state.api_message_id, Some(MessageId::new("api")));
        assert!(!state.sending_status_confirmed);
    }

    #[tokio::test]
    async fn test_queued_then_synchronized() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        let transition = repo
            .update_sync_state(&user, &message, DraftSyncState::Queued, None)
            .await
            .unwrap();
        assert_eq!(transition, Transition::Applied(DraftSyncState::Queued));

        repo.update_api_message_id_and_mark_synchronized(&user, &message, &MessageId::new("42"))
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.api_message_id, Some(MessageId::new("42")));
        assert_eq!(state.state, DraftSyncState::Synchronized);
    }

    #[tokio::test]
    async fn test_sending_not_downgraded_but_error_cleared() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.update_sync_state(
            &user,
            &message,
            DraftSyncState::Sending,
            Some(&SendingError::Other),
        )
        .await
        .unwrap();

        let transition = repo
            .update_sync_state(&user, &message, DraftSyncState::Synchronized, None)
            .await
            .unwrap();
        assert!(!transition.is_applied());

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Sending);
        assert_eq!(state.sending_error, None);
    }

    #[tokio::test]
    async fn test_ignored_transition_still_stores_error() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.update_sync_state(&user, &message, DraftSyncState::Sent, None)
            .await
            .unwrap();
        repo.update_sync_state(
            &user,
            &message,
            DraftSyncState::Synchronized,
            Some(&SendingError::MessageAlreadySent),
        )
        .await
        .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Sent);
        assert_eq!(state.sending_error, Some(SendingError::MessageAlreadySent));
    }

    #[tokio::test]
    async fn test_api_message_id_is_never_reassigned() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.update_api_message_id_and_mark_synchronized(&user, &message, &MessageId::new("first"))
            .await
            .unwrap();
        repo.update_api_message_id_and_mark_synchronized(&user, &message, &MessageId::new("second"))
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.api_message_id, Some(MessageId::new("first")));
    }

    #[tokio::test]
    async fn test_mark_synchronized_while_sending_keeps_state_but_stores_id() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.update_sync_state(&user, &message, DraftSyncState::Sending, None)
            .await
            .unwrap();
        repo.update_api_message_id_and_mark_synchronized(&user, &message, &MessageId::new("api"))
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Sending);
        assert_eq!(state.api_message_id, Some(MessageId::new("api")));
    }

    #[tokio::test]
    async fn test_updates_on_missing_state_fail() {
        let repo = repo().await;
        let (user, message) = ids();

        let err = repo
            .update_sync_state(&user, &message, DraftSyncState::Queued, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DraftStateNotFound { .. }));

        let err = repo
            .update_sending_error(&user, &message, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DraftStateNotFound { .. }));
        assert!(err.is_local_data());
    }

    #[tokio::test]
    async fn test_sending_error_and_confirmation() {
        let repo = repo().await;
        let (user, message) = ids();
        let error = SendingError::GenericLocalized("Recipient rejected".to_string());

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.update_sending_error(&user, &message, Some(&error))
            .await
            .unwrap();
        repo.update_sending_confirmed(&user, &message, true)
            .await
            .unwrap();

        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.state, DraftSyncState::Local);
        assert_eq!(state.sending_error, Some(error));
        assert!(state.sending_status_confirmed);

        repo.update_sending_error(&user, &message, None).await.unwrap();
        let state = repo.get(&user, &message).await.unwrap().unwrap();
        assert_eq!(state.sending_error, None);
    }

    #[tokio::test]
    async fn test_delete_then_observe_not_found() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.delete(&user, &message).await.unwrap();
        repo.delete(&user, &message).await.unwrap();

        let mut subscription = repo.observe(&user, &message);
        assert_eq!(subscription.next().await.unwrap(), Observed::NotFound);
    }

    #[tokio::test]
    async fn test_list_for_user_is_scoped() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        repo.create_or_update_local_state(
            &user,
            &MessageId::new("local-2"),
            &DraftAction::Forward(MessageId::new("parent")),
        )
        .await
        .unwrap();
        repo.create_or_update_local_state(&UserId::new("other"), &message, &DraftAction::Compose)
            .await
            .unwrap();

        let states = repo.list_for_user(&user).await.unwrap();
        let ids: Vec<_> = states.iter().map(|s| s.message_id.as_str()).collect();
        assert_eq!(ids, vec!["local-1", "local-2"]);
    }

    #[tokio::test]
    async fn test_corrupt_state_is_reported() {
        let repo = repo().await;
        let (user, message) = ids();

        repo.create_or_update_local_state(&user, &message, &DraftAction::Compose)
            .await
            .unwrap();
        sqlx::query("UPDATE draft_states SET state = 'bogus'")
            .execute(repo.db.pool())
            .await
            .unwrap();

        let err = repo.get(&user, &message).await.unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
        assert!(err.is_local_data());
    }
}
