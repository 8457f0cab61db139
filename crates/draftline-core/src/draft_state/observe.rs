//! Subscriptions over draft states.

use super::model::{DraftState, MessageId, UserId};
use super::repository::DraftStateRepository;
use crate::Result;
use crate::database::{ChangeListener, Table};

const DRAFT_TABLES: &[Table] = &[Table::DraftStates];

/// Value emitted when observing a single draft state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed<T> {
    /// The row exists.
    Found(T),
    /// The row does not exist, or was deleted.
    NotFound,
}

impl<T> Observed<T> {
    /// Converts into an `Option`.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(value) => Some(value),
            Self::NotFound => None,
        }
    }
}

/// Subscription to the draft state of one message.
#[derive(Debug)]
pub struct DraftStateSubscription {
    repo: DraftStateRepository,
    user_id: UserId,
    message_id: MessageId,
    listener: ChangeListener,
    primed: bool,
}

impl DraftStateSubscription {
    pub(super) fn new(repo: DraftStateRepository, user_id: UserId, message_id: MessageId) -> Self {
        // Listen before the first read so no commit falls in between.
        let listener = repo.database().listen(&user_id, DRAFT_TABLES);
        Self {
            repo,
            user_id,
            message_id,
            listener,
            primed: false,
        }
    }

    /// Next value: the current one on the first call, then one per committed change.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next(&mut self) -> Result<Observed<DraftState>> {
        if self.primed {
            self.listener.changed().await;
        }
        self.primed = true;

        Ok(match self.repo.get(&self.user_id, &self.message_id).await? {
            Some(state) => Observed::Found(state),
            None => Observed::NotFound,
        })
    }
}

/// Subscription to all draft states of one user.
#[derive(Debug)]
pub struct DraftStatesSubscription {
    repo: DraftStateRepository,
    user_id: UserId,
    listener: ChangeListener,
    primed: bool,
}

impl DraftStatesSubscription {
    pub(super) fn new(repo: DraftStateRepository, user_id: UserId) -> Self {
        let listener = repo.database().listen(&user_id, DRAFT_TABLES);
        Self {
            repo,
            user_id,
            listener,
            primed: false,
        }
    }

    /// Next list of states: the current one on the first call, then one per committed change.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next(&mut self) -> Result<Vec<DraftState>> {
        if self.primed {
            self.listener.changed().await;
        }
        self.primed = true;

        self.repo.list_for_user(&self.user_id).await
    }
}
