//! Outcome of recent sends, until the user acknowledges it.

use tracing::debug;

use crate::Result;
use crate::draft_state::{
    DraftState, DraftStateRepository, DraftStatesSubscription, DraftSyncState, SendingError,
    UserId,
};

/// Send outcome to report to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageSendingStatus {
    /// Nothing to report.
    #[default]
    None,
    /// A message was sent.
    MessageSent,
    /// A send failed.
    SendMessageError(Option<SendingError>),
    /// Attachments of a draft could not be uploaded.
    UploadAttachmentsError,
}

const fn is_terminal(state: DraftSyncState) -> bool {
    matches!(
        state,
        DraftSyncState::Sent | DraftSyncState::ErrorSending | DraftSyncState::ErrorUploadAttachments
    )
}

/// Derive the status to report from the draft states of a user.
///
/// Only unconfirmed rows count. Send errors take precedence over attachment
/// errors, which take precedence over successful sends.
#[must_use]
pub fn sending_status_for(states: &[DraftState]) -> MessageSendingStatus {
    let mut sent = false;
    let mut attachments_failed = false;
    for state in states.iter().filter(|s| !s.sending_status_confirmed) {
        match state.state {
            DraftSyncState::ErrorSending => {
                return MessageSendingStatus::SendMessageError(state.sending_error.clone());
            }
            DraftSyncState::ErrorUploadAttachments => attachments_failed = true,
            DraftSyncState::Sent => sent = true,
            _ => {}
        }
    }

    if attachments_failed {
        MessageSendingStatus::UploadAttachmentsError
    } else if sent {
        MessageSendingStatus::MessageSent
    } else {
        MessageSendingStatus::None
    }
}

/// Reads and acknowledges send outcomes.
#[derive(Debug, Clone)]
pub struct SendingStatusObserver {
    drafts: DraftStateRepository,
}

impl SendingStatusObserver {
    /// Create an observer over the given repository.
    #[must_use]
    pub const fn new(drafts: DraftStateRepository) -> Self {
        Self { drafts }
    }

    /// Observe the send outcome of a user.
    #[must_use]
    pub fn observe_sending_status(&self, user_id: &UserId) -> SendingStatusSubscription {
        SendingStatusSubscription {
            states: self.drafts.observe_all(user_id),
            last: None,
        }
    }

    /// Mark every reported outcome of a user as seen. Returns how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn confirm_sending_status(&self, user_id: &UserId) -> Result<usize> {
        let pending: Vec<_> = self
            .drafts
            .list_for_user(user_id)
            .await?
            .into_iter()
            .filter(|s| !s.sending_status_confirmed && is_terminal(s.state))
            .collect();

        for state in &pending {
            self.drafts
                .update_sending_confirmed(user_id, &state.message_id, true)
                .await?;
        }

        debug!(%user_id, confirmed = pending.len(), "sending status confirmed");
        Ok(pending.len())
    }
}

/// Subscription to the send outcome of one user.
///
/// Emits only when the derived status changes.
#[derive(Debug)]
pub struct SendingStatusSubscription {
    states: DraftStatesSubscription,
    last: Option<MessageSendingStatus>,
}

impl SendingStatusSubscription {
    /// Next distinct status; the current one on the first call.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn next(&mut self) -> Result<MessageSendingStatus> {
        loop {
            let status = sending_status_for(&self.states.next().await?);
            if self.last.as_ref() != Some(&status) {
                self.last = Some(status.clone());
                return Ok(status);
            }
        }
    }
}
