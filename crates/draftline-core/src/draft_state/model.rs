//! Draft state data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the account owning a draft.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub String);

impl UserId {
    /// Create a new user ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a message.
///
/// Used both for the client-generated local id and for the id assigned by
/// the mail API once the draft has been created remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronization stage of a draft.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DraftSyncState {
    /// Only stored on this device, or edited since the last upload.
    #[default]
    Local,
    /// Remote draft matches the local one.
    Synchronized,
    /// Last draft upload failed.
    ErrorUploadDraft,
    /// Last attachment upload failed.
    ErrorUploadAttachments,
    /// Send requested, waiting to be handed to the send job.
    Queued,
    /// Send job owns the message.
    Sending,
    /// Send job failed.
    ErrorSending,
    /// Message was sent.
    Sent,
}

impl DraftSyncState {
    /// All states, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Local,
        Self::Synchronized,
        Self::ErrorUploadDraft,
        Self::ErrorUploadAttachments,
        Self::Queued,
        Self::Sending,
        Self::ErrorSending,
        Self::Sent,
    ];

    /// States in which the send job has taken over the message.
    ///
    /// A draft-upload completion must never move a message out of these.
    pub const SENDING: [Self; 3] = [Self::Sending, Self::ErrorSending, Self::Sent];

    /// States of messages listed in the outbox.
    pub const OUTBOX: [Self; 3] = [Self::Queued, Self::Sending, Self::ErrorSending];

    /// Parse from database string representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(Self::Local),
            "synchronized" => Some(Self::Synchronized),
            "error_upload_draft" => Some(Self::ErrorUploadDraft),
            "error_upload_attachments" => Some(Self::ErrorUploadAttachments),
            "queued" => Some(Self::Queued),
            "sending" => Some(Self::Sending),
            "error_sending" => Some(Self::ErrorSending),
            "sent" => Some(Self::Sent),
            _ => None,
        }
    }

    /// Convert to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Synchronized => "synchronized",
            Self::ErrorUploadDraft => "error_upload_draft",
            Self::ErrorUploadAttachments => "error_upload_attachments",
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::ErrorSending => "error_sending",
            Self::Sent => "sent",
        }
    }

    /// Returns true if the send job has taken over the message.
    #[must_use]
    pub fn is_sending(self) -> bool {
        Self::SENDING.contains(&self)
    }

    /// Returns true if a message in this state belongs in the outbox.
    #[must_use]
    pub fn is_in_outbox(self) -> bool {
        Self::OUTBOX.contains(&self)
    }
}

impl std::fmt::Display for DraftSyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a draft exists. Fixed when the draft state is first created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DraftAction {
    /// New empty message.
    Compose,
    /// New message addressed to the given recipients.
    ComposeToAddresses(Vec<String>),
    /// Reply to the parent message.
    Reply(MessageId),
    /// Reply to all recipients of the parent message.
    ReplyAll(MessageId),
    /// Forward of the parent message.
    Forward(MessageId),
    /// Draft prefilled from content shared by another application.
    PrefillForShare,
}

impl DraftAction {
    /// Returns the parent message for replies and forwards.
    #[must_use]
    pub const fn parent_message_id(&self) -> Option<&MessageId> {
        match self {
            Self::Reply(id) | Self::ReplyAll(id) | Self::Forward(id) => Some(id),
            Self::Compose | Self::ComposeToAddresses(_) | Self::PrefillForShare => None,
        }
    }
}

/// Last known reason a draft could not be uploaded or sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendingError {
    /// Unclassified failure.
    Other,
    /// The API reports the message was already sent.
    MessageAlreadySent,
    /// Sending to external addresses is disabled for the account.
    ExternalAddressSendDisabled(Option<String>),
    /// Failure with a user-facing message provided by the API.
    GenericLocalized(String),
}

/// Synchronization status of one draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftState {
    /// Owning user.
    pub user_id: UserId,
    /// Local message identifier.
    pub message_id: MessageId,
    /// Identifier assigned by the API after the first successful upload.
    pub api_message_id: Option<MessageId>,
    /// Current synchronization stage.
    pub state: DraftSyncState,
    /// Why the draft exists.
    pub action: DraftAction,
    /// Last recorded upload/send error.
    pub sending_error: Option<SendingError>,
    /// Whether the user acknowledged the last terminal send outcome.
    pub sending_status_confirmed: bool,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl DraftState {
    #[cfg(test)]
    pub(crate) fn new_local(user_id: UserId, message_id: MessageId, action: DraftAction) -> Self {
        Self {
            user_id,
            message_id,
            api_message_id: None,
            state: DraftSyncState::Local,
            action,
            sending_error: None,
            sending_status_confirmed: false,
            updated_at: Utc::now(),
        }
    }
}
