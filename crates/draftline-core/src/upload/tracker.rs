//! Decides whether a draft needs to be uploaded again.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::Result;
use crate::draft_state::{DraftStateRepository, DraftSyncState, MessageId, UserId};

/// Locally stored content of a draft, as sent to the API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DraftContent {
    /// Subject line.
    pub subject: String,
    /// Sender address.
    pub sender: String,
    /// Primary recipients.
    pub to: Vec<String>,
    /// Carbon copy recipients.
    pub cc: Vec<String>,
    /// Blind carbon copy recipients.
    pub bcc: Vec<String>,
    /// Message body.
    pub body: String,
    /// MIME type of the body.
    pub mime_type: String,
    /// Local attachment ids.
    pub attachment_ids: Vec<String>,
    /// Expiration as a Unix timestamp, if any.
    pub expiration_time: Option<i64>,
}

/// Access to locally stored drafts.
#[async_trait]
pub trait LocalDraftSource: Send + Sync {
    /// Current local content of a draft.
    async fn find_local_draft(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<DraftContent>>;
}

/// Predicate consulted before scheduling an upload.
#[async_trait]
pub trait UploadRequirement: Send + Sync {
    /// Returns true if the draft must be uploaded.
    async fn upload_required(&self, user_id: &UserId, message_id: &MessageId) -> Result<bool>;
}

/// Remembers what was last uploaded for each draft.
#[derive(Clone)]
pub struct DraftUploadTracker {
    drafts: DraftStateRepository,
    source: Arc<dyn LocalDraftSource>,
    last_uploaded: Arc<Mutex<HashMap<MessageId, DraftContent>>>,
}

impl DraftUploadTracker {
    /// Creates a tracker with no upload history.
    #[must_use]
    pub fn new(drafts: DraftStateRepository, source: Arc<dyn LocalDraftSource>) -> Self {
        Self {
            drafts,
            source,
            last_uploaded: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record the content that was just uploaded.
    pub async fn notify_uploaded_draft(&self, message_id: &MessageId, content: DraftContent) {
        self.last_uploaded
            .lock()
            .await
            .insert(message_id.clone(), content);
    }

    /// Drop the upload history of a draft that was sent or discarded.
    pub async fn forget(&self, message_id: &MessageId) {
        self.last_uploaded.lock().await.remove(message_id);
    }

    #[cfg(test)]
    pub(crate) async fn remembers(&self, message_id: &MessageId) -> bool {
        self.last_uploaded.lock().await.contains_key(message_id)
    }
}

#[async_trait]
impl UploadRequirement for DraftUploadTracker {
    async fn upload_required(&self, user_id: &UserId, message_id: &MessageId) -> Result<bool> {
        let synchronized = self
            .drafts
            .get(user_id, message_id)
            .await?
            .is_some_and(|state| state.state == DraftSyncState::Synchronized);
        if !synchronized {
            return Ok(true);
        }

        let Some(local) = self.source.find_local_draft(user_id, message_id).await? else {
            return Ok(true);
        };

        let last_uploaded = self.last_uploaded.lock().await;
        Ok(last_uploaded
            .get(message_id)
            .is_none_or(|uploaded| *uploaded != local))
    }
}
