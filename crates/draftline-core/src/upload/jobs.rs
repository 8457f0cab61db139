//! Upload and send jobs.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::scheduler::{
    JobKind, JobOutcome, JobRequest, JobRunner, SEND_CHAIN_TAG, WorkScheduler, WorkState,
    upload_work_name,
};
use super::tracker::{DraftContent, DraftUploadTracker, LocalDraftSource};
use crate::draft_state::{DraftStateRepository, DraftSyncState, MessageId, SendingError, UserId};
use crate::outbox::MessageLabelRepository;
use crate::{Error, Result};

/// Category of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection or timeout problem.
    Network,
    /// The message had already been sent.
    MessageAlreadySent,
    /// The account may not send to external addresses.
    ExternalAddressSendDisabled,
    /// The API rejected the request.
    Api,
    /// Anything else.
    Other,
}

/// Failure reported by the mail API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("remote {kind:?} error{}", .api_message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct RemoteError {
    /// Category.
    pub kind: RemoteErrorKind,
    /// Whether trying again later may succeed.
    pub retryable: bool,
    /// User-facing message provided by the API.
    pub api_message: Option<String>,
}

impl RemoteError {
    /// Creates an error without an API message.
    #[must_use]
    pub const fn new(kind: RemoteErrorKind, retryable: bool) -> Self {
        Self {
            kind,
            retryable,
            api_message: None,
        }
    }

    /// Attaches the user-facing message returned by the API.
    #[must_use]
    pub fn with_api_message(mut self, message: impl Into<String>) -> Self {
        self.api_message = Some(message.into());
        self
    }

    /// Error descriptor stored for a failed upload.
    #[must_use]
    pub fn upload_error(&self) -> Option<SendingError> {
        match self.kind {
            RemoteErrorKind::MessageAlreadySent => Some(SendingError::MessageAlreadySent),
            RemoteErrorKind::ExternalAddressSendDisabled => Some(
                SendingError::ExternalAddressSendDisabled(self.api_message.clone()),
            ),
            _ => self.api_message.clone().map(SendingError::GenericLocalized),
        }
    }

    /// Error descriptor stored for a failed send.
    #[must_use]
    pub fn send_error(&self) -> SendingError {
        self.upload_error().unwrap_or(SendingError::Other)
    }
}

/// Mail API operations used by the jobs.
#[async_trait]
pub trait DraftRemote: Send + Sync {
    /// Create the remote draft, or update it when `api_message_id` is known.
    ///
    /// Returns the API id of the draft.
    async fn upload_draft(
        &self,
        user_id: &UserId,
        api_message_id: Option<&MessageId>,
        content: &DraftContent,
    ) -> std::result::Result<MessageId, RemoteError>;

    /// Upload the pending attachments of a remote draft.
    async fn upload_attachments(
        &self,
        user_id: &UserId,
        api_message_id: &MessageId,
    ) -> std::result::Result<(), RemoteError>;

    /// Send a remote draft.
    async fn send_message(
        &self,
        user_id: &UserId,
        api_message_id: &MessageId,
    ) -> std::result::Result<(), RemoteError>;
}

/// [`JobRunner`] executing draft uploads and sends.
///
/// Holding the scheduler while being installed as its runner forms a cycle;
/// shut the scheduler down to release both.
#[derive(Clone)]
pub struct DraftJobs {
    remote: Arc<dyn DraftRemote>,
    source: Arc<dyn LocalDraftSource>,
    tracker: DraftUploadTracker,
    drafts: DraftStateRepository,
    labels: MessageLabelRepository,
    scheduler: Arc<dyn WorkScheduler>,
}

impl DraftJobs {
    /// Creates the job runner.
    #[must_use]
    pub fn new(
        remote: Arc<dyn DraftRemote>,
        source: Arc<dyn LocalDraftSource>,
        tracker: DraftUploadTracker,
        drafts: DraftStateRepository,
        labels: MessageLabelRepository,
        scheduler: Arc<dyn WorkScheduler>,
    ) -> Self {
        Self {
            remote,
            source,
            tracker,
            drafts,
            labels,
            scheduler,
        }
    }

    async fn upload_draft(&self, job: &JobRequest) -> Result<JobOutcome> {
        let user_id = &job.params.user_id;
        let message_id = &job.params.message_id;

        if job.has_tag(SEND_CHAIN_TAG) {
            // The send chain must not race a plain upload of the same draft.
            let name = upload_work_name(message_id);
            match self.scheduler.unique_work_state(&name).await? {
                Some(state) if state.is_pending() => {
                    debug!(%user_id, %message_id, "cancelling pending upload before send");
                    self.scheduler.cancel_unique_work(&name).await?;
                    return Ok(JobOutcome::Retry);
                }
                Some(WorkState::Running) => {
                    debug!(%user_id, %message_id, "upload running, retrying send upload later");
                    return Ok(JobOutcome::Retry);
                }
                _ => {}
            }
        }

        let Some(state) = self.drafts.get(user_id, message_id).await? else {
            warn!(%user_id, %message_id, "no draft state, abandoning upload");
            return Ok(JobOutcome::Failure);
        };
        let Some(content) = self.source.find_local_draft(user_id, message_id).await? else {
            warn!(%user_id, %message_id, "no local draft, abandoning upload");
            return Ok(JobOutcome::Failure);
        };

        match self
            .remote
            .upload_draft(user_id, state.api_message_id.as_ref(), &content)
            .await
        {
            Ok(api_message_id) => {
                self.drafts
                    .update_api_message_id_and_mark_synchronized(user_id, message_id, &api_message_id)
                    .await?;
                self.tracker.notify_uploaded_draft(message_id, content).await;
                info!(%user_id, %message_id, %api_message_id, "draft uploaded");
                Ok(JobOutcome::Success)
            }
            Err(e) if e.retryable => {
                info!(%user_id, %message_id, error = %e, "draft upload failed, will retry");
                Ok(JobOutcome::Retry)
            }
            Err(e) => {
                info!(%user_id, %message_id, error = %e, "draft upload failed");
                self.record_failure(user_id, message_id, DraftSyncState::ErrorUploadDraft, e.upload_error())
                    .await?;
                Ok(JobOutcome::Failure)
            }
        }
    }

    async fn upload_attachments(&self, job: &JobRequest) -> Result<JobOutcome> {
        let user_id = &job.params.user_id;
        let message_id = &job.params.message_id;

        let Some(api_message_id) = self.api_message_id(user_id, message_id).await? else {
            warn!(%user_id, %message_id, "draft not uploaded yet, cannot upload attachments");
            self.record_failure(user_id, message_id, DraftSyncState::ErrorUploadAttachments, None)
                .await?;
            return Ok(JobOutcome::Failure);
        };

        match self.remote.upload_attachments(user_id, &api_message_id).await {
            Ok(()) => {
                info!(%user_id, %message_id, "attachments uploaded");
                Ok(JobOutcome::Success)
            }
            Err(e) if e.retryable => Ok(JobOutcome::Retry),
            Err(e) => {
                info!(%user_id, %message_id, error = %e, "attachment upload failed");
                self.record_failure(
                    user_id,
                    message_id,
                    DraftSyncState::ErrorUploadAttachments,
                    e.upload_error(),
                )
                .await?;
                Ok(JobOutcome::Failure)
            }
        }
    }

    async fn send_message(&self, job: &JobRequest) -> Result<JobOutcome> {
        let user_id = &job.params.user_id;
        let message_id = &job.params.message_id;

        let Some(state) = self.drafts.get(user_id, message_id).await? else {
            warn!(%user_id, %message_id, "no draft state, abandoning send");
            return Ok(JobOutcome::Failure);
        };
        match state.state {
            DraftSyncState::Sending => {}
            DraftSyncState::Sent => {
                debug!(%user_id, %message_id, "message already sent");
                return Ok(JobOutcome::Success);
            }
            other => {
                warn!(%user_id, %message_id, state = %other, "draft no longer being sent, dropping send");
                return Ok(JobOutcome::Failure);
            }
        }

        let Some(api_message_id) = state.api_message_id else {
            warn!(%user_id, %message_id, "draft not uploaded yet, cannot send");
            self.record_failure(
                user_id,
                message_id,
                DraftSyncState::ErrorSending,
                Some(SendingError::Other),
            )
            .await?;
            return Ok(JobOutcome::Failure);
        };

        self.labels.move_to_outbox(user_id, &api_message_id).await?;

        match self.remote.send_message(user_id, &api_message_id).await {
            Ok(()) => {
                self.drafts
                    .update_sync_state(user_id, message_id, DraftSyncState::Sent, None)
                    .await?;
                self.labels.move_to_sent(user_id, &api_message_id).await?;
                self.tracker.forget(message_id).await;
                info!(%user_id, %message_id, %api_message_id, "message sent");
                Ok(JobOutcome::Success)
            }
            Err(e) if e.retryable => {
                info!(%user_id, %message_id, error = %e, "send failed, will retry");
                Ok(JobOutcome::Retry)
            }
            Err(e) => {
                info!(%user_id, %message_id, error = %e, "send failed");
                self.record_failure(
                    user_id,
                    message_id,
                    DraftSyncState::ErrorSending,
                    Some(e.send_error()),
                )
                .await?;
                Ok(JobOutcome::Failure)
            }
        }
    }

    async fn api_message_id(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> Result<Option<MessageId>> {
        Ok(self
            .drafts
            .get(user_id, message_id)
            .await?
            .and_then(|state| state.api_message_id))
    }

    /// Store a job failure according to where the draft is in its lifecycle.
    ///
    /// A draft being sent turns into `ErrorSending` whatever step failed.
    /// Errors arriving after the message was sent are stale and ignored.
    /// Whenever the draft ends up in `ErrorSending` it goes back to the
    /// drafts folders, so a failed send never stays in the outbox.
    async fn record_failure(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
        error_state: DraftSyncState,
        sending_error: Option<SendingError>,
    ) -> Result<()> {
        let Some(current) = self.drafts.get(user_id, message_id).await? else {
            return Ok(());
        };

        let (state, sending_error) = match current.state {
            DraftSyncState::Sent => {
                debug!(%user_id, %message_id, %error_state, "message already sent, ignoring error");
                return Ok(());
            }
            DraftSyncState::Sending => (
                DraftSyncState::ErrorSending,
                Some(sending_error.unwrap_or(SendingError::Other)),
            ),
            _ => (error_state, sending_error),
        };

        let transition = self
            .drafts
            .update_sync_state(user_id, message_id, state, sending_error.as_ref())
            .await?;
        if transition.resulting_state() == DraftSyncState::ErrorSending {
            if let Some(api_message_id) = &current.api_message_id {
                self.labels.move_to_drafts(user_id, api_message_id).await?;
            }
        }
        Ok(())
    }
}

const fn error_state_for(kind: JobKind) -> DraftSyncState {
    match kind {
        JobKind::UploadDraft => DraftSyncState::ErrorUploadDraft,
        JobKind::UploadAttachments => DraftSyncState::ErrorUploadAttachments,
        JobKind::SendMessage => DraftSyncState::ErrorSending,
    }
}

#[async_trait]
impl JobRunner for DraftJobs {
    async fn run(&self, job: &JobRequest) -> JobOutcome {
        let params = &job.params;
        if params.user_id.as_str().is_empty() || params.message_id.as_str().is_empty() {
            error!(kind = ?job.kind, "job without user or message id");
            return JobOutcome::Failure;
        }

        let result = match job.kind {
            JobKind::UploadDraft => self.upload_draft(job).await,
            JobKind::UploadAttachments => self.upload_attachments(job).await,
            JobKind::SendMessage => self.send_message(job).await,
        };

        result.unwrap_or_else(|e| {
            error!(
                user_id = %params.user_id,
                message_id = %params.message_id,
                kind = ?job.kind,
                error = %e,
                "job failed locally"
            );
            if matches!(e, Error::Contention { .. }) {
                JobOutcome::Retry
            } else {
                JobOutcome::Failure
            }
        })
    }

    async fn abandoned(&self, job: &JobRequest) {
        let params = &job.params;
        let sending_error = (job.kind == JobKind::SendMessage).then_some(SendingError::Other);
        if let Err(e) = self
            .record_failure(
                &params.user_id,
                &params.message_id,
                error_state_for(job.kind),
                sending_error,
            )
            .await
        {
            error!(
                user_id = %params.user_id,
                message_id = %params.message_id,
                error = %e,
                "failed to record abandoned job"
            );
        }
    }
}
