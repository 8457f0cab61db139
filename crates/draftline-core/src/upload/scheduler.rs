//! Background work scheduling contract.
//!
//! Uploads and sends run as named unique work. The policy passed with each
//! request decides what happens when work with the same name already exists.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::draft_state::{MessageId, UserId};

/// Tag carried by the draft upload step of a send chain.
pub const SEND_CHAIN_TAG: &str = "send-chain";

/// Unique work name of the upload chain of a message.
#[must_use]
pub fn upload_work_name(message_id: &MessageId) -> String {
    format!("upload-draft-{message_id}")
}

/// Unique work name of the send chain of a message.
#[must_use]
pub fn send_work_name(message_id: &MessageId) -> String {
    format!("send-message-{message_id}")
}

/// What to do when unique work with the same name already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExistingWorkPolicy {
    /// Drop the new request while unfinished work exists.
    KeepExisting,
    /// Cancel the existing work and run the new request.
    Replace,
    /// Replace work that has not started, run after work that has.
    AppendOrReplace,
}

/// Lifecycle of a unit of unique work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    /// Accepted, not started.
    Enqueued,
    /// Waiting for the work it was appended to.
    Blocked,
    /// A step is executing or waiting to be retried.
    Running,
    /// Every step succeeded.
    Succeeded,
    /// A step failed or ran out of retries.
    Failed,
    /// Cancelled or replaced.
    Cancelled,
}

impl WorkState {
    /// Returns true once the work can no longer make progress.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Returns true if the work has not started executing yet.
    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Enqueued | Self::Blocked)
    }
}

/// Kind of background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Create or update the remote draft.
    UploadDraft,
    /// Upload the attachments of the remote draft.
    UploadAttachments,
    /// Send the remote draft.
    SendMessage,
}

/// Input of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    /// Owning user.
    pub user_id: UserId,
    /// Local message identifier.
    pub message_id: MessageId,
}

/// A job handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// What to run.
    pub kind: JobKind,
    /// Input.
    pub params: JobParams,
    /// Free-form tags.
    pub tags: Vec<String>,
}

impl JobRequest {
    /// Creates a job request without tags.
    #[must_use]
    pub fn new(kind: JobKind, user_id: &UserId, message_id: &MessageId) -> Self {
        Self {
            kind,
            params: JobParams {
                user_id: user_id.clone(),
                message_id: message_id.clone(),
            },
            tags: Vec::new(),
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Returns true if the request carries the tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Result of one run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Done; continue with the next step.
    Success,
    /// Transient failure; run again later.
    Retry,
    /// Permanent failure; abandon the chain.
    Failure,
}

/// Scheduler of named unique work.
#[async_trait]
pub trait WorkScheduler: Send + Sync {
    /// Schedule a single job under `name`.
    async fn enqueue_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        job: JobRequest,
    ) -> Result<()>;

    /// Schedule `first` then `then` under `name`; `then` only runs if `first` succeeds.
    async fn enqueue_chain(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        first: JobRequest,
        then: JobRequest,
    ) -> Result<()>;

    /// Cancel unfinished work under `name`, if any. Best effort.
    async fn cancel_unique_work(&self, name: &str) -> Result<()>;

    /// State of the latest work scheduled under `name`.
    async fn unique_work_state(&self, name: &str) -> Result<Option<WorkState>>;
}

/// Executes jobs on behalf of a scheduler.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run the job once.
    async fn run(&self, job: &JobRequest) -> JobOutcome;

    /// Called when the scheduler gives up retrying the job.
    async fn abandoned(&self, _job: &JobRequest) {}
}
