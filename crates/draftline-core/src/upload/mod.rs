//! Draft upload and send orchestration.
//!
//! [`DraftUploader`] decides what to schedule, a [`WorkScheduler`] runs it,
//! and [`DraftJobs`] performs each step against the mail API.

mod jobs;
pub mod scheduler;
mod tracker;
mod uploader;
mod work_queue;

pub use jobs::{DraftJobs, DraftRemote, RemoteError, RemoteErrorKind};
pub use scheduler::{
    ExistingWorkPolicy, JobKind, JobOutcome, JobParams, JobRequest, JobRunner, WorkScheduler,
    WorkState,
};
pub use tracker::{DraftContent, DraftUploadTracker, LocalDraftSource, UploadRequirement};
pub use uploader::{ContinuousUpload, DraftUploader};
pub use work_queue::TokioWorkQueue;
