//! # draftline-core
//!
//! Draft synchronization core for the Draftline mail client.
//!
//! This crate provides:
//! - Draft sync state storage with a guarded state machine (`SQLite`)
//! - Reactive subscriptions over draft states and the outbox
//! - Message label bookkeeping for the drafts, outbox and sent folders
//! - Upload and send orchestration on top of a unique-work scheduler
//! - An in-process tokio work queue and the upload/send jobs
//! - Send outcome reporting

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
pub mod database;
pub mod draft_state;
mod error;
pub mod outbox;
pub mod sending_status;
pub mod upload;

pub use config::Config;
pub use database::Database;
pub use draft_state::{
    DraftAction, DraftState, DraftStateRepository, DraftSyncState, MessageId, Observed,
    SendingError, Transition, UserId,
};
pub use error::{Error, Result};
pub use outbox::{LabelId, MessageLabelRepository, OutboxRepository, SystemLabel};
pub use sending_status::{MessageSendingStatus, SendingStatusObserver};
pub use upload::{
    DraftContent, DraftJobs, DraftRemote, DraftUploadTracker, DraftUploader, ExistingWorkPolicy,
    LocalDraftSource, RemoteError, RemoteErrorKind, TokioWorkQueue, WorkScheduler,
};
