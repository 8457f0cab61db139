//! Entry points that schedule draft uploads and sends.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::scheduler::{
    ExistingWorkPolicy, JobKind, JobRequest, SEND_CHAIN_TAG, WorkScheduler, send_work_name,
    upload_work_name,
};
use super::tracker::UploadRequirement;
use crate::Result;
use crate::config::UploadConfig;
use crate::draft_state::{DraftStateRepository, DraftSyncState, MessageId, Transition, UserId};

/// Schedules upload and send work for drafts.
#[derive(Clone)]
pub struct DraftUploader {
    scheduler: Arc<dyn WorkScheduler>,
    requirement: Arc<dyn UploadRequirement>,
    drafts: DraftStateRepository,
    config: UploadConfig,
}

impl DraftUploader {
    /// Creates an uploader.
    #[must_use]
    pub fn new(
        scheduler: Arc<dyn WorkScheduler>,
        requirement: Arc<dyn UploadRequirement>,
        drafts: DraftStateRepository,
        config: UploadConfig,
    ) -> Self {
        Self {
            scheduler,
            requirement,
            drafts,
            config,
        }
    }

    /// Schedule an upload unless none is needed or one is already outstanding.
    ///
    /// # Errors
    ///
    /// Returns an error if the requirement check or the scheduler fails.
    pub async fn ensure_uploaded(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        if !self.requirement.upload_required(user_id, message_id).await? {
            debug!(%user_id, %message_id, "draft up to date, skipping upload");
            return Ok(());
        }

        let name = upload_work_name(message_id);
        if let Some(state) = self
            .scheduler
            .unique_work_state(&name)
            .await?
            .filter(|state| !state.is_finished())
        {
            debug!(%user_id, %message_id, ?state, "upload already scheduled");
            return Ok(());
        }

        debug!(%user_id, %message_id, "scheduling draft upload");
        self.scheduler
            .enqueue_unique_work(
                &name,
                ExistingWorkPolicy::KeepExisting,
                JobRequest::new(JobKind::UploadDraft, user_id, message_id),
            )
            .await
    }

    /// Upload the draft and its attachments, after any upload in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler fails.
    pub async fn force_upload(&self, user_id: &UserId, message_id: &MessageId) -> Result<()> {
        debug!(%user_id, %message_id, "scheduling forced upload");
        self.scheduler
            .enqueue_chain(
                &upload_work_name(message_id),
                ExistingWorkPolicy::AppendOrReplace,
                JobRequest::new(JobKind::UploadDraft, user_id, message_id),
                JobRequest::new(JobKind::UploadAttachments, user_id, message_id),
            )
            .await
    }

    /// Cancel the pending upload of a draft, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler fails.
    pub async fn cancel_upload(&self, message_id: &MessageId) -> Result<()> {
        debug!(%message_id, "cancelling draft upload");
        self.scheduler
            .cancel_unique_work(&upload_work_name(message_id))
            .await
    }

    /// Mark the draft as sending and schedule the final upload and the send.
    ///
    /// The send is scheduled even if the guard refuses the `Sending` state;
    /// the returned transition tells the caller what was stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the draft state does not exist, the store fails,
    /// or the scheduler fails.
    pub async fn send(&self, user_id: &UserId, message_id: &MessageId) -> Result<Transition> {
        let transition = self
            .drafts
            .update_sync_state(user_id, message_id, DraftSyncState::Sending, None)
            .await?;
        if !transition.is_applied() {
            warn!(%user_id, %message_id, ?transition, "send requested in unexpected state");
        }

        info!(%user_id, %message_id, "scheduling send");
        self.scheduler
            .enqueue_chain(
                &send_work_name(message_id),
                ExistingWorkPolicy::AppendOrReplace,
                JobRequest::new(JobKind::UploadDraft, user_id, message_id)
                    .with_tag(SEND_CHAIN_TAG),
                JobRequest::new(JobKind::SendMessage, user_id, message_id),
            )
            .await?;

        Ok(transition)
    }

    /// Periodically call [`Self::ensure_uploaded`] until the handle is stopped or dropped.
    #[must_use]
    pub fn start_continuous_upload(
        &self,
        user_id: &UserId,
        message_id: &MessageId,
    ) -> ContinuousUpload {
        let uploader = self.clone();
        let user_id = user_id.clone();
        let message_id = message_id.clone();
        let period = self
            .config
            .continuous_upload_interval
            .max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = uploader.ensure_uploaded(&user_id, &message_id).await {
                    warn!(%user_id, %message_id, error = %e, "continuous upload check failed");
                }
            }
        });

        ContinuousUpload { task }
    }
}

/// Handle of a continuous upload loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct ContinuousUpload {
    task: JoinHandle<()>,
}

impl ContinuousUpload {
    /// Stop the loop.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for ContinuousUpload {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;
    use crate::database::Database;
    use crate::draft_state::DraftAction;
    use crate::upload::scheduler::WorkState;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Unique(String, ExistingWorkPolicy, JobRequest),
        Chain(String, ExistingWorkPolicy, JobRequest, JobRequest),
        Cancel(String),
    }

    /// Records calls; scheduled work stays enqueued until cleared.
    #[derive(Default)]
    struct RecordingScheduler {
        calls: Mutex<Vec<Call>>,
        states: Mutex<HashMap<String, WorkState>>,
    }

    #[async_trait]
    impl WorkScheduler for RecordingScheduler {
        async fn enqueue_unique_work(
            &self,
            name: &str,
            policy: ExistingWorkPolicy,
            job: JobRequest,
        ) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(Call::Unique(name.to_string(), policy, job));
            self.states
                .lock()
                .await
                .insert(name.to_string(), WorkState::Enqueued);
            Ok(())
        }

        async fn enqueue_chain(
            &self,
            name: &str,
            policy: ExistingWorkPolicy,
            first: JobRequest,
            then: JobRequest,
        ) -> Result<()> {
            self.calls
                .lock()
                .await
                .push(Call::Chain(name.to_string(), policy, first, then));
            Ok(())
        }

        async fn cancel_unique_work(&self, name: &str) -> Result<()> {
            self.calls.lock().await.push(Call::Cancel(name.to_string()));
            Ok(())
        }

        async fn unique_work_state(&self, name: &str) -> Result<Option<WorkState>> {
            Ok(self.states.lock().await.get(name).copied())
        }
    }

    struct Always(AtomicBool, AtomicUsize);

    #[async_trait]
    impl UploadRequirement for Always {
        async fn upload_required(&self, _: &UserId, _: &MessageId) -> Result<bool> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    struct Fixture {
        uploader: DraftUploader,
        scheduler: Arc<RecordingScheduler>,
        requirement: Arc<Always>,
        drafts: DraftStateRepository,
        user: UserId,
        message: MessageId,
    }

    async fn fixture(required: bool) -> Fixture {
        let drafts = DraftStateRepository::new(Database::in_memory().await.unwrap());
        let scheduler = Arc::new(RecordingScheduler::default());
        let requirement = Arc::new(Always(AtomicBool::new(required), AtomicUsize::new(0)));
        let uploader = DraftUploader::new(
            scheduler.clone(),
            requirement.clone(),
            drafts.clone(),
            UploadConfig {
                continuous_upload_interval: Duration::from_secs(1),
            },
        );
        Fixture {
            uploader,
            scheduler,
            requirement,
            drafts,
            user: UserId::new("user"),
            message: MessageId::new("local"),
        }
    }

    #[tokio::test]
    async fn test_ensure_uploaded_enqueues_once() {
        let f = fixture(true).await;

        f.uploader.ensure_uploaded(&f.user, &f.message).await.unwrap();
        f.uploader.ensure_uploaded(&f.user, &f.message).await.unwrap();

        let calls = f.scheduler.calls.lock().await;
        assert_eq!(
            *calls,
            vec![Call::Unique(
                "upload-draft-local".to_string(),
                ExistingWorkPolicy::KeepExisting,
                JobRequest::new(JobKind::UploadDraft, &f.user, &f.message),
            )]
        );
    }

    #[tokio::test]
    async fn test_ensure_uploaded_after_finished_work() {
        let f = fixture(true).await;
        f.scheduler
            .states
            .lock()
            .await
            .insert("upload-draft-local".to_string(), WorkState::Succeeded);

        f.uploader.ensure_uploaded(&f.user, &f.message).await.unwrap();
        assert_eq!(f.scheduler.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_ensure_uploaded_skips_when_not_required() {
        let f = fixture(false).await;
        f.uploader.ensure_uploaded(&f.user, &f.message).await.unwrap();
        assert!(f.scheduler.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_force_upload_appends_chain() {
        let f = fixture(false).await;
        f.uploader.force_upload(&f.user, &f.message).await.unwrap();

        let calls = f.scheduler.calls.lock().await;
        assert_eq!(
            *calls,
            vec![Call::Chain(
                "upload-draft-local".to_string(),
                ExistingWorkPolicy::AppendOrReplace,
                JobRequest::new(JobKind::UploadDraft, &f.user, &f.message),
                JobRequest::new(JobKind::UploadAttachments, &f.user, &f.message),
            )]
        );
    }

    #[tokio::test]
    async fn test_cancel_upload() {
        let f = fixture(true).await;
        f.uploader.cancel_upload(&f.message).await.unwrap();
        assert_eq!(
            *f.scheduler.calls.lock().await,
            vec![Call::Cancel("upload-draft-local".to_string())]
        );
    }

    #[tokio::test]
    async fn test_send_marks_sending_and_schedules_chain() {
        let f = fixture(true).await;
        f.drafts
            .create_or_update_local_state(&f.user, &f.message, &DraftAction::Compose)
            .await
            .unwrap();

        let transition = f.uploader.send(&f.user, &f.message).await.unwrap();
        assert_eq!(transition, Transition::Applied(DraftSyncState::Sending));

        let stored = f.drafts.get(&f.user, &f.message).await.unwrap().unwrap();
        assert_eq!(stored.state, DraftSyncState::Sending);

        let calls = f.scheduler.calls.lock().await;
        let [Call::Chain(name, policy, first, then)] = calls.as_slice() else {
            panic!("expected one chain, got {calls:?}");
        };
        assert_eq!(name, "send-message-local");
        assert_eq!(*policy, ExistingWorkPolicy::AppendOrReplace);
        assert_eq!(first.kind, JobKind::UploadDraft);
        assert!(first.has_tag(SEND_CHAIN_TAG));
        assert_eq!(then.kind, JobKind::SendMessage);
    }

    #[tokio::test]
    async fn test_send_unknown_draft_fails() {
        let f = fixture(true).await;
        assert!(f.uploader.send(&f.user, &f.message).await.is_err());
        assert!(f.scheduler.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_continuous_upload_ticks_until_stopped() {
        let f = fixture(false).await;
        tokio::time::pause();
        let handle = f.uploader.start_continuous_upload(&f.user, &f.message);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let checks = f.requirement.1.load(Ordering::SeqCst);
        assert_eq!(checks, 3);

        handle.stop();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.requirement.1.load(Ordering::SeqCst), checks);
    }
}
