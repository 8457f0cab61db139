//! In-process [`WorkScheduler`] backed by tokio tasks.
//!
//! Each unique name maps to the latest work scheduled under it. Work runs
//! its steps in order, retrying `Retry` outcomes with exponential backoff.
//! Appended work waits for the running work it follows; a later append
//! supersedes it as long as it has not started.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::scheduler::{
    ExistingWorkPolicy, JobOutcome, JobRequest, JobRunner, WorkScheduler, WorkState,
};
use crate::Result;
use crate::config::RetryConfig;

/// Running work that appended work waits for.
#[derive(Clone)]
struct Predecessor {
    state: watch::Receiver<WorkState>,
    task: AbortHandle,
}

impl Predecessor {
    fn is_finished(&self) -> bool {
        self.state.borrow().is_finished()
    }
}

/// Work currently registered under a unique name.
struct UniqueWork {
    state: Arc<watch::Sender<WorkState>>,
    task: AbortHandle,
    predecessor: Option<Predecessor>,
}

impl UniqueWork {
    fn current(&self) -> WorkState {
        *self.state.borrow()
    }

    fn as_predecessor(&self) -> Predecessor {
        Predecessor {
            state: self.state.subscribe(),
            task: self.task.clone(),
        }
    }

    /// Cancel this work only, and only if it has not started.
    ///
    /// The work it waits for keeps running.
    fn cancel_pending(&self) -> bool {
        let cancelled = self.state.send_if_modified(|state| {
            if state.is_pending() {
                *state = WorkState::Cancelled;
                true
            } else {
                false
            }
        });
        if cancelled {
            self.task.abort();
        }
        cancelled
    }

    /// Cancel this work and the work it waits for.
    fn cancel(&self) {
        if let Some(predecessor) = &self.predecessor {
            predecessor.task.abort();
        }
        self.task.abort();
        self.state.send_if_modified(|state| {
            if state.is_finished() {
                false
            } else {
                *state = WorkState::Cancelled;
                true
            }
        });
    }
}

struct Inner {
    retry: RetryConfig,
    runner: RwLock<Option<Arc<dyn JobRunner>>>,
    works: Mutex<HashMap<String, UniqueWork>>,
}

/// Tokio implementation of [`WorkScheduler`].
#[derive(Clone)]
pub struct TokioWorkQueue {
    inner: Arc<Inner>,
}

impl TokioWorkQueue {
    /// Creates an empty queue. Jobs fail until a runner is installed.
    #[must_use]
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                retry,
                runner: RwLock::new(None),
                works: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Install the runner executing jobs.
    pub async fn set_runner(&self, runner: Arc<dyn JobRunner>) {
        *self.inner.runner.write().await = Some(runner);
    }

    /// Cancel all unfinished work and drop the runner.
    pub async fn shutdown(&self) {
        let works = self.inner.works.lock().await;
        for work in works.values().filter(|w| !w.current().is_finished()) {
            work.cancel();
        }
        drop(works);
        *self.inner.runner.write().await = None;
    }

    /// Wait until the work under `name` is finished and return its final state.
    ///
    /// Returns `None` if no work is registered under `name`. Finished work
    /// is forgotten the next time any work is scheduled.
    pub async fn wait_until_finished(&self, name: &str) -> Option<WorkState> {
        let mut rx = {
            let works = self.inner.works.lock().await;
            works.get(name)?.state.subscribe()
        };
        let finished = rx.wait_for(|state| state.is_finished()).await.ok()?;
        Some(*finished)
    }

    async fn schedule(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        steps: Vec<JobRequest>,
    ) -> Result<()> {
        let mut works = self.inner.works.lock().await;
        works.retain(|_, work| !work.current().is_finished());

        let mut predecessor = None;
        if let Some(existing) = works.get(name) {
            let state = existing.current();
            match policy {
                ExistingWorkPolicy::KeepExisting => {
                    debug!(name, ?state, "keeping existing work");
                    return Ok(());
                }
                ExistingWorkPolicy::Replace => {
                    debug!(name, ?state, "replacing existing work");
                    existing.cancel();
                }
                ExistingWorkPolicy::AppendOrReplace if existing.cancel_pending() => {
                    debug!(name, ?state, "superseding queued work");
                    predecessor = existing
                        .predecessor
                        .clone()
                        .filter(|p| !p.is_finished());
                }
                ExistingWorkPolicy::AppendOrReplace => {
                    debug!(name, "appending to running work");
                    predecessor = Some(existing.as_predecessor());
                }
            }
        }

        let initial = if predecessor.is_some() {
            WorkState::Blocked
        } else {
            WorkState::Enqueued
        };
        let state = Arc::new(watch::Sender::new(initial));
        let handle = tokio::spawn(run_work(
            self.inner.clone(),
            name.to_string(),
            state.clone(),
            predecessor.as_ref().map(|p| p.state.clone()),
            steps,
        ));

        works.insert(
            name.to_string(),
            UniqueWork {
                state,
                task: handle.abort_handle(),
                predecessor,
            },
        );
        Ok(())
    }
}

async fn run_work(
    inner: Arc<Inner>,
    name: String,
    state: Arc<watch::Sender<WorkState>>,
    predecessor: Option<watch::Receiver<WorkState>>,
    steps: Vec<JobRequest>,
) {
    if let Some(mut predecessor) = predecessor {
        // Outcome of the predecessor does not matter, only that it is over.
        let _ = predecessor.wait_for(|s| s.is_finished()).await;
    }

    // Superseding work may have cancelled this one while it was queued.
    let started = state.send_if_modified(|s| {
        if s.is_pending() {
            *s = WorkState::Running;
            true
        } else {
            false
        }
    });
    if !started {
        return;
    }

    let outcome = run_steps(&inner, &name, &steps).await;
    info!(name, ?outcome, "work finished");
    state.send_replace(outcome);
}

async fn run_steps(inner: &Inner, name: &str, steps: &[JobRequest]) -> WorkState {
    let Some(runner) = inner.runner.read().await.clone() else {
        error!(name, "no job runner installed");
        return WorkState::Failed;
    };

    for step in steps {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match runner.run(step).await {
                JobOutcome::Success => break,
                JobOutcome::Failure => return WorkState::Failed,
                JobOutcome::Retry if attempt >= inner.retry.max_attempts => {
                    warn!(name, kind = ?step.kind, attempt, "giving up after retries");
                    runner.abandoned(step).await;
                    return WorkState::Failed;
                }
                JobOutcome::Retry => {
                    let delay = inner.retry.backoff(attempt);
                    debug!(name, kind = ?step.kind, attempt, ?delay, "retrying job");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    WorkState::Succeeded
}

#[async_trait]
impl WorkScheduler for TokioWorkQueue {
    async fn enqueue_unique_work(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        job: JobRequest,
    ) -> Result<()> {
        self.schedule(name, policy, vec![job]).await
    }

    async fn enqueue_chain(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        first: JobRequest,
        then: JobRequest,
    ) -> Result<()> {
        self.schedule(name, policy, vec![first, then]).await
    }

    async fn cancel_unique_work(&self, name: &str) -> Result<()> {
        let works = self.inner.works.lock().await;
        if let Some(work) = works.get(name).filter(|w| !w.current().is_finished()) {
            debug!(name, "cancelling work");
            work.cancel();
        }
        Ok(())
    }

    async fn unique_work_state(&self, name: &str) -> Result<Option<WorkState>> {
        let works = self.inner.works.lock().await;
        Ok(works.get(name).map(UniqueWork::current))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use super::*;
    use crate::draft_state::{MessageId, UserId};
    use crate::upload::scheduler::JobKind;

    /// Replays scripted outcomes per job kind and records every run.
    #[derive(Default)]
    struct ScriptedRunner {
        outcomes: Mutex<HashMap<JobKind, VecDeque<JobOutcome>>>,
        runs: Mutex<Vec<JobKind>>,
        completed: Mutex<Vec<JobKind>>,
        abandoned: Mutex<Vec<JobKind>>,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl ScriptedRunner {
        async fn script(&self, kind: JobKind, outcomes: &[JobOutcome]) {
            self.outcomes
                .lock()
                .await
                .insert(kind, outcomes.iter().copied().collect());
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run(&self, job: &JobRequest) -> JobOutcome {
            self.runs.lock().await.push(job.kind);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.completed.lock().await.push(job.kind);
            self.outcomes
                .lock()
                .await
                .get_mut(&job.kind)
                .and_then(VecDeque::pop_front)
                .unwrap_or(JobOutcome::Success)
        }

        async fn abandoned(&self, job: &JobRequest) {
            self.abandoned.lock().await.push(job.kind);
        }
    }

    fn job(kind: JobKind) -> JobRequest {
        JobRequest::new(kind, &UserId::new("user"), &MessageId::new("local"))
    }

    fn retry_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
        }
    }

    async fn queue_with(runner: Arc<ScriptedRunner>) -> TokioWorkQueue {
        let queue = TokioWorkQueue::new(retry_config());
        queue.set_runner(runner).await;
        queue
    }

    #[tokio::test(start_paused = true)]
    async fn test_chain_runs_in_order() {
        let runner = Arc::new(ScriptedRunner::default());
        let queue = queue_with(runner.clone()).await;

        queue
            .enqueue_chain(
                "w",
                ExistingWorkPolicy::AppendOrReplace,
                job(JobKind::UploadDraft),
                job(JobKind::UploadAttachments),
            )
            .await
            .unwrap();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(
            *runner.runs.lock().await,
            vec![JobKind::UploadDraft, JobKind::UploadAttachments]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_stops_chain() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .script(JobKind::UploadDraft, &[JobOutcome::Failure])
            .await;
        let queue = queue_with(runner.clone()).await;

        queue
            .enqueue_chain(
                "w",
                ExistingWorkPolicy::AppendOrReplace,
                job(JobKind::UploadDraft),
                job(JobKind::SendMessage),
            )
            .await
            .unwrap();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Failed));
        assert_eq!(*runner.runs.lock().await, vec![JobKind::UploadDraft]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .script(JobKind::UploadDraft, &[JobOutcome::Retry, JobOutcome::Retry])
            .await;
        let queue = queue_with(runner.clone()).await;

        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
            .await
            .unwrap();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(runner.runs.lock().await.len(), 3);
        assert!(runner.abandoned.lock().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_abandons_job() {
        let runner = Arc::new(ScriptedRunner::default());
        runner
            .script(JobKind::SendMessage, &[JobOutcome::Retry; 5])
            .await;
        let queue = queue_with(runner.clone()).await;

        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::KeepExisting, job(JobKind::SendMessage))
            .await
            .unwrap();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Failed));
        assert_eq!(runner.runs.lock().await.len(), 3);
        assert_eq!(*runner.abandoned.lock().await, vec![JobKind::SendMessage]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_existing_ignores_duplicate() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let runner = Arc::new(ScriptedRunner {
            gate: Some(gate.clone()),
            ..ScriptedRunner::default()
        });
        let queue = queue_with(runner.clone()).await;

        for _ in 0..2 {
            queue
                .enqueue_unique_work("w", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
                .await
                .unwrap();
        }
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(runner.runs.lock().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_runs_after_running_work() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let runner = Arc::new(ScriptedRunner {
            gate: Some(gate.clone()),
            ..ScriptedRunner::default()
        });
        let queue = queue_with(runner.clone()).await;

        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
            .await
            .unwrap();
        // Let the first job start and block on the gate.
        tokio::task::yield_now().await;
        assert_eq!(
            queue.unique_work_state("w").await.unwrap(),
            Some(WorkState::Running)
        );

        queue
            .enqueue_unique_work(
                "w",
                ExistingWorkPolicy::AppendOrReplace,
                job(JobKind::UploadAttachments),
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(
            queue.unique_work_state("w").await.unwrap(),
            Some(WorkState::Blocked)
        );

        gate.notify_one();
        tokio::task::yield_now().await;
        gate.notify_one();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(
            *runner.runs.lock().await,
            vec![JobKind::UploadDraft, JobKind::UploadAttachments]
        );
    }

    async fn gated_queue() -> (TokioWorkQueue, Arc<ScriptedRunner>, Arc<tokio::sync::Notify>) {
        let gate = Arc::new(tokio::sync::Notify::new());
        let runner = Arc::new(ScriptedRunner {
            gate: Some(gate.clone()),
            ..ScriptedRunner::default()
        });
        (queue_with(runner.clone()).await, runner, gate)
    }

    async fn append(queue: &TokioWorkQueue, kind: JobKind) {
        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::AppendOrReplace, job(kind))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_appends_keep_running_work() {
        let (queue, runner, gate) = gated_queue().await;

        append(&queue, JobKind::UploadDraft).await;
        tokio::task::yield_now().await;
        assert_eq!(
            queue.unique_work_state("w").await.unwrap(),
            Some(WorkState::Running)
        );

        append(&queue, JobKind::UploadAttachments).await;
        append(&queue, JobKind::SendMessage).await;
        assert_eq!(
            queue.unique_work_state("w").await.unwrap(),
            Some(WorkState::Blocked)
        );

        // Release the running upload, then the work that follows it.
        gate.notify_one();
        gate.notify_one();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(
            *runner.runs.lock().await,
            vec![JobKind::UploadDraft, JobKind::SendMessage]
        );
        assert_eq!(
            *runner.completed.lock().await,
            vec![JobKind::UploadDraft, JobKind::SendMessage]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_supersedes_blocked_work() {
        let (queue, runner, gate) = gated_queue().await;

        append(&queue, JobKind::UploadDraft).await;
        tokio::task::yield_now().await;
        append(&queue, JobKind::UploadAttachments).await;
        // The appended work is now waiting on the running upload.
        tokio::task::yield_now().await;
        assert_eq!(
            queue.unique_work_state("w").await.unwrap(),
            Some(WorkState::Blocked)
        );

        append(&queue, JobKind::SendMessage).await;
        gate.notify_one();
        gate.notify_one();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert!(!runner.runs.lock().await.contains(&JobKind::UploadAttachments));
        assert_eq!(
            *runner.completed.lock().await,
            vec![JobKind::UploadDraft, JobKind::SendMessage]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_or_replace_supersedes_enqueued_work() {
        let (queue, runner, gate) = gated_queue().await;

        // Neither request has started yet.
        append(&queue, JobKind::UploadDraft).await;
        append(&queue, JobKind::UploadAttachments).await;
        gate.notify_one();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Succeeded));
        assert_eq!(*runner.runs.lock().await, vec![JobKind::UploadAttachments]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_work_is_pruned() {
        let runner = Arc::new(ScriptedRunner::default());
        let queue = queue_with(runner).await;

        queue
            .enqueue_unique_work("a", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
            .await
            .unwrap();
        assert_eq!(queue.wait_until_finished("a").await, Some(WorkState::Succeeded));

        queue
            .enqueue_unique_work("b", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
            .await
            .unwrap();
        assert_eq!(queue.unique_work_state("a").await.unwrap(), None);
        assert_eq!(queue.wait_until_finished("b").await, Some(WorkState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_marks_cancelled() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let runner = Arc::new(ScriptedRunner {
            gate: Some(gate),
            ..ScriptedRunner::default()
        });
        let queue = queue_with(runner).await;

        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::KeepExisting, job(JobKind::UploadDraft))
            .await
            .unwrap();
        queue.cancel_unique_work("w").await.unwrap();
        queue.cancel_unique_work("never-scheduled").await.unwrap();

        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Cancelled));
        assert_eq!(queue.wait_until_finished("never-scheduled").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_runner_fails_work() {
        let queue = TokioWorkQueue::new(retry_config());
        queue
            .enqueue_unique_work("w", ExistingWorkPolicy::Replace, job(JobKind::UploadDraft))
            .await
            .unwrap();
        assert_eq!(queue.wait_until_finished("w").await, Some(WorkState::Failed));
    }
}
