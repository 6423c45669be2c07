//! The shared stage-execution skeleton.
//!
//! Every task goes through the same steps: load the job, check the stage's
//! expected pre-state, run the stage under its deadline, then settle the
//! outcome. Losers of a status race ack and mutate nothing; business
//! failures mark the job failed with a bounded message; infrastructure
//! failures and cancellation go back through the queue.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tunereel_storage::{Job, JobStatus, JobStore, SystemPromptStore, UserStore};
use uuid::Uuid;

use crate::collaborators::{BlobStore, ImageGenerator, LlmClient, MusicGenerator, VideoMuxer};
use crate::config::Config;
use crate::crypto::CryptoService;
use crate::error::{Disposition, OrchestratorError, Result};
use crate::queue::{EnqueueOptions, EnqueueOutcome, TaskQueue};
use crate::stage::TaskKind;
use crate::urlguard::UrlGuard;

/// Persisted error messages are capped and carry no raw payloads.
pub const MAX_ERROR_MESSAGE_BYTES: usize = 512;

/// Everything a stage handler can reach. All shared, all cheap to clone.
#[derive(Clone)]
pub struct StageContext {
    pub jobs: Arc<dyn JobStore>,
    pub users: Arc<dyn UserStore>,
    pub prompts: Arc<dyn SystemPromptStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub llm: Arc<dyn LlmClient>,
    pub music: Arc<dyn MusicGenerator>,
    pub image: Arc<dyn ImageGenerator>,
    pub muxer: Arc<dyn VideoMuxer>,
    /// Absent when no bucket is configured; the upload stage then fails.
    pub blob: Option<Arc<dyn BlobStore>>,
    pub crypto: Arc<CryptoService>,
    pub url_guard: Arc<UrlGuard>,
    pub config: Arc<Config>,
}

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Pre-states this stage runs from. Any other status is an idempotent
    /// skip.
    fn accepts(&self) -> &'static [JobStatus];

    async fn run(&self, job: Job, ctx: &StageContext, cancel: &CancellationToken) -> Result<()>;
}

/// How the worker settles the task against the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResolution {
    Ack,
    Retry,
}

/// Run one stage task end to end and decide the broker settlement.
pub async fn execute(
    handler: &dyn StageHandler,
    ctx: &StageContext,
    job_id: Uuid,
    cancel: &CancellationToken,
) -> TaskResolution {
    let kind = handler.kind();

    let job = match ctx.jobs.get_by_id(job_id).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => {
            info!(%job_id, task = kind.as_str(), "job no longer exists; dropping task");
            return TaskResolution::Ack;
        }
        Err(e) => {
            warn!(%job_id, task = kind.as_str(), error = %e, "job load failed; will retry");
            return TaskResolution::Retry;
        }
    };

    if !handler.accepts().contains(&job.status) {
        info!(
            %job_id,
            task = kind.as_str(),
            status = %job.status,
            "job already advanced past this stage; skipping"
        );
        return TaskResolution::Ack;
    }

    let deadline = ctx.config.stage_timeout(kind);
    let result = tokio::select! {
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
        outcome = tokio::time::timeout(deadline, handler.run(job, ctx, cancel)) => {
            match outcome {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::Timeout(deadline)),
            }
        }
    };

    match result {
        Ok(()) => TaskResolution::Ack,
        Err(e) => settle_error(ctx, kind, job_id, e).await,
    }
}

async fn settle_error(
    ctx: &StageContext,
    kind: TaskKind,
    job_id: Uuid,
    e: OrchestratorError,
) -> TaskResolution {
    match e.disposition() {
        Disposition::Retry => {
            warn!(%job_id, task = kind.as_str(), error = %e, "stage hit transient failure; will retry");
            TaskResolution::Retry
        }
        Disposition::Ack => {
            info!(%job_id, task = kind.as_str(), error = %e, "another path advanced the job; acking");
            TaskResolution::Ack
        }
        Disposition::AckAndFail => {
            let message = bounded_failure_message(kind, &e);
            error!(%job_id, task = kind.as_str(), error = %e, "stage failed; marking job failed");
            match ctx.jobs.mark_failed(job_id, &message).await {
                Ok(applied) => {
                    if !applied {
                        info!(%job_id, "job already terminal; failure mark skipped");
                    }
                }
                Err(mark_err) => {
                    warn!(%job_id, error = %mark_err, "failure mark did not stick");
                }
            }
            TaskResolution::Ack
        }
    }
}

/// User-safe failure message: stage label plus the error, truncated at a
/// char boundary.
pub fn bounded_failure_message(kind: TaskKind, e: &OrchestratorError) -> String {
    let full = format!("{}: {e}", kind.as_str());
    truncate_message(&full, MAX_ERROR_MESSAGE_BYTES)
}

pub fn truncate_message(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Enqueue the next stage with its deterministic id where one applies. A
/// `Duplicate` outcome means another delivery got there first; that is
/// success.
pub async fn enqueue_next(ctx: &StageContext, kind: TaskKind, job_id: Uuid) -> Result<()> {
    let options = match kind.dedup_task_id(job_id) {
        Some(task_id) => EnqueueOptions::with_task_id(task_id),
        None => EnqueueOptions::default(),
    };
    match ctx.queue.enqueue(kind, job_id, options).await? {
        EnqueueOutcome::Enqueued => {
            info!(%job_id, task = kind.as_str(), "next stage enqueued");
        }
        EnqueueOutcome::Duplicate => {
            info!(%job_id, task = kind.as_str(), "next stage already scheduled");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::context;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        kind: TaskKind,
        accepts: &'static [JobStatus],
        runs: AtomicUsize,
        result: fn() -> Result<()>,
    }

    #[async_trait]
    impl StageHandler for CountingHandler {
        fn kind(&self) -> TaskKind {
            self.kind
        }

        fn accepts(&self) -> &'static [JobStatus] {
            self.accepts
        }

        async fn run(
            &self,
            _job: Job,
            _ctx: &StageContext,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    #[tokio::test]
    async fn test_missing_job_acks_without_running() {
        let ctx = context();
        let handler = CountingHandler {
            kind: TaskKind::AnalyzeConcept,
            accepts: &[JobStatus::Pending],
            runs: AtomicUsize::new(0),
            result: || Ok(()),
        };
        let resolution = execute(&handler, &ctx, Uuid::new_v4(), &CancellationToken::new()).await;
        assert_eq!(resolution, TaskResolution::Ack);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_wrong_pre_state_is_idempotent_skip() {
        let ctx = context();
        let job = Job::new(Uuid::new_v4(), "c", "m");
        ctx.jobs.create(&job).await.unwrap();
        let handler = CountingHandler {
            kind: TaskKind::SelectSong,
            accepts: &[JobStatus::SelectingSong],
            runs: AtomicUsize::new(0),
            result: || Ok(()),
        };
        let resolution = execute(&handler, &ctx, job.id, &CancellationToken::new()).await;
        assert_eq!(resolution, TaskResolution::Ack);
        assert_eq!(handler.runs.load(Ordering::SeqCst), 0);
        // The job was not touched.
        assert_eq!(
            ctx.jobs.get_by_id(job.id).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_business_failure_marks_job_and_acks() {
        let ctx = context();
        let job = Job::new(Uuid::new_v4(), "c", "m");
        ctx.jobs.create(&job).await.unwrap();
        let handler = CountingHandler {
            kind: TaskKind::AnalyzeConcept,
            accepts: &[JobStatus::Pending],
            runs: AtomicUsize::new(0),
            result: || {
                Err(OrchestratorError::collaborator(
                    "language model",
                    "quota exceeded",
                ))
            },
        };
        let resolution = execute(&handler, &ctx, job.id, &CancellationToken::new()).await;
        assert_eq!(resolution, TaskResolution::Ack);
        let row = ctx.jobs.get_by_id(job.id).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        let message = row.error_message.unwrap();
        assert!(message.contains("analyze_concept"));
        assert!(message.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_without_marking() {
        let ctx = context();
        let job = Job::new(Uuid::new_v4(), "c", "m");
        ctx.jobs.create(&job).await.unwrap();
        let handler = CountingHandler {
            kind: TaskKind::AnalyzeConcept,
            accepts: &[JobStatus::Pending],
            runs: AtomicUsize::new(0),
            result: || Err(OrchestratorError::transient("connection reset")),
        };
        let resolution = execute(&handler, &ctx, job.id, &CancellationToken::new()).await;
        assert_eq!(resolution, TaskResolution::Retry);
        assert_eq!(
            ctx.jobs.get_by_id(job.id).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cancellation_retries_without_marking() {
        let ctx = context();
        let job = Job::new(Uuid::new_v4(), "c", "m");
        ctx.jobs.create(&job).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = CountingHandler {
            kind: TaskKind::AnalyzeConcept,
            accepts: &[JobStatus::Pending],
            runs: AtomicUsize::new(0),
            result: || Ok(()),
        };
        let resolution = execute(&handler, &ctx, job.id, &cancel).await;
        assert_eq!(resolution, TaskResolution::Retry);
        assert_eq!(
            ctx.jobs.get_by_id(job.id).await.unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let message = "ü".repeat(600);
        let truncated = truncate_message(&message, MAX_ERROR_MESSAGE_BYTES);
        assert!(truncated.len() <= MAX_ERROR_MESSAGE_BYTES);
        assert!(truncated.chars().all(|c| c == 'ü'));
    }

    #[tokio::test]
    async fn test_enqueue_next_duplicate_is_success() {
        let ctx = context();
        let job_id = Uuid::new_v4();
        enqueue_next(&ctx, TaskKind::SelectSong, job_id).await.unwrap();
        enqueue_next(&ctx, TaskKind::SelectSong, job_id).await.unwrap();
    }
}
