//! Job lifecycle entry points used by the surrounding API surface.

use tracing::info;
use tunereel_storage::{Job, JobStore};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::queue::{EnqueueOptions, TaskQueue};
use crate::stage::TaskKind;

/// Create a job in `pending` and schedule its first stage.
pub async fn create_job(
    jobs: &dyn JobStore,
    queue: &dyn TaskQueue,
    user_id: Uuid,
    concept: &str,
    llm_model: &str,
) -> Result<Job> {
    let concept = concept.trim();
    if concept.is_empty() {
        return Err(OrchestratorError::invalid_input("concept must not be empty"));
    }
    let job = Job::new(user_id, concept, llm_model);
    jobs.create(&job).await?;
    queue
        .enqueue(TaskKind::AnalyzeConcept, job.id, EnqueueOptions::default())
        .await?;
    info!(job_id = %job.id, %user_id, "job created");
    Ok(job)
}

/// Cancel a job. Uses the terminal-guarded failure mark, so a job that
/// already finished is left untouched; returns whether the cancel landed.
/// Any external task still running gets its eventual callback answered as a
/// no-op.
pub async fn cancel_job(jobs: &dyn JobStore, job_id: Uuid) -> Result<bool> {
    let applied = jobs.mark_failed(job_id, "job cancelled by user").await?;
    if applied {
        info!(%job_id, "job cancelled");
    }
    Ok(applied)
}

/// Administrative delete of a terminal job.
pub async fn delete_job(jobs: &dyn JobStore, job_id: Uuid) -> Result<()> {
    jobs.delete(job_id).await?;
    info!(%job_id, "job deleted");
    Ok(())
}
