//! Final stage: push the artifact to blob storage and complete the job.
//!
//! The artifact directory is consumed here: it is removed on success and on
//! every business-failure path. Transient failures and cancellation keep it
//! for the redelivery.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunereel_storage::{Job, JobStatus};

use super::process_video::remove_work_dir;
use super::ARTIFACT_FILENAME;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{StageContext, StageHandler};
use crate::stage::TaskKind;

/// Fallback signed-URL lifetime when no public base is configured.
const PRESIGNED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct UploadAssets;

#[async_trait]
impl StageHandler for UploadAssets {
    fn kind(&self) -> TaskKind {
        TaskKind::UploadAssets
    }

    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::Uploading]
    }

    async fn run(&self, job: Job, ctx: &StageContext, _cancel: &CancellationToken) -> Result<()> {
        let work_dir = ctx.config.job_work_dir(job.id);
        let artifact = work_dir.join(ARTIFACT_FILENAME);

        if tokio::fs::metadata(&artifact).await.is_err() {
            remove_work_dir(&work_dir).await;
            return Err(OrchestratorError::invalid_input("video artifact missing"));
        }

        let Some(blob) = ctx.blob.as_ref() else {
            remove_work_dir(&work_dir).await;
            return Err(OrchestratorError::collaborator(
                "blob storage",
                "not configured",
            ));
        };

        let key = format!("videos/{}.mp4", job.id);
        if let Err(e) = blob.upload(&key, &artifact, "video/mp4").await {
            remove_work_dir(&work_dir).await;
            return Err(e);
        }

        let final_url = match blob.public_url(&key) {
            Some(url) => url,
            None => match blob.presigned_url(&key, PRESIGNED_TTL).await {
                Ok(url) => url,
                Err(e) => {
                    remove_work_dir(&work_dir).await;
                    return Err(e);
                }
            },
        };

        if let Err(e) = ctx.jobs.cas_complete(job.id, &final_url).await {
            remove_work_dir(&work_dir).await;
            return Err(e.into());
        }
        remove_work_dir(&work_dir).await;
        info!(job_id = %job.id, url = %final_url, "job completed");
        Ok(())
    }
}
