//! Fourth stage: produce cover art for the selected song.
//!
//! Mirrors the music stage: prompt first (persisted without a status
//! change), then the external task, then either the callback or the polling
//! fallback advances the job.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunereel_storage::{AgentKind, ImagePromptSpec, Job, JobStatus};

use super::{agent_prompt, llm_call_config};
use crate::agents;
use crate::collaborators::ImageTaskRequest;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{enqueue_next, StageContext, StageHandler};
use crate::stage::TaskKind;

pub struct GenerateImage;

#[async_trait]
impl StageHandler for GenerateImage {
    fn kind(&self) -> TaskKind {
        TaskKind::GenerateImage
    }

    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::GeneratingImage]
    }

    async fn run(&self, job: Job, ctx: &StageContext, _cancel: &CancellationToken) -> Result<()> {
        let task_id = match &job.external_image_task_id {
            Some(existing) => existing.clone(),
            None => {
                let spec = match &job.image_prompt {
                    // A redelivery after the prompt was persisted reuses it.
                    Some(spec) => spec.clone(),
                    None => {
                        let llm_config = llm_call_config(ctx, &job).await?;
                        let system_prompt = agent_prompt(ctx, AgentKind::ImagePrompter).await?;
                        let prompt = agents::compose_image_prompt(
                            ctx.llm.as_ref(),
                            &system_prompt,
                            &job.concept,
                            job.song_prompt.as_ref(),
                            &llm_config.model,
                            llm_config.api_key.as_deref(),
                        )
                        .await?;
                        let spec = ImagePromptSpec {
                            prompt,
                            aspect_ratio: ctx.config.image_aspect_ratio.clone(),
                            resolution: ctx.config.image_resolution.clone(),
                        };
                        ctx.jobs.cas_set_image_prompt(job.id, &spec).await?;
                        spec
                    }
                };

                let request = ImageTaskRequest {
                    prompt: spec.prompt,
                    aspect_ratio: spec.aspect_ratio,
                    resolution: spec.resolution,
                    callback_url: ctx.config.image_callback_url(job.id),
                };
                let issued = ctx.image.create_task(&request).await?;
                info!(job_id = %job.id, task_id = %issued, "image generation task issued");
                match ctx.jobs.cas_set_image_task_id(job.id, &issued).await {
                    Ok(()) => issued,
                    Err(e) if e.is_status_conflict() => {
                        let fresh = ctx.jobs.get_by_id(job.id).await?;
                        match fresh.external_image_task_id {
                            Some(stored) if fresh.status == JobStatus::GeneratingImage => {
                                warn!(
                                    job_id = %job.id,
                                    stored = %stored,
                                    dropped = %issued,
                                    "image task already recorded; using stored id"
                                );
                                stored
                            }
                            _ => return Ok(()),
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if ctx.config.callback_mode() {
            return Ok(());
        }

        // Polling fallback.
        let timeout = ctx.config.stage_timeout(TaskKind::GenerateImage);
        let urls = ctx.image.wait_for_completion(&task_id, timeout).await?;
        let mut valid = Vec::new();
        for url in urls {
            match ctx.url_guard.validate(&url).await {
                Ok(()) => valid.push(url),
                Err(reason) => {
                    warn!(job_id = %job.id, url = %url, %reason, "dropping rejected image URL");
                }
            }
        }
        let image_url = valid.into_iter().next().ok_or_else(|| {
            OrchestratorError::collaborator(
                "image generator",
                "no valid image outputs after URL validation",
            )
        })?;
        ctx.jobs
            .cas_set_image_url(job.id, &task_id, &image_url)
            .await?;
        enqueue_next(ctx, TaskKind::ProcessVideo, job.id).await?;
        Ok(())
    }
}
