//! Third stage: pick one of the delivered songs.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tunereel_storage::{AgentKind, Job, JobStatus};

use super::{agent_prompt, llm_call_config};
use crate::agents;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{enqueue_next, StageContext, StageHandler};
use crate::stage::TaskKind;

pub struct SelectSong;

#[async_trait]
impl StageHandler for SelectSong {
    fn kind(&self) -> TaskKind {
        TaskKind::SelectSong
    }

    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::SelectingSong]
    }

    async fn run(&self, job: Job, ctx: &StageContext, _cancel: &CancellationToken) -> Result<()> {
        if job.generated_songs.is_empty() {
            return Err(OrchestratorError::invalid_input(
                "no generated songs to select from",
            ));
        }

        let chosen_id = if job.generated_songs.len() == 1 {
            // One candidate: no model call needed.
            job.generated_songs[0].id.clone()
        } else {
            let llm_config = llm_call_config(ctx, &job).await?;
            let system_prompt = agent_prompt(ctx, AgentKind::SongSelector).await?;
            agents::select_song(
                ctx.llm.as_ref(),
                &system_prompt,
                &job.concept,
                &job.generated_songs,
                &llm_config.model,
                llm_config.api_key.as_deref(),
            )
            .await?
        };

        let chosen = job.song_by_id(&chosen_id).ok_or_else(|| {
            OrchestratorError::invalid_input(format!(
                "model chose a song that was never generated: {chosen_id}"
            ))
        })?;

        let audio_url = chosen.audio_url.clone();
        if let Err(reason) = ctx.url_guard.validate(&audio_url).await {
            return Err(OrchestratorError::UrlRejected {
                url: audio_url,
                reason,
            });
        }

        info!(job_id = %job.id, song_id = %chosen_id, "song selected");
        ctx.jobs
            .cas_set_selected_song(job.id, &chosen_id, &audio_url)
            .await?;
        enqueue_next(ctx, TaskKind::GenerateImage, job.id).await?;
        Ok(())
    }
}
