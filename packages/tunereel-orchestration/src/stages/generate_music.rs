//! Second stage: hand the music brief to the external generator.
//!
//! In callback mode this stage only issues the task and records its id; the
//! webhook resumes the pipeline when songs arrive. Without a callback base
//! URL it polls the generator itself and advances the job directly.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunereel_storage::{GeneratedSong, Job, JobStatus};

use crate::collaborators::MusicRequest;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{enqueue_next, StageContext, StageHandler};
use crate::stage::TaskKind;

pub struct GenerateMusic;

#[async_trait]
impl StageHandler for GenerateMusic {
    fn kind(&self) -> TaskKind {
        TaskKind::GenerateMusic
    }

    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::GeneratingMusic]
    }

    async fn run(&self, job: Job, ctx: &StageContext, _cancel: &CancellationToken) -> Result<()> {
        let prompt = job
            .song_prompt
            .clone()
            .ok_or_else(|| OrchestratorError::invalid_input("song prompt missing"))?;

        let task_id = match &job.external_music_task_id {
            // A crash after issue but before completion lands here on
            // redelivery; the task is never issued twice.
            Some(existing) => existing.clone(),
            None => {
                let request = MusicRequest {
                    prompt: prompt.prompt,
                    style: prompt.style,
                    title: prompt.title,
                    instrumental: prompt.instrumental,
                    model_tag: prompt.model_tag,
                    callback_url: ctx.config.music_callback_url(job.id),
                };
                let issued = ctx.music.generate(&request).await?;
                info!(job_id = %job.id, task_id = %issued, "music generation task issued");
                match ctx.jobs.cas_set_music_task_id(job.id, &issued).await {
                    Ok(()) => issued,
                    Err(e) if e.is_status_conflict() => {
                        // A duplicate delivery issued first; its id is the
                        // one the webhook will look up.
                        let fresh = ctx.jobs.get_by_id(job.id).await?;
                        match fresh.external_music_task_id {
                            Some(stored) if fresh.status == JobStatus::GeneratingMusic => {
                                warn!(
                                    job_id = %job.id,
                                    stored = %stored,
                                    dropped = %issued,
                                    "music task already recorded; using stored id"
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
        let timeout = ctx.config.stage_timeout(TaskKind::GenerateMusic);
        let songs = ctx.music.wait_for_completion(&task_id, timeout).await?;
        let songs = keep_valid_songs(ctx, songs).await;
        if songs.is_empty() {
            return Err(OrchestratorError::collaborator(
                "music generator",
                "no valid song outputs after URL validation",
            ));
        }
        ctx.jobs
            .cas_set_generated_songs(job.id, &task_id, &songs)
            .await?;
        enqueue_next(ctx, TaskKind::SelectSong, job.id).await?;
        Ok(())
    }
}

/// Drop songs whose audio URL fails validation; the rest proceed.
pub(crate) async fn keep_valid_songs(
    ctx: &StageContext,
    songs: Vec<GeneratedSong>,
) -> Vec<GeneratedSong> {
    let mut kept = Vec::with_capacity(songs.len());
    for song in songs {
        match ctx.url_guard.validate(&song.audio_url).await {
            Ok(()) => kept.push(song),
            Err(reason) => {
                warn!(song_id = %song.id, url = %song.audio_url, %reason, "dropping song with rejected URL");
            }
        }
    }
    kept
}
