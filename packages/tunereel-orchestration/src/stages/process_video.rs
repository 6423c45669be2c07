//! Fifth stage: assemble audio and cover art into the local video artifact.
//!
//! The artifact lives in a per-job work directory owned by this handler
//! until the CAS hands the job (and with it the directory) to the upload
//! stage. On its own failure this stage removes the directory.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunereel_storage::{Job, JobStatus};

use super::ARTIFACT_FILENAME;
use crate::collaborators::MuxRequest;
use crate::error::{OrchestratorError, Result};
use crate::pipeline::{enqueue_next, StageContext, StageHandler};
use crate::stage::TaskKind;

pub struct ProcessVideo;

#[async_trait]
impl StageHandler for ProcessVideo {
    fn kind(&self) -> TaskKind {
        TaskKind::ProcessVideo
    }

    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::ProcessingVideo]
    }

    async fn run(&self, job: Job, ctx: &StageContext, cancel: &CancellationToken) -> Result<()> {
        let audio_url = job
            .audio_url
            .clone()
            .ok_or_else(|| OrchestratorError::invalid_input("audio url missing"))?;
        let image_url = job
            .image_url
            .clone()
            .ok_or_else(|| OrchestratorError::invalid_input("image url missing"))?;

        // Both URLs were validated at persist time; check again before
        // spending a download. The muxer's fetcher re-vets each URL and pins
        // the connection to the checked addresses.
        for url in [&audio_url, &image_url] {
            if let Err(reason) = ctx.url_guard.validate(url).await {
                return Err(OrchestratorError::UrlRejected {
                    url: url.clone(),
                    reason,
                });
            }
        }

        let work_dir = ctx.config.job_work_dir(job.id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .map_err(OrchestratorError::transient)?;
        let output_path = work_dir.join(ARTIFACT_FILENAME);

        let request = MuxRequest {
            audio_url,
            image_url,
            output_path,
        };
        let output = match ctx.muxer.create_music_video(&request, cancel).await {
            Ok(output) => output,
            Err(OrchestratorError::Cancelled) => {
                // Worker shutdown, not a failure: keep the directory for the
                // redelivery.
                return Err(OrchestratorError::Cancelled);
            }
            Err(e) => {
                remove_work_dir(&work_dir).await;
                return Err(e);
            }
        };
        info!(
            job_id = %job.id,
            size = output.file_size,
            duration = output.duration_seconds,
            "video artifact assembled"
        );

        let handle = output.output_path.to_string_lossy();
        if let Err(e) = ctx.jobs.cas_set_video_url(job.id, &handle).await {
            // The job left processing_video behind our back (cancelled or
            // failed); nobody will consume the artifact.
            remove_work_dir(&work_dir).await;
            return Err(e.into());
        }
        enqueue_next(ctx, TaskKind::UploadAssets, job.id).await?;
        Ok(())
    }
}

pub(crate) async fn remove_work_dir(dir: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %dir.display(), error = %e, "work directory cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{execute, TaskResolution};
    use crate::testutil::Fixture;
    use tunereel_storage::{GeneratedSong, JobStore, SongPrompt};

    async fn job_processing_video(fixture: &Fixture) -> Job {
        let user_id = fixture.seed_user();
        let job = Job::new(user_id, "sunset over ocean, calming", "gpt-4o-mini");
        fixture.jobs.create(&job).await.unwrap();
        fixture.jobs.cas_start_analysis(job.id).await.unwrap();
        let prompt = SongPrompt {
            prompt: "gentle waves".into(),
            style: "ambient".into(),
            title: "Sunset".into(),
            model_tag: "V4".into(),
            instrumental: false,
        };
        fixture.jobs.cas_set_song_prompt(job.id, &prompt).await.unwrap();
        let song = GeneratedSong {
            id: "s1".into(),
            audio_url: "https://cdn1.suno.ai/s1.mp3".into(),
            title: "Sunset".into(),
            duration_seconds: 182.5,
        };
        fixture
            .jobs
            .cas_set_generated_songs(job.id, "m-001", &[song])
            .await
            .unwrap();
        fixture
            .jobs
            .cas_set_selected_song(job.id, "s1", "https://cdn1.suno.ai/s1.mp3")
            .await
            .unwrap();
        fixture
            .jobs
            .cas_set_image_url(job.id, "i-001", "https://cdn.kie.ai/i1.png")
            .await
            .unwrap();
        fixture.jobs.snapshot(job.id).unwrap()
    }

    fn config_in(dir: &tempfile::TempDir) -> crate::config::Config {
        crate::config::Config {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_writes_artifact_and_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = Fixture::with_config(config_in(&tmp));
        let ctx = fixture.context();
        let job = job_processing_video(&fixture).await;

        let resolution = execute(&ProcessVideo, &ctx, job.id, &CancellationToken::new()).await;
        assert_eq!(resolution, TaskResolution::Ack);

        let row = fixture.jobs.snapshot(job.id).unwrap();
        assert_eq!(row.status, JobStatus::Uploading);
        // The stored handle points at the artifact on disk.
        let handle = row.video_url.unwrap();
        assert!(handle.ends_with(ARTIFACT_FILENAME));
        assert!(std::path::Path::new(&handle).exists());
        assert_eq!(fixture.queue.pending(TaskKind::UploadAssets), 1);
    }

    #[tokio::test]
    async fn test_mux_failure_cleans_up_and_fails_job() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = Fixture::with_config(config_in(&tmp));
        let ctx = fixture.context();
        let job = job_processing_video(&fixture).await;
        fixture.muxer.fail_with("encoder exploded");

        execute(&ProcessVideo, &ctx, job.id, &CancellationToken::new()).await;

        let row = fixture.jobs.snapshot(job.id).unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.error_message.unwrap().contains("encoder exploded"));
        assert!(!fixture.config.job_work_dir(job.id).exists());
    }

    #[tokio::test]
    async fn test_missing_inputs_fail_job() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = Fixture::with_config(config_in(&tmp));
        let ctx = fixture.context();
        let job = job_processing_video(&fixture).await;
        let mut crippled = job.clone();
        crippled.image_url = None;
        let err = ProcessVideo
            .run(crippled, &ctx, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_cancellation_keeps_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let fixture = Fixture::with_config(config_in(&tmp));
        let ctx = fixture.context();
        let job = job_processing_video(&fixture).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let resolution = execute(&ProcessVideo, &ctx, job.id, &cancel).await;
        assert_eq!(resolution, TaskResolution::Retry);
        // No state change, no failure mark.
        assert_eq!(
            fixture.jobs.snapshot(job.id).unwrap().status,
            JobStatus::ProcessingVideo
        );
    }
}
