//! First stage: turn the user's concept into a music brief.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tunereel_storage::{AgentKind, Job, JobStatus, SongPrompt};

use super::{agent_prompt, llm_call_config};
use crate::agents;
use crate::error::Result;
use crate::pipeline::{enqueue_next, StageContext, StageHandler};
use crate::stage::TaskKind;

pub struct AnalyzeConcept;

#[async_trait]
impl StageHandler for AnalyzeConcept {
    fn kind(&self) -> TaskKind {
        TaskKind::AnalyzeConcept
    }

    // A redelivery may find the job already in analyzing; both are fine.
    fn accepts(&self) -> &'static [JobStatus] {
        &[JobStatus::Pending, JobStatus::Analyzing]
    }

    async fn run(&self, job: Job, ctx: &StageContext, _cancel: &CancellationToken) -> Result<()> {
        if job.status == JobStatus::Pending {
            match ctx.jobs.cas_start_analysis(job.id).await {
                Ok(()) => {}
                Err(e) if e.is_status_conflict() => {
                    // A concurrent delivery won the start; continue only if
                    // the job is still ours to analyze.
                    let fresh = ctx.jobs.get_by_id(job.id).await?;
                    if fresh.status != JobStatus::Analyzing {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let llm_config = llm_call_config(ctx, &job).await?;
        let system_prompt = agent_prompt(ctx, AgentKind::ConceptAnalyst).await?;
        let brief = agents::analyze_concept(
            ctx.llm.as_ref(),
            &system_prompt,
            &job.concept,
            &llm_config.model,
            llm_config.api_key.as_deref(),
        )
        .await?;

        // The downstream model tag comes from configuration, never from the
        // model's own output.
        let prompt = SongPrompt {
            prompt: brief.prompt,
            style: brief.style,
            title: brief.title,
            model_tag: ctx.config.music_model_tag.clone(),
            instrumental: brief.instrumental,
        };
        ctx.jobs.cas_set_song_prompt(job.id, &prompt).await?;
        enqueue_next(ctx, TaskKind::GenerateMusic, job.id).await?;
        Ok(())
    }
}
