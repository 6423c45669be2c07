//! One handler per pipeline stage.

use std::sync::Arc;

use tunereel_storage::{AgentKind, Job};

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{StageContext, StageHandler};

pub mod analyze_concept;
pub mod generate_image;
pub mod generate_music;
pub mod process_video;
pub mod select_song;
pub mod upload_assets;

pub use analyze_concept::AnalyzeConcept;
pub use generate_image::GenerateImage;
pub use generate_music::GenerateMusic;
pub use process_video::ProcessVideo;
pub use select_song::SelectSong;
pub use upload_assets::UploadAssets;

/// Filename of the local artifact inside a job's work directory. Both video
/// stages derive it from the job id alone, so nothing extra travels in queue
/// payloads.
pub const ARTIFACT_FILENAME: &str = "video.mp4";

/// The full handler set, one per task kind.
pub fn default_handlers() -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(AnalyzeConcept),
        Arc::new(GenerateMusic),
        Arc::new(SelectSong),
        Arc::new(GenerateImage),
        Arc::new(ProcessVideo),
        Arc::new(UploadAssets),
    ]
}

/// Model and decrypted API key for an LLM call on behalf of a job's owner.
pub(crate) struct LlmCallConfig {
    pub model: String,
    pub api_key: Option<String>,
}

pub(crate) async fn llm_call_config(ctx: &StageContext, job: &Job) -> Result<LlmCallConfig> {
    let user = ctx.users.get_by_id(job.user_id).await.map_err(|e| {
        if e.is_not_found() {
            OrchestratorError::invalid_input("job owner no longer exists")
        } else {
            OrchestratorError::from(e)
        }
    })?;
    let model = if !job.llm_model.trim().is_empty() {
        job.llm_model.clone()
    } else {
        user.preferred_llm_model
            .clone()
            .unwrap_or_else(|| ctx.config.default_llm_model.clone())
    };
    let api_key = match &user.encrypted_llm_api_key {
        Some(token) => Some(ctx.crypto.decrypt(token)?),
        None => None,
    };
    Ok(LlmCallConfig { model, api_key })
}

pub(crate) async fn agent_prompt(ctx: &StageContext, agent: AgentKind) -> Result<String> {
    let prompt = ctx.prompts.get(agent).await.map_err(|e| {
        if e.is_not_found() {
            OrchestratorError::config(format!("no system prompt installed for {agent}"))
        } else {
            OrchestratorError::from(e)
        }
    })?;
    Ok(prompt.content)
}
