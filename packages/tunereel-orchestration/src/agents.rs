//! Prompt agents: thin typed functions over [`LlmClient::chat_json`].
//!
//! Each agent takes its inputs plus the effective system prompt and returns a
//! typed result; the model and the caller's API key are threaded through
//! unchanged.

use serde::Deserialize;
use serde_json::json;
use tunereel_storage::{GeneratedSong, SongPrompt};

use crate::collaborators::LlmClient;
use crate::error::{OrchestratorError, Result};

/// Music brief as the concept analyst produces it. The downstream model tag
/// is attached by the orchestrator afterwards.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SongBrief {
    pub prompt: String,
    pub style: String,
    pub title: String,
    #[serde(default)]
    pub instrumental: bool,
}

pub async fn analyze_concept(
    llm: &dyn LlmClient,
    system_prompt: &str,
    concept: &str,
    model: &str,
    api_key: Option<&str>,
) -> Result<SongBrief> {
    let user_prompt = format!("Concept: {concept}");
    let value = llm
        .chat_json(system_prompt, &user_prompt, model, api_key)
        .await?;
    serde_json::from_value(value).map_err(|e| {
        OrchestratorError::invalid_input(format!("malformed song brief from model: {e}"))
    })
}

#[derive(Debug, Deserialize)]
struct SongChoice {
    song_id: String,
}

/// Ask the model to pick one of the candidate songs. The returned id is NOT
/// validated here; the caller checks membership against the job row.
pub async fn select_song(
    llm: &dyn LlmClient,
    system_prompt: &str,
    concept: &str,
    candidates: &[GeneratedSong],
    model: &str,
    api_key: Option<&str>,
) -> Result<String> {
    let catalog: Vec<serde_json::Value> = candidates
        .iter()
        .map(|song| {
            json!({
                "song_id": song.id,
                "title": song.title,
                "duration_seconds": song.duration_seconds,
            })
        })
        .collect();
    let user_prompt = format!(
        "Concept: {concept}\nCandidates: {}",
        serde_json::to_string(&catalog).expect("catalog serializes")
    );
    let value = llm
        .chat_json(system_prompt, &user_prompt, model, api_key)
        .await?;
    let choice: SongChoice = serde_json::from_value(value).map_err(|e| {
        OrchestratorError::invalid_input(format!("malformed song choice from model: {e}"))
    })?;
    Ok(choice.song_id)
}

#[derive(Debug, Deserialize)]
struct ImageBrief {
    prompt: String,
}

/// Produce the cover-art prompt from the concept and the song brief.
pub async fn compose_image_prompt(
    llm: &dyn LlmClient,
    system_prompt: &str,
    concept: &str,
    song: Option<&SongPrompt>,
    model: &str,
    api_key: Option<&str>,
) -> Result<String> {
    let user_prompt = match song {
        Some(song) => format!(
            "Concept: {concept}\nSong title: {}\nMusical style: {}",
            song.title, song.style
        ),
        None => format!("Concept: {concept}"),
    };
    let value = llm
        .chat_json(system_prompt, &user_prompt, model, api_key)
        .await?;
    let brief: ImageBrief = serde_json::from_value(value).map_err(|e| {
        OrchestratorError::invalid_input(format!("malformed image brief from model: {e}"))
    })?;
    Ok(brief.prompt)
}
