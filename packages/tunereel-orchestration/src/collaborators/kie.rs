//! KIE generation API client: the suno music endpoint and the nano image
//! endpoint share a base URL, an API key, and a task-then-poll shape.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Instant;
use tracing::debug;
use tunereel_storage::GeneratedSong;

use super::{ImageGenerator, ImageTaskRequest, MusicGenerator, MusicRequest};
use crate::error::{OrchestratorError, Result};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct KieClient {
    base_url: String,
    api_key: Option<String>,
    poll_interval: Duration,
    client: Client,
}

impl KieClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            poll_interval: DEFAULT_POLL_INTERVAL,
            client: Client::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
        stage: &'static str,
    ) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(OrchestratorError::transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::collaborator(
                stage,
                format!("endpoint returned {status}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::collaborator(stage, e.to_string()))
    }

    async fn get_json(&self, path_and_query: &str, stage: &'static str) -> Result<serde_json::Value> {
        let mut request = self
            .client
            .get(format!("{}{path_and_query}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(OrchestratorError::transient)?;
        let status = response.status();
        if !status.is_success() {
            return Err(OrchestratorError::collaborator(
                stage,
                format!("endpoint returned {status}"),
            ));
        }
        response
            .json()
            .await
            .map_err(|e| OrchestratorError::collaborator(stage, e.to_string()))
    }
}

// ── wire shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TaskCreated {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<TaskCreatedData>,
}

#[derive(Debug, Deserialize)]
struct TaskCreatedData {
    #[serde(rename = "taskId")]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct MusicRecord {
    #[serde(default)]
    data: Option<MusicRecordData>,
}

#[derive(Debug, Deserialize)]
struct MusicRecordData {
    #[serde(default)]
    status: String,
    #[serde(default)]
    response: Option<MusicRecordResponse>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicRecordResponse {
    #[serde(rename = "sunoData", default)]
    suno_data: Vec<SunoTrack>,
}

/// One track as the suno API reports it; normalized into [`GeneratedSong`]
/// before anything else sees it.
#[derive(Debug, Deserialize)]
pub struct SunoTrack {
    pub id: String,
    #[serde(rename = "audioUrl", alias = "audio_url", default)]
    pub audio_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub duration: f64,
}

impl From<SunoTrack> for GeneratedSong {
    fn from(track: SunoTrack) -> Self {
        GeneratedSong {
            id: track.id,
            audio_url: track.audio_url,
            title: track.title,
            duration_seconds: track.duration,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ImageRecord {
    #[serde(default)]
    data: Option<ImageRecordData>,
}

#[derive(Debug, Deserialize)]
struct ImageRecordData {
    #[serde(default)]
    state: String,
    #[serde(rename = "resultJson", default)]
    result_json: Option<String>,
    #[serde(rename = "failMsg", default)]
    fail_msg: Option<String>,
}

/// The JSON-encoded payload inside an image record's `resultJson` field.
/// Shared with the webhook parser.
#[derive(Debug, Deserialize)]
pub struct KieImageResult {
    #[serde(rename = "resultUrls", default)]
    pub result_urls: Vec<String>,
}

fn parse_task_created(value: serde_json::Value, stage: &'static str) -> Result<String> {
    let created: TaskCreated = serde_json::from_value(value)
        .map_err(|e| OrchestratorError::collaborator(stage, e.to_string()))?;
    if created.code != 200 {
        return Err(OrchestratorError::collaborator(
            stage,
            format!("task rejected (code {}): {}", created.code, created.msg),
        ));
    }
    created
        .data
        .map(|d| d.task_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| OrchestratorError::collaborator(stage, "task accepted without a task id"))
}

// ── music ──────────────────────────────────────────────────────────────────

#[async_trait]
impl MusicGenerator for KieClient {
    async fn generate(&self, request: &MusicRequest) -> Result<String> {
        let body = json!({
            "prompt": request.prompt,
            "style": request.style,
            "title": request.title,
            "instrumental": request.instrumental,
            "model": request.model_tag,
            "callBackUrl": request.callback_url,
        });
        let value = self
            .post_json("/api/v1/generate", body, "music generator")
            .await?;
        parse_task_created(value, "music generator")
    }

    async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Vec<GeneratedSong>> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self
                .get_json(
                    &format!("/api/v1/generate/record-info?taskId={task_id}"),
                    "music generator",
                )
                .await?;
            let record: MusicRecord = serde_json::from_value(value)
                .map_err(|e| OrchestratorError::collaborator("music generator", e.to_string()))?;
            if let Some(data) = record.data {
                let status = data.status.to_ascii_uppercase();
                if status == "SUCCESS" {
                    let songs: Vec<GeneratedSong> = data
                        .response
                        .map(|r| r.suno_data.into_iter().map(Into::into).collect())
                        .unwrap_or_default();
                    return Ok(songs);
                }
                if status.contains("FAIL") || status.contains("ERROR") {
                    return Err(OrchestratorError::collaborator(
                        "music generator",
                        data.error_message
                            .unwrap_or_else(|| format!("task ended in {status}")),
                    ));
                }
                debug!(task_id, status = %status, "music task still running");
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(OrchestratorError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

// ── image ──────────────────────────────────────────────────────────────────

#[async_trait]
impl ImageGenerator for KieClient {
    async fn create_task(&self, request: &ImageTaskRequest) -> Result<String> {
        let body = json!({
            "model": "nano-banana",
            "callBackUrl": request.callback_url,
            "input": {
                "prompt": request.prompt,
                "aspect_ratio": request.aspect_ratio,
                "resolution": request.resolution,
            },
        });
        let value = self
            .post_json("/api/v1/jobs/createTask", body, "image generator")
            .await?;
        parse_task_created(value, "image generator")
    }

    async fn wait_for_completion(&self, task_id: &str, timeout: Duration) -> Result<Vec<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            let value = self
                .get_json(
                    &format!("/api/v1/jobs/recordInfo?taskId={task_id}"),
                    "image generator",
                )
                .await?;
            let record: ImageRecord = serde_json::from_value(value)
                .map_err(|e| OrchestratorError::collaborator("image generator", e.to_string()))?;
            if let Some(data) = record.data {
                match data.state.as_str() {
                    "success" => {
                        let urls = data
                            .result_json
                            .as_deref()
                            .and_then(|raw| serde_json::from_str::<KieImageResult>(raw).ok())
                            .map(|r| r.result_urls)
                            .unwrap_or_default();
                        return Ok(urls);
                    }
                    "fail" => {
                        return Err(OrchestratorError::collaborator(
                            "image generator",
                            data.fail_msg.unwrap_or_else(|| "task failed".to_string()),
                        ));
                    }
                    state => debug!(task_id, state, "image task still running"),
                }
            }
            if Instant::now() + self.poll_interval > deadline {
                return Err(OrchestratorError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_created_parses() {
        let value = json!({ "code": 200, "msg": "ok", "data": { "taskId": "m-001" } });
        assert_eq!(parse_task_created(value, "music generator").unwrap(), "m-001");
    }

    #[test]
    fn test_task_rejected_code() {
        let value = json!({ "code": 429, "msg": "quota exceeded" });
        let err = parse_task_created(value, "music generator").unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_suno_track_normalizes() {
        let raw = json!({
            "id": "s1",
            "audioUrl": "https://cdn1.suno.ai/s1.mp3",
            "title": "Sunset",
            "duration": 182.5,
            "imageUrl": "ignored",
        });
        let track: SunoTrack = serde_json::from_value(raw).unwrap();
        let song: GeneratedSong = track.into();
        assert_eq!(song.audio_url, "https://cdn1.suno.ai/s1.mp3");
        assert_eq!(song.duration_seconds, 182.5);
    }

    #[test]
    fn test_image_result_json_parses() {
        let result: KieImageResult =
            serde_json::from_str(r#"{"resultUrls":["https://cdn.kie.ai/i1.png"]}"#).unwrap();
        assert_eq!(result.result_urls, vec!["https://cdn.kie.ai/i1.png"]);
    }
}
