//! Scripted collaborator doubles shared by the workspace tests.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tunereel_storage::GeneratedSong;

use super::{
    BlobStore, ImageGenerator, ImageTaskRequest, LlmClient, MusicGenerator, MusicRequest,
    MuxOutput, MuxRequest, VideoMuxer,
};
use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone)]
pub struct ChatCall {
    pub system_prompt: String,
    pub user_prompt: String,
    pub model: String,
    pub had_api_key: bool,
}

/// LLM double answering from a scripted queue of values or errors.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<VecDeque<std::result::Result<serde_json::Value, String>>>,
    pub calls: Mutex<Vec<ChatCall>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_value(&self, value: serde_json::Value) {
        self.responses.lock().unwrap().push_back(Ok(value));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Err(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        api_key: Option<&str>,
    ) -> Result<serde_json::Value> {
        self.calls.lock().unwrap().push(ChatCall {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            model: model.to_string(),
            had_api_key: api_key.is_some(),
        });
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(OrchestratorError::collaborator("language model", message)),
            None => Err(OrchestratorError::collaborator(
                "language model",
                "no scripted response left",
            )),
        }
    }
}

/// Music generator double: hands out a fixed task id and scripted songs.
pub struct MockMusic {
    pub task_id: String,
    songs: Mutex<Vec<GeneratedSong>>,
    generate_error: Mutex<Option<String>>,
    pub requests: Mutex<Vec<MusicRequest>>,
}

impl MockMusic {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            songs: Mutex::new(Vec::new()),
            generate_error: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_songs(&self, songs: Vec<GeneratedSong>) {
        *self.songs.lock().unwrap() = songs;
    }

    pub fn fail_generate(&self, message: impl Into<String>) {
        *self.generate_error.lock().unwrap() = Some(message.into());
    }

    pub fn issued_requests(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl MusicGenerator for MockMusic {
    async fn generate(&self, request: &MusicRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(message) = self.generate_error.lock().unwrap().clone() {
            return Err(OrchestratorError::collaborator("music generator", message));
        }
        Ok(self.task_id.clone())
    }

    async fn wait_for_completion(
        &self,
        _task_id: &str,
        _timeout: Duration,
    ) -> Result<Vec<GeneratedSong>> {
        Ok(self.songs.lock().unwrap().clone())
    }
}

/// Image generator double, symmetric to [`MockMusic`].
pub struct MockImage {
    pub task_id: String,
    urls: Mutex<Vec<String>>,
    create_error: Mutex<Option<String>>,
    pub requests: Mutex<Vec<ImageTaskRequest>>,
}

impl MockImage {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            urls: Mutex::new(Vec::new()),
            create_error: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn set_urls(&self, urls: Vec<String>) {
        *self.urls.lock().unwrap() = urls;
    }

    pub fn fail_create(&self, message: impl Into<String>) {
        *self.create_error.lock().unwrap() = Some(message.into());
    }
}

#[async_trait]
impl ImageGenerator for MockImage {
    async fn create_task(&self, request: &ImageTaskRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(message) = self.create_error.lock().unwrap().clone() {
            return Err(OrchestratorError::collaborator("image generator", message));
        }
        Ok(self.task_id.clone())
    }

    async fn wait_for_completion(&self, _task_id: &str, _timeout: Duration) -> Result<Vec<String>> {
        Ok(self.urls.lock().unwrap().clone())
    }
}

/// Muxer double that writes a small file where ffmpeg would.
#[derive(Default)]
pub struct MockMuxer {
    fail_with: Mutex<Option<String>>,
}

impl MockMuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap() = Some(message.into());
    }
}

#[async_trait]
impl VideoMuxer for MockMuxer {
    async fn create_music_video(
        &self,
        request: &MuxRequest,
        _cancel: &CancellationToken,
    ) -> Result<MuxOutput> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(OrchestratorError::collaborator("video muxer", message));
        }
        tokio::fs::write(&request.output_path, b"mp4-bytes")
            .await
            .map_err(OrchestratorError::transient)?;
        Ok(MuxOutput {
            output_path: request.output_path.clone(),
            file_size: 9,
            duration_seconds: 182.5,
        })
    }
}

/// Blob store double recording uploads in memory.
pub struct MockBlob {
    pub uploads: Mutex<Vec<(String, PathBuf)>>,
    public_base_url: Option<String>,
    fail_upload: Mutex<Option<String>>,
}

impl MockBlob {
    pub fn new(public_base_url: Option<String>) -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            public_base_url,
            fail_upload: Mutex::new(None),
        }
    }

    pub fn fail_upload(&self, message: impl Into<String>) {
        *self.fail_upload.lock().unwrap() = Some(message.into());
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MockBlob {
    async fn upload(&self, key: &str, file: &Path, _content_type: &str) -> Result<()> {
        if let Some(message) = self.fail_upload.lock().unwrap().clone() {
            return Err(OrchestratorError::collaborator("blob storage", message));
        }
        self.uploads
            .lock()
            .unwrap()
            .push((key.to_string(), file.to_path_buf()));
        Ok(())
    }

    fn public_url(&self, key: &str) -> Option<String> {
        self.public_base_url
            .as_ref()
            .map(|base| format!("{base}/{key}"))
    }

    async fn presigned_url(&self, key: &str, _ttl: Duration) -> Result<String> {
        Ok(format!("https://signed.tunereel.app/{key}?sig=mock"))
    }
}
