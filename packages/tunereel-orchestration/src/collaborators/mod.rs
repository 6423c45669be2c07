//! External collaborator contracts.
//!
//! The pipeline depends only on these shapes; the adapters behind them talk
//! to the chat-completions endpoint, the KIE generation APIs, an out-of-process
//! ffmpeg, and S3-compatible blob storage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tunereel_storage::GeneratedSong;

use crate::error::Result;

pub mod blob;
pub mod fetch;
pub mod kie;
pub mod llm;
pub mod mock;
pub mod mux;

pub use blob::S3BlobStore;
pub use fetch::GuardedFetcher;
pub use kie::KieClient;
pub use llm::HttpLlmClient;
pub use mux::FfmpegMuxer;

/// Chat-based language model returning one JSON value per call.
///
/// Responses wrapped in markdown fences are unwrapped before parsing. The
/// per-call `api_key` carries the job owner's decrypted key; `None` falls
/// back to the process-level key.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_json(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
        api_key: Option<&str>,
    ) -> Result<serde_json::Value>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MusicRequest {
    pub prompt: String,
    pub style: String,
    pub title: String,
    pub instrumental: bool,
    pub model_tag: String,
    pub callback_url: Option<String>,
}

/// Asynchronous music generation: `generate` returns a task id immediately;
/// results arrive by callback, or through `wait_for_completion` when no
/// callback URL is configured.
#[async_trait]
pub trait MusicGenerator: Send + Sync {
    async fn generate(&self, request: &MusicRequest) -> Result<String>;

    async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Vec<GeneratedSong>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageTaskRequest {
    pub prompt: String,
    pub aspect_ratio: String,
    pub resolution: String,
    pub callback_url: Option<String>,
}

/// Asynchronous image generation, symmetric to [`MusicGenerator`].
/// `wait_for_completion` yields the result URLs.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn create_task(&self, request: &ImageTaskRequest) -> Result<String>;

    async fn wait_for_completion(&self, task_id: &str, timeout: Duration) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuxRequest {
    pub audio_url: String,
    pub image_url: String,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MuxOutput {
    pub output_path: PathBuf,
    pub file_size: u64,
    pub duration_seconds: f64,
}

/// Out-of-process video assembly. Input URLs are fetched to local files by
/// the adapter (through the SSRF guard) before the child process starts; the
/// muxer must stop the child when the cancellation token fires.
#[async_trait]
pub trait VideoMuxer: Send + Sync {
    async fn create_music_video(
        &self,
        request: &MuxRequest,
        cancel: &CancellationToken,
    ) -> Result<MuxOutput>;
}

/// Blob storage for finished videos. A public URL is preferred; a
/// time-limited signed URL is the fallback.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn upload(&self, key: &str, file: &Path, content_type: &str) -> Result<()>;

    fn public_url(&self, key: &str) -> Option<String>;

    async fn presigned_url(&self, key: &str, ttl: Duration) -> Result<String>;
}
