//! Webhook ingress: completion callbacks from the music and image
//! generators resume the paused pipeline.
//!
//! Every authenticated callback answers 200, including unknown task ids and
//! jobs already advanced or terminal. A non-2xx answer would make the
//! external service retry forever; only authentication and parse problems
//! get a 4xx, and only a broken database gets a 5xx.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tunereel_storage::{GeneratedSong, Job, JobStatus, JobStore, StorageError};
use uuid::Uuid;

use crate::collaborators::kie::KieImageResult;
use crate::pipeline::{truncate_message, MAX_ERROR_MESSAGE_BYTES};
use crate::queue::{EnqueueOptions, EnqueueOutcome, TaskQueue};
use crate::stage::TaskKind;
use crate::urlguard::UrlGuard;

const MAX_CALLBACK_BODY_BYTES: usize = 512 * 1024;
const MAX_TASK_ID_BYTES: usize = 256;

pub struct WebhookState {
    pub jobs: Arc<dyn JobStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub url_guard: Arc<UrlGuard>,
    secret: String,
    limiter: Mutex<TokenBucket>,
}

impl WebhookState {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        url_guard: Arc<UrlGuard>,
        secret: impl Into<String>,
        rate_limit_rps: f64,
        rate_limit_burst: u32,
    ) -> Self {
        Self {
            jobs,
            queue,
            url_guard,
            secret: secret.into(),
            limiter: Mutex::new(TokenBucket::new(rate_limit_rps, rate_limit_burst)),
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(
            "/api/v1/webhooks/{token}/suno/{job_id}",
            post(music_callback),
        )
        .route(
            "/api/v1/webhooks/{token}/nano/{job_id}",
            post(image_callback),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── payload shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MusicCallback {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<MusicCallbackData>,
}

#[derive(Debug, Deserialize)]
struct MusicCallbackData {
    #[serde(rename = "callbackType", default)]
    callback_type: String,
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    data: Vec<MusicCallbackTrack>,
    #[serde(rename = "errorMessage", default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MusicCallbackTrack {
    #[serde(default)]
    id: String,
    #[serde(default, alias = "audioUrl")]
    audio_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct ImageCallback {
    #[serde(default)]
    code: i64,
    data: Option<ImageCallbackData>,
}

#[derive(Debug, Deserialize)]
struct ImageCallbackData {
    #[serde(rename = "taskId", default)]
    task_id: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "resultJson", default)]
    result_json: Option<String>,
    #[serde(rename = "failMsg", default)]
    fail_msg: Option<String>,
}

// ── handlers ───────────────────────────────────────────────────────────────

/// Music completion. The path job id is advisory; routing uses the task id
/// in the payload. The service may deliver `first` and `complete` callbacks
/// for one task; both carry the full result set and are treated identically.
async fn music_callback(
    State(state): State<Arc<WebhookState>>,
    Path((token, _job_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if let Err(response) = gate(&state, &token, &body) {
        return response;
    }
    let payload: MusicCallback = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return bad_request("malformed payload"),
    };
    let Some(data) = payload.data else {
        return bad_request("payload carried no data");
    };
    if data.task_id.is_empty() || data.task_id.len() > MAX_TASK_ID_BYTES {
        return bad_request("bad task id");
    }

    let job = match state.jobs.get_by_music_task_id(&data.task_id).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => {
            info!(task_id = %data.task_id, "music callback for unknown task; acking");
            return ack();
        }
        Err(e) => return storage_failure(e),
    };
    if job.status != JobStatus::GeneratingMusic {
        info!(job_id = %job.id, status = %job.status, "music callback after advance; acking");
        return ack();
    }

    if payload.code != 200 {
        let detail = data.error_message.unwrap_or(payload.msg);
        return fail_job(&state, &job, &format!("music generation failed: {detail}")).await;
    }
    match data.callback_type.as_str() {
        "first" | "complete" => {}
        other => {
            // Interim events ("text") carry no playable output yet.
            info!(job_id = %job.id, callback_type = other, "interim music callback; acking");
            return ack();
        }
    }

    let mut songs = Vec::with_capacity(data.data.len());
    for track in data.data {
        match state.url_guard.validate(&track.audio_url).await {
            Ok(()) => songs.push(GeneratedSong {
                id: track.id,
                audio_url: track.audio_url,
                title: track.title,
                duration_seconds: track.duration,
            }),
            Err(reason) => {
                warn!(job_id = %job.id, url = %track.audio_url, %reason, "dropping song with rejected URL");
            }
        }
    }
    if songs.is_empty() {
        return fail_job(
            &state,
            &job,
            "music generation failed: no valid outputs passed URL validation",
        )
        .await;
    }

    match state
        .jobs
        .cas_set_generated_songs(job.id, &data.task_id, &songs)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_status_conflict() || e.is_not_found() => {
            info!(job_id = %job.id, "music result already recorded; acking");
            return ack();
        }
        Err(e) => return storage_failure(e),
    }
    resume(&state, TaskKind::SelectSong, job.id).await
}

/// Image completion, symmetric to the music path.
async fn image_callback(
    State(state): State<Arc<WebhookState>>,
    Path((token, _job_id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    if let Err(response) = gate(&state, &token, &body) {
        return response;
    }
    let payload: ImageCallback = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(_) => return bad_request("malformed payload"),
    };
    let Some(data) = payload.data else {
        return bad_request("payload carried no data");
    };
    if data.task_id.is_empty() || data.task_id.len() > MAX_TASK_ID_BYTES {
        return bad_request("bad task id");
    }

    let job = match state.jobs.get_by_image_task_id(&data.task_id).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => {
            info!(task_id = %data.task_id, "image callback for unknown task; acking");
            return ack();
        }
        Err(e) => return storage_failure(e),
    };
    if job.status != JobStatus::GeneratingImage {
        info!(job_id = %job.id, status = %job.status, "image callback after advance; acking");
        return ack();
    }

    match data.state.as_str() {
        "success" => {}
        "fail" => {
            let detail = data.fail_msg.unwrap_or_else(|| format!("code {}", payload.code));
            return fail_job(&state, &job, &format!("image generation failed: {detail}")).await;
        }
        other => {
            info!(job_id = %job.id, state = other, "image task still in flight; acking");
            return ack();
        }
    }

    let urls = data
        .result_json
        .as_deref()
        .and_then(|raw| serde_json::from_str::<KieImageResult>(raw).ok())
        .map(|result| result.result_urls)
        .unwrap_or_default();
    let mut valid = Vec::new();
    for url in urls {
        match state.url_guard.validate(&url).await {
            Ok(()) => valid.push(url),
            Err(reason) => {
                warn!(job_id = %job.id, url = %url, %reason, "dropping rejected image URL");
            }
        }
    }
    let Some(image_url) = valid.into_iter().next() else {
        return fail_job(
            &state,
            &job,
            "image generation failed: no valid outputs passed URL validation",
        )
        .await;
    };

    match state
        .jobs
        .cas_set_image_url(job.id, &data.task_id, &image_url)
        .await
    {
        Ok(()) => {}
        Err(e) if e.is_status_conflict() || e.is_not_found() => {
            info!(job_id = %job.id, "image result already recorded; acking");
            return ack();
        }
        Err(e) => return storage_failure(e),
    }
    resume(&state, TaskKind::ProcessVideo, job.id).await
}

// ── shared plumbing ────────────────────────────────────────────────────────

/// Rate limit, authentication, body size. Runs before any parsing.
fn gate(state: &WebhookState, token: &str, body: &Bytes) -> Result<(), Response> {
    if !state.limiter.lock().unwrap().allow() {
        return Err(StatusCode::TOO_MANY_REQUESTS.into_response());
    }
    if !constant_time_eq(token.as_bytes(), state.secret.as_bytes()) {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    if body.len() > MAX_CALLBACK_BODY_BYTES {
        return Err(bad_request("payload too large"));
    }
    Ok(())
}

async fn resume(state: &WebhookState, kind: TaskKind, job_id: Uuid) -> Response {
    let options = match kind.dedup_task_id(job_id) {
        Some(task_id) => EnqueueOptions::with_task_id(task_id),
        None => EnqueueOptions::default(),
    };
    match state.queue.enqueue(kind, job_id, options).await {
        Ok(EnqueueOutcome::Enqueued) => {
            info!(%job_id, task = kind.as_str(), "pipeline resumed");
        }
        Ok(EnqueueOutcome::Duplicate) => {
            info!(%job_id, task = kind.as_str(), "resume already scheduled by another callback");
        }
        Err(e) => {
            // The job row is already advanced; the task can be re-driven by
            // an operator, so the callback still acks.
            warn!(%job_id, task = kind.as_str(), error = %e, "resume enqueue failed");
        }
    }
    ack()
}

async fn fail_job(state: &WebhookState, job: &Job, message: &str) -> Response {
    let message = truncate_message(message, MAX_ERROR_MESSAGE_BYTES);
    match state.jobs.mark_failed(job.id, &message).await {
        Ok(applied) => {
            if applied {
                warn!(job_id = %job.id, %message, "job failed via callback");
            }
            ack()
        }
        Err(e) if e.is_not_found() => ack(),
        Err(e) => storage_failure(e),
    }
}

fn ack() -> Response {
    (StatusCode::OK, Json(json!({ "status": "received" }))).into_response()
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn storage_failure(e: StorageError) -> Response {
    // A broken database is the one case where the external service should
    // retry later.
    warn!(error = %e, "storage failure while handling callback");
    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}

/// Fixed-shape comparison: length check, then an OR-accumulated XOR fold.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Global token bucket for callback ingress. `rps <= 0` disables limiting.
struct TokenBucket {
    rps: f64,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rps: f64, burst: u32) -> Self {
        Self {
            rps,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: Instant::now(),
        }
    }

    fn allow(&mut self) -> bool {
        if self.rps <= 0.0 {
            return true;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * self.rps).min(self.burst);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
