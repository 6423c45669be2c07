//! End-to-end pipeline scenarios over the in-memory adapters: worker-driven
//! stages plus real webhook requests through the router.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use uuid::Uuid;

use tunereel_orchestration::collaborators::mock::{
    MockBlob, MockImage, MockLlm, MockMusic, MockMuxer,
};
use tunereel_orchestration::pipeline::{execute, StageContext, TaskResolution};
use tunereel_orchestration::service;
use tunereel_orchestration::stages::default_handlers;
use tunereel_orchestration::{
    webhook_router, Config, CryptoService, MemoryQueue, TaskKind, TaskQueue, UrlGuard, WebhookState,
};
use tunereel_storage::{
    Job, JobStatus, MemoryJobStore, MemorySystemPromptStore, MemoryUserStore, User,
};

const SECRET: &str = "hook-secret";

struct Harness {
    jobs: Arc<MemoryJobStore>,
    users: Arc<MemoryUserStore>,
    queue: Arc<MemoryQueue>,
    llm: Arc<MockLlm>,
    blob: Arc<MockBlob>,
    ctx: StageContext,
    app: Router,
    _work_dir: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            webhook_base_url: Some("https://hooks.tunereel.app".to_string()),
            webhook_secret: SECRET.to_string(),
            work_dir: work_dir.path().to_path_buf(),
            ..Default::default()
        });

        let public: IpAddr = "104.18.7.7".parse().unwrap();
        let dns = HashMap::from([
            ("cdn1.suno.ai".to_string(), vec![public]),
            ("cdn.kie.ai".to_string(), vec![public]),
            ("media.tunereel.app".to_string(), vec![public]),
        ]);
        let guard = Arc::new(UrlGuard::with_static_dns(
            ["cdn1.suno.ai", "cdn.kie.ai", "media.tunereel.app"],
            dns,
        ));

        let jobs = Arc::new(MemoryJobStore::new());
        let users = Arc::new(MemoryUserStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let llm = Arc::new(MockLlm::new());
        let blob = Arc::new(MockBlob::new(Some("https://media.tunereel.app".to_string())));

        let ctx = StageContext {
            jobs: jobs.clone(),
            users: users.clone(),
            prompts: Arc::new(MemorySystemPromptStore::new()),
            queue: queue.clone(),
            llm: llm.clone(),
            music: Arc::new(MockMusic::new("m-001")),
            image: Arc::new(MockImage::new("i-007")),
            muxer: Arc::new(MockMuxer::new()),
            blob: Some(blob.clone()),
            crypto: Arc::new(
                CryptoService::from_base64_key("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
                    .unwrap(),
            ),
            url_guard: guard.clone(),
            config,
        };

        let state = Arc::new(WebhookState::new(
            jobs.clone(),
            queue.clone(),
            guard,
            SECRET,
            0.0,
            1,
        ));
        let app = webhook_router(state);

        Self {
            jobs,
            users,
            queue,
            llm,
            blob,
            ctx,
            app,
            _work_dir: work_dir,
        }
    }

    fn seed_user(&self) -> Uuid {
        let now = chrono::Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            role: "member".to_string(),
            preferred_llm_model: None,
            encrypted_llm_api_key: None,
            encrypted_music_api_key: None,
            created_at: now,
            updated_at: now,
        };
        let id = user.id;
        self.users.insert(user);
        id
    }

    /// Claim the next task on the topic and run it through the shared stage
    /// skeleton, acking the settlement like the worker does.
    async fn drive(&self, kind: TaskKind) -> TaskResolution {
        let task = self
            .queue
            .dequeue(kind, Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("no task queued on {}", kind.topic()));
        let handler = default_handlers()
            .into_iter()
            .find(|handler| handler.kind() == kind)
            .unwrap();
        let resolution = execute(
            handler.as_ref(),
            &self.ctx,
            task.record.job_id,
            &CancellationToken::new(),
        )
        .await;
        self.queue.ack(&task).await.unwrap();
        resolution
    }

    async fn post_webhook(&self, channel: &str, job_id: Uuid, body: serde_json::Value) -> StatusCode {
        let request = Request::builder()
            .method("POST")
            .uri(format!("/api/v1/webhooks/{SECRET}/{channel}/{job_id}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.app.clone().oneshot(request).await.unwrap().status()
    }

    fn snapshot(&self, job_id: Uuid) -> Job {
        self.jobs.snapshot(job_id).unwrap()
    }
}

fn music_complete_body(task_id: &str) -> serde_json::Value {
    json!({
        "code": 200,
        "msg": "success",
        "data": {
            "callbackType": "complete",
            "task_id": task_id,
            "data": [
                { "id": "s1", "audio_url": "https://cdn1.suno.ai/s1.mp3", "title": "Sunset", "duration": 182.5 },
                { "id": "s2", "audio_url": "https://cdn1.suno.ai/s2.mp3", "title": "Dusk", "duration": 190.0 },
            ],
        },
    })
}

fn image_success_body(task_id: &str) -> serde_json::Value {
    json!({
        "code": 200,
        "data": {
            "taskId": task_id,
            "state": "success",
            "resultJson": "{\"resultUrls\":[\"https://cdn.kie.ai/i1.png\"]}",
        },
    })
}

fn llm_script(harness: &Harness) {
    harness.llm.push_value(json!({
        "prompt": "gentle waves, warm light",
        "style": "ambient, downtempo",
        "title": "Sunset",
        "instrumental": false,
    }));
    harness.llm.push_value(json!({ "song_id": "s1" }));
    harness
        .llm
        .push_value(json!({ "prompt": "a sun melting into the sea" }));
}

#[tokio::test]
async fn happy_path_callback_mode() {
    let harness = Harness::new();
    llm_script(&harness);
    let user_id = harness.seed_user();

    // Create: pending, analyze queued.
    let job = service::create_job(
        harness.jobs.as_ref(),
        harness.queue.as_ref(),
        user_id,
        "sunset over ocean, calming",
        "gpt-4o-mini",
    )
    .await
    .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // Analyze: brief persisted, music task issued, parked on the callback.
    assert_eq!(harness.drive(TaskKind::AnalyzeConcept).await, TaskResolution::Ack);
    assert_eq!(harness.drive(TaskKind::GenerateMusic).await, TaskResolution::Ack);
    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::GeneratingMusic);
    assert!(row.song_prompt.is_some());
    assert_eq!(row.external_music_task_id.as_deref(), Some("m-001"));

    // Music callback resumes the pipeline.
    let status = harness
        .post_webhook("suno", job.id, music_complete_body("m-001"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::SelectingSong);
    assert_eq!(row.generated_songs.len(), 2);

    // Select: choice persisted, image stage scheduled and parked.
    assert_eq!(harness.drive(TaskKind::SelectSong).await, TaskResolution::Ack);
    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::GeneratingImage);
    assert_eq!(row.selected_song_id.as_deref(), Some("s1"));
    assert_eq!(row.audio_url.as_deref(), Some("https://cdn1.suno.ai/s1.mp3"));

    assert_eq!(harness.drive(TaskKind::GenerateImage).await, TaskResolution::Ack);
    assert_eq!(
        harness.snapshot(job.id).external_image_task_id.as_deref(),
        Some("i-007")
    );

    // Image callback resumes again.
    let status = harness
        .post_webhook("nano", job.id, image_success_body("i-007"))
        .await;
    assert_eq!(status, StatusCode::OK);
    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::ProcessingVideo);
    assert_eq!(row.image_url.as_deref(), Some("https://cdn.kie.ai/i1.png"));

    // Mux and upload.
    assert_eq!(harness.drive(TaskKind::ProcessVideo).await, TaskResolution::Ack);
    assert_eq!(harness.snapshot(job.id).status, JobStatus::Uploading);
    assert_eq!(harness.drive(TaskKind::UploadAssets).await, TaskResolution::Ack);

    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::Completed);
    assert_eq!(
        row.video_url.as_deref(),
        Some(format!("https://media.tunereel.app/videos/{}.mp4", job.id).as_str())
    );
    assert_eq!(harness.blob.upload_count(), 1);
}

#[tokio::test]
async fn duplicate_music_callbacks_advance_once() {
    let harness = Harness::new();
    llm_script(&harness);
    let user_id = harness.seed_user();
    let job = service::create_job(
        harness.jobs.as_ref(),
        harness.queue.as_ref(),
        user_id,
        "sunset over ocean, calming",
        "gpt-4o-mini",
    )
    .await
    .unwrap();
    harness.drive(TaskKind::AnalyzeConcept).await;
    harness.drive(TaskKind::GenerateMusic).await;

    // Two copies of the callback land concurrently.
    let (a, b) = tokio::join!(
        harness.post_webhook("suno", job.id, music_complete_body("m-001")),
        harness.post_webhook("suno", job.id, music_complete_body("m-001")),
    );
    assert_eq!(a, StatusCode::OK);
    assert_eq!(b, StatusCode::OK);

    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::SelectingSong);
    assert_eq!(row.generated_songs.len(), 2);
    // Exactly one resume task exists, thanks to the deterministic task id.
    assert_eq!(harness.queue.pending(TaskKind::SelectSong), 1);
}

#[tokio::test]
async fn cancel_during_image_generation_wins_over_callback() {
    let harness = Harness::new();
    llm_script(&harness);
    let user_id = harness.seed_user();
    let job = service::create_job(
        harness.jobs.as_ref(),
        harness.queue.as_ref(),
        user_id,
        "sunset over ocean, calming",
        "gpt-4o-mini",
    )
    .await
    .unwrap();
    harness.drive(TaskKind::AnalyzeConcept).await;
    harness.drive(TaskKind::GenerateMusic).await;
    harness
        .post_webhook("suno", job.id, music_complete_body("m-001"))
        .await;
    harness.drive(TaskKind::SelectSong).await;
    harness.drive(TaskKind::GenerateImage).await;
    assert_eq!(harness.snapshot(job.id).status, JobStatus::GeneratingImage);

    // User cancels while the external task runs.
    assert!(service::cancel_job(harness.jobs.as_ref(), job.id).await.unwrap());

    // The late callback is acknowledged and changes nothing.
    let status = harness
        .post_webhook("nano", job.id, image_success_body("i-007"))
        .await;
    assert_eq!(status, StatusCode::OK);

    let row = harness.snapshot(job.id);
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("job cancelled by user"));
    assert!(row.image_url.is_none());
    assert_eq!(harness.queue.pending(TaskKind::ProcessVideo), 0);
}

#[tokio::test]
async fn unknown_callback_task_id_is_acked() {
    let harness = Harness::new();
    let status = harness
        .post_webhook("nano", Uuid::new_v4(), image_success_body("never-issued"))
        .await;
    assert_eq!(status, StatusCode::OK);
}
