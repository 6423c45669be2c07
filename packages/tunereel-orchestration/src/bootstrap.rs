//! Process startup shared by the worker and webhook binaries.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunereel_storage::{
    JobStore, PgJobStore, PgSystemPromptStore, PgUserStore, SystemPromptStore, UserStore,
};

use crate::collaborators::{
    BlobStore, FfmpegMuxer, HttpLlmClient, KieClient, S3BlobStore,
};
use crate::config::Config;
use crate::crypto::CryptoService;
use crate::pipeline::StageContext;
use crate::queue::{RedisQueue, TaskQueue};
use crate::urlguard::UrlGuard;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

/// Shared process state: configuration, schema-migrated pool, broker
/// connection, stores, and the seeded URL guard.
pub struct Runtime {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub jobs: Arc<dyn JobStore>,
    pub users: Arc<dyn UserStore>,
    pub prompts: Arc<dyn SystemPromptStore>,
    pub queue: Arc<dyn TaskQueue>,
    pub url_guard: Arc<UrlGuard>,
}

pub async fn bootstrap() -> anyhow::Result<Runtime> {
    let config = Arc::new(Config::from_env()?);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    tunereel_storage::migrate::run(&pool).await?;

    let client = redis::Client::open(config.redis_url.as_str())?;
    let conn = redis::aio::ConnectionManager::new(client).await?;
    let queue: Arc<dyn TaskQueue> = Arc::new(RedisQueue::new(conn));

    let url_guard = Arc::new(UrlGuard::new(config.seed_allowed_hosts()));
    info!(
        mode = if config.callback_mode() { "callback" } else { "polling" },
        allowed_hosts = ?url_guard.allowed_hosts(),
        "runtime assembled"
    );

    Ok(Runtime {
        jobs: Arc::new(PgJobStore::new(pool.clone())),
        users: Arc::new(PgUserStore::new(pool.clone())),
        prompts: Arc::new(PgSystemPromptStore::new(pool.clone())),
        config,
        pool,
        queue,
        url_guard,
    })
}

/// Full stage context for the worker: the runtime plus every collaborator
/// adapter.
pub async fn stage_context(runtime: &Runtime) -> anyhow::Result<StageContext> {
    let config = &runtime.config;
    let crypto = Arc::new(CryptoService::from_base64_key(&config.crypto_encryption_key)?);
    let llm = Arc::new(HttpLlmClient::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
    ));
    let kie = Arc::new(KieClient::new(
        config.kie_base_url.clone(),
        config.kie_api_key.clone(),
    ));
    let blob: Option<Arc<dyn BlobStore>> = match &config.blob {
        Some(blob_config) => Some(Arc::new(S3BlobStore::from_config(blob_config).await?)),
        None => None,
    };

    Ok(StageContext {
        jobs: runtime.jobs.clone(),
        users: runtime.users.clone(),
        prompts: runtime.prompts.clone(),
        queue: runtime.queue.clone(),
        llm,
        music: kie.clone(),
        image: kie,
        muxer: Arc::new(FfmpegMuxer::new(
            config.ffmpeg_bin.clone(),
            config.ffprobe_bin.clone(),
            runtime.url_guard.clone(),
        )),
        blob,
        crypto,
        url_guard: runtime.url_guard.clone(),
        config: config.clone(),
    })
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("ctrl-c handler installs");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("sigterm handler installs")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
