//! Shared fixtures for the unit tests in this crate.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tunereel_storage::{MemoryJobStore, MemorySystemPromptStore, MemoryUserStore};

use crate::collaborators::mock::{MockBlob, MockImage, MockLlm, MockMusic, MockMuxer};
use crate::config::Config;
use crate::crypto::CryptoService;
use crate::pipeline::StageContext;
use crate::queue::MemoryQueue;
use crate::urlguard::UrlGuard;

pub(crate) const TEST_KEY_B64: &str = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=";

/// Hosts the fixture guard resolves, all to one public address.
pub(crate) fn static_dns() -> HashMap<String, Vec<IpAddr>> {
    let public: IpAddr = "104.18.7.7".parse().unwrap();
    HashMap::from([
        ("cdn1.suno.ai".to_string(), vec![public]),
        ("cdn.kie.ai".to_string(), vec![public]),
        ("media.tunereel.app".to_string(), vec![public]),
        ("signed.tunereel.app".to_string(), vec![public]),
    ])
}

/// All concrete pieces behind a [`StageContext`], kept reachable so tests
/// can script the doubles and inspect the stores.
pub(crate) struct Fixture {
    pub jobs: Arc<MemoryJobStore>,
    pub users: Arc<MemoryUserStore>,
    pub prompts: Arc<MemorySystemPromptStore>,
    pub queue: Arc<MemoryQueue>,
    pub llm: Arc<MockLlm>,
    pub music: Arc<MockMusic>,
    pub image: Arc<MockImage>,
    pub muxer: Arc<MockMuxer>,
    pub blob: Arc<MockBlob>,
    pub crypto: Arc<CryptoService>,
    pub guard: Arc<UrlGuard>,
    pub config: Arc<Config>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            jobs: Arc::new(MemoryJobStore::new()),
            users: Arc::new(MemoryUserStore::new()),
            prompts: Arc::new(MemorySystemPromptStore::new()),
            queue: Arc::new(MemoryQueue::new()),
            llm: Arc::new(MockLlm::new()),
            music: Arc::new(MockMusic::new("m-001")),
            image: Arc::new(MockImage::new("i-001")),
            muxer: Arc::new(MockMuxer::new()),
            blob: Arc::new(MockBlob::new(Some("https://media.tunereel.app".to_string()))),
            crypto: Arc::new(CryptoService::from_base64_key(TEST_KEY_B64).unwrap()),
            guard: Arc::new(UrlGuard::with_static_dns(
                ["cdn1.suno.ai", "cdn.kie.ai", "media.tunereel.app"],
                static_dns(),
            )),
            config: Arc::new(config),
        }
    }

    /// Insert a plain user and return their id.
    pub fn seed_user(&self) -> uuid::Uuid {
        let now = chrono::Utc::now();
        let user = tunereel_storage::User {
            id: uuid::Uuid::new_v4(),
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

    pub fn context(&self) -> StageContext {
        StageContext {
            jobs: self.jobs.clone(),
            users: self.users.clone(),
            prompts: self.prompts.clone(),
            queue: self.queue.clone(),
            llm: self.llm.clone(),
            music: self.music.clone(),
            image: self.image.clone(),
            muxer: self.muxer.clone(),
            blob: Some(self.blob.clone()),
            crypto: self.crypto.clone(),
            url_guard: self.guard.clone(),
            config: self.config.clone(),
        }
    }

    pub fn context_without_blob(&self) -> StageContext {
        let mut ctx = self.context();
        ctx.blob = None;
        ctx
    }
}

pub(crate) fn context() -> StageContext {
    Fixture::new().context()
}
