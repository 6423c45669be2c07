//! Process configuration, read from the environment at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use url::Url;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::stage::TaskKind;

/// Blob storage settings. Absent entirely when no bucket is configured, in
/// which case jobs fail at the upload stage.
#[derive(Debug, Clone)]
pub struct BlobConfig {
    pub bucket: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub public_base_url: Option<String>,
}

impl BlobConfig {
    /// Hosts that final video URLs will live on. Seeded into the URL guard's
    /// allowlist at startup so our own upload output passes validation.
    pub fn derived_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for candidate in [&self.public_base_url, &self.endpoint] {
            if let Some(raw) = candidate {
                if let Ok(parsed) = Url::parse(raw) {
                    if let Some(host) = parsed.host_str() {
                        hosts.push(host.to_ascii_lowercase());
                    }
                }
            }
        }
        if let Some(region) = &self.region {
            hosts.push(format!("{}.s3.{}.amazonaws.com", self.bucket, region));
        }
        hosts
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    /// Required by the surrounding API surface; unused by the pipeline.
    pub jwt_secret: String,
    /// Base64-encoded 32-byte AEAD key for API keys at rest.
    pub crypto_encryption_key: String,
    /// Public base for callback URLs. `None` switches the async stages to
    /// polling mode.
    pub webhook_base_url: Option<String>,
    pub webhook_secret: String,
    pub webhook_allowed_hosts: Vec<String>,
    pub webhook_rate_limit_rps: f64,
    pub webhook_rate_limit_burst: u32,
    pub webhook_listen_addr: SocketAddr,
    pub kie_base_url: String,
    pub kie_api_key: Option<String>,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub default_llm_model: String,
    /// Music model tag sent downstream; chosen here, never by the LLM.
    pub music_model_tag: String,
    pub image_aspect_ratio: String,
    pub image_resolution: String,
    pub blob: Option<BlobConfig>,
    pub work_dir: PathBuf,
    pub max_attempts: u32,
    pub drain_timeout: Duration,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub llm_stage_timeout: Duration,
    pub music_stage_timeout: Duration,
    pub image_stage_timeout: Duration,
    pub video_stage_timeout: Duration,
    pub upload_stage_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: String::new(),
            jwt_secret: String::new(),
            crypto_encryption_key: String::new(),
            webhook_base_url: None,
            webhook_secret: String::new(),
            webhook_allowed_hosts: Vec::new(),
            webhook_rate_limit_rps: 50.0,
            webhook_rate_limit_burst: 100,
            webhook_listen_addr: "0.0.0.0:8081".parse().expect("static addr"),
            kie_base_url: "https://api.kie.ai".to_string(),
            kie_api_key: None,
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: None,
            default_llm_model: "gpt-4o-mini".to_string(),
            music_model_tag: "V4".to_string(),
            image_aspect_ratio: "16:9".to_string(),
            image_resolution: "1920x1080".to_string(),
            blob: None,
            work_dir: std::env::temp_dir().join("tunereel"),
            max_attempts: 3,
            drain_timeout: Duration::from_secs(30),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            llm_stage_timeout: Duration::from_secs(2 * 60),
            music_stage_timeout: Duration::from_secs(10 * 60),
            image_stage_timeout: Duration::from_secs(5 * 60),
            video_stage_timeout: Duration::from_secs(15 * 60),
            upload_stage_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String> {
            match lookup(key) {
                Some(v) if !v.trim().is_empty() => Ok(v),
                _ => Err(OrchestratorError::config(format!("{key} is not set"))),
            }
        };
        let optional = |key: &str| -> Option<String> {
            lookup(key).filter(|v| !v.trim().is_empty())
        };

        let mut config = Config {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            jwt_secret: required("JWT_SECRET")?,
            crypto_encryption_key: required("CRYPTO_ENCRYPTION_KEY")?,
            webhook_base_url: optional("WEBHOOK_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
            webhook_secret: required("WEBHOOK_SECRET")?,
            kie_base_url: required("KIE_BASE_URL")?
                .trim_end_matches('/')
                .to_string(),
            kie_api_key: optional("KIE_API_KEY"),
            ..Config::default()
        };

        config.webhook_allowed_hosts = optional("WEBHOOK_ALLOWED_HOSTS")
            .map(|raw| {
                raw.split(',')
                    .map(|h| h.trim().to_ascii_lowercase())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(rps) = optional("WEBHOOK_RATE_LIMIT_RPS") {
            config.webhook_rate_limit_rps = rps
                .parse()
                .map_err(|_| OrchestratorError::config("WEBHOOK_RATE_LIMIT_RPS must be a number"))?;
        }
        if let Some(burst) = optional("WEBHOOK_RATE_LIMIT_BURST") {
            config.webhook_rate_limit_burst = burst.parse().map_err(|_| {
                OrchestratorError::config("WEBHOOK_RATE_LIMIT_BURST must be an integer")
            })?;
        }
        if let Some(addr) = optional("WEBHOOK_LISTEN_ADDR") {
            config.webhook_listen_addr = addr
                .parse()
                .map_err(|_| OrchestratorError::config("WEBHOOK_LISTEN_ADDR must be host:port"))?;
        }
        if let Some(url) = optional("LLM_BASE_URL") {
            config.llm_base_url = url.trim_end_matches('/').to_string();
        }
        config.llm_api_key = optional("LLM_API_KEY");
        if let Some(model) = optional("LLM_DEFAULT_MODEL") {
            config.default_llm_model = model;
        }
        if let Some(tag) = optional("MUSIC_MODEL_TAG") {
            config.music_model_tag = tag;
        }
        if let Some(dir) = optional("WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(attempts) = optional("WORKER_MAX_ATTEMPTS") {
            config.max_attempts = attempts
                .parse()
                .map_err(|_| OrchestratorError::config("WORKER_MAX_ATTEMPTS must be an integer"))?;
        }
        if let Some(secs) = optional("WORKER_DRAIN_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                OrchestratorError::config("WORKER_DRAIN_TIMEOUT_SECS must be an integer")
            })?;
            config.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(bin) = optional("FFMPEG_BIN") {
            config.ffmpeg_bin = bin;
        }
        if let Some(bin) = optional("FFPROBE_BIN") {
            config.ffprobe_bin = bin;
        }

        config.blob = optional("BLOB_BUCKET").map(|bucket| BlobConfig {
            bucket,
            region: optional("BLOB_REGION"),
            endpoint: optional("BLOB_ENDPOINT"),
            public_base_url: optional("BLOB_PUBLIC_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string()),
        });

        Ok(config)
    }

    /// Callback mode is on when a public webhook base is configured.
    pub fn callback_mode(&self) -> bool {
        self.webhook_base_url.is_some()
    }

    pub fn music_callback_url(&self, job_id: Uuid) -> Option<String> {
        self.webhook_base_url
            .as_ref()
            .map(|base| format!("{base}/api/v1/webhooks/{}/suno/{job_id}", self.webhook_secret))
    }

    pub fn image_callback_url(&self, job_id: Uuid) -> Option<String> {
        self.webhook_base_url
            .as_ref()
            .map(|base| format!("{base}/api/v1/webhooks/{}/nano/{job_id}", self.webhook_secret))
    }

    pub fn stage_timeout(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::AnalyzeConcept | TaskKind::SelectSong => self.llm_stage_timeout,
            TaskKind::GenerateMusic => self.music_stage_timeout,
            TaskKind::GenerateImage => self.image_stage_timeout,
            TaskKind::ProcessVideo => self.video_stage_timeout,
            TaskKind::UploadAssets => self.upload_stage_timeout,
        }
    }

    /// Per-job artifact directory; owned by exactly one handler at a time.
    pub fn job_work_dir(&self, job_id: Uuid) -> PathBuf {
        self.work_dir.join(job_id.to_string())
    }

    /// Every host the URL guard accepts at startup: the configured allowlist
    /// plus the hosts our own blob store serves from.
    pub fn seed_allowed_hosts(&self) -> Vec<String> {
        let mut hosts = self.webhook_allowed_hosts.clone();
        if let Some(blob) = &self.blob {
            hosts.extend(blob.derived_hosts());
        }
        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/tunereel"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("JWT_SECRET", "jwt"),
            ("CRYPTO_ENCRYPTION_KEY", "a2V5"),
            ("WEBHOOK_SECRET", "hook-secret"),
            ("KIE_BASE_URL", "https://api.kie.ai/"),
        ])
    }

    fn config_from(vars: HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_minimal_env_parses_polling_mode() {
        let config = config_from(base_vars()).unwrap();
        assert!(!config.callback_mode());
        assert!(config.music_callback_url(Uuid::new_v4()).is_none());
        assert_eq!(config.kie_base_url, "https://api.kie.ai");
        assert_eq!(config.max_attempts, 3);
        assert!(config.blob.is_none());
    }

    #[test]
    fn test_missing_required_var_errors() {
        let mut vars = base_vars();
        vars.remove("DATABASE_URL");
        let err = config_from(vars).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn test_callback_urls_carry_secret_and_job_id() {
        let mut vars = base_vars();
        vars.insert("WEBHOOK_BASE_URL", "https://hooks.tunereel.app/");
        let config = config_from(vars).unwrap();
        assert!(config.callback_mode());
        let job_id = Uuid::new_v4();
        assert_eq!(
            config.music_callback_url(job_id).unwrap(),
            format!("https://hooks.tunereel.app/api/v1/webhooks/hook-secret/suno/{job_id}")
        );
        assert_eq!(
            config.image_callback_url(job_id).unwrap(),
            format!("https://hooks.tunereel.app/api/v1/webhooks/hook-secret/nano/{job_id}")
        );
    }

    #[test]
    fn test_allowed_hosts_split_and_lowercased() {
        let mut vars = base_vars();
        vars.insert("WEBHOOK_ALLOWED_HOSTS", "CDN1.Suno.ai, cdn.kie.ai ,");
        let config = config_from(vars).unwrap();
        assert_eq!(
            config.webhook_allowed_hosts,
            vec!["cdn1.suno.ai".to_string(), "cdn.kie.ai".to_string()]
        );
    }

    #[test]
    fn test_blob_config_and_derived_hosts() {
        let mut vars = base_vars();
        vars.insert("BLOB_BUCKET", "tunereel-media");
        vars.insert("BLOB_REGION", "us-east-1");
        vars.insert("BLOB_PUBLIC_BASE_URL", "https://media.tunereel.app/");
        let config = config_from(vars).unwrap();
        let blob = config.blob.as_ref().unwrap();
        let hosts = blob.derived_hosts();
        assert!(hosts.contains(&"media.tunereel.app".to_string()));
        assert!(hosts.contains(&"tunereel-media.s3.us-east-1.amazonaws.com".to_string()));
        assert!(config
            .seed_allowed_hosts()
            .contains(&"media.tunereel.app".to_string()));
    }

    #[test]
    fn test_stage_timeout_defaults() {
        let config = config_from(base_vars()).unwrap();
        assert_eq!(
            config.stage_timeout(TaskKind::AnalyzeConcept),
            Duration::from_secs(120)
        );
        assert_eq!(
            config.stage_timeout(TaskKind::GenerateMusic),
            Duration::from_secs(600)
        );
        assert_eq!(
            config.stage_timeout(TaskKind::ProcessVideo),
            Duration::from_secs(900)
        );
    }
}
