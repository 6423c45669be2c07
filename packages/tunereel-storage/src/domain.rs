//! Domain layer for tunereel job storage.
//!
//! # Domain Models
//!
//! - `Job`: one unit of user work moving through the generation pipeline
//! - `JobStatus`: the pipeline position, advanced only along the fixed graph
//! - `SongPrompt` / `GeneratedSong` / `ImagePromptSpec`: structured
//!   sub-documents persisted as JSON
//! - `User`: job owner, preferred model, encrypted external API keys
//! - `SystemPrompt`: current default prompt per agent kind
//!
//! # Port Traits
//!
//! - `JobStore`: sole authoritative writer of job rows; every legal status
//!   transition is one typed conditional-update operation
//! - `UserStore`, `SystemPromptStore`: read-mostly lookups used by stage
//!   handlers

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Status graph
// ═══════════════════════════════════════════════════════════════════════════

/// Pipeline position of a job.
///
/// Advances only along the forward edges returned by [`JobStatus::can_advance_to`];
/// every non-terminal state may additionally drop to `Failed`. `Completed` and
/// `Failed` are terminal: no edge leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Analyzing,
    GeneratingMusic,
    SelectingSong,
    GeneratingImage,
    ProcessingVideo,
    Uploading,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Analyzing => "analyzing",
            JobStatus::GeneratingMusic => "generating_music",
            JobStatus::SelectingSong => "selecting_song",
            JobStatus::GeneratingImage => "generating_image",
            JobStatus::ProcessingVideo => "processing_video",
            JobStatus::Uploading => "uploading",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "analyzing" => Ok(JobStatus::Analyzing),
            "generating_music" => Ok(JobStatus::GeneratingMusic),
            "selecting_song" => Ok(JobStatus::SelectingSong),
            "generating_image" => Ok(JobStatus::GeneratingImage),
            "processing_video" => Ok(JobStatus::ProcessingVideo),
            "uploading" => Ok(JobStatus::Uploading),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(StorageError::invalid(format!("unknown job status: {s}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward edge of the status graph. `Failed` is reachable from every
    /// non-terminal state and is not listed here.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Analyzing)
                | (Analyzing, GeneratingMusic)
                | (GeneratingMusic, SelectingSong)
                | (SelectingSong, GeneratingImage)
                | (GeneratingImage, ProcessingVideo)
                | (ProcessingVideo, Uploading)
                | (Uploading, Completed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Structured sub-documents
// ═══════════════════════════════════════════════════════════════════════════

/// Music-generation brief produced by concept analysis.
///
/// `model_tag` names the downstream music model and is chosen by the
/// orchestrator configuration, never by the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SongPrompt {
    pub prompt: String,
    pub style: String,
    pub title: String,
    pub model_tag: String,
    pub instrumental: bool,
}

/// One candidate track returned by the music generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedSong {
    pub id: String,
    pub audio_url: String,
    pub title: String,
    pub duration_seconds: f64,
}

/// Image-generation brief produced for the cover art stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePromptSpec {
    pub prompt: String,
    pub aspect_ratio: String,
    pub resolution: String,
}

// ═══════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════

/// One unit of user work: a concept turned into a finished music video.
///
/// `id`, `user_id`, `concept` and `llm_model` are immutable after creation.
/// Everything else is written exactly once by the stage that owns it, through
/// a conditional update keyed on `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: JobStatus,
    pub concept: String,
    pub llm_model: String,
    pub song_prompt: Option<SongPrompt>,
    pub external_music_task_id: Option<String>,
    /// Empty until the music generator delivers; persisted as NULL when empty.
    pub generated_songs: Vec<GeneratedSong>,
    pub selected_song_id: Option<String>,
    pub image_prompt: Option<ImagePromptSpec>,
    pub external_image_task_id: Option<String>,
    pub audio_url: Option<String>,
    pub image_url: Option<String>,
    pub video_url: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job in `pending`.
    pub fn new(user_id: Uuid, concept: impl Into<String>, llm_model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: JobStatus::Pending,
            concept: concept.into(),
            llm_model: llm_model.into(),
            song_prompt: None,
            external_music_task_id: None,
            generated_songs: Vec::new(),
            selected_song_id: None,
            image_prompt: None,
            external_image_task_id: None,
            audio_url: None,
            image_url: None,
            video_url: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Look up a generated song by id.
    pub fn song_by_id(&self, song_id: &str) -> Option<&GeneratedSong> {
        self.generated_songs.iter().find(|s| s.id == song_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Users and system prompts
// ═══════════════════════════════════════════════════════════════════════════

/// Job owner. External API keys are stored encrypted; decryption happens in
/// the orchestration layer, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: String,
    pub preferred_llm_model: Option<String>,
    pub encrypted_llm_api_key: Option<String>,
    pub encrypted_music_api_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The agent a system prompt belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    ConceptAnalyst,
    SongSelector,
    ImagePrompter,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::ConceptAnalyst => "concept_analyst",
            AgentKind::SongSelector => "song_selector",
            AgentKind::ImagePrompter => "image_prompter",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "concept_analyst" => Ok(AgentKind::ConceptAnalyst),
            "song_selector" => Ok(AgentKind::SongSelector),
            "image_prompter" => Ok(AgentKind::ImagePrompter),
            _ => Err(StorageError::invalid(format!("unknown agent kind: {s}"))),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current default prompt for one agent kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub agent: AgentKind,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Port traits
// ═══════════════════════════════════════════════════════════════════════════

/// Maximum page size honored by `list_by_user`.
pub const MAX_PER_PAGE: u32 = 100;

/// Sole authoritative writer of job rows.
///
/// Every mutation is a conditional update on the current status. A zero-row
/// result with an existing row is a [`StorageError::StatusConflict`]; a
/// zero-row result with no such row is [`StorageError::NotFound`]. Every
/// successful mutation refreshes `updated_at`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new row in `pending`. Fails with `DuplicateId` on collision.
    async fn create(&self, job: &Job) -> Result<()>;

    async fn get_by_id(&self, id: Uuid) -> Result<Job>;

    /// Webhook routing lookup; must be backed by an index.
    async fn get_by_music_task_id(&self, task_id: &str) -> Result<Job>;

    /// Webhook routing lookup; must be backed by an index.
    async fn get_by_image_task_id(&self, task_id: &str) -> Result<Job>;

    /// Page through a user's jobs, newest first. `per_page` is capped at
    /// [`MAX_PER_PAGE`]; `page` is 1-based.
    async fn list_by_user(&self, user_id: Uuid, page: u32, per_page: u32) -> Result<Vec<Job>>;

    /// `pending` → `analyzing`.
    async fn cas_start_analysis(&self, id: Uuid) -> Result<()>;

    /// `analyzing` → `generating_music`, writing `song_prompt`.
    async fn cas_set_song_prompt(&self, id: Uuid, prompt: &SongPrompt) -> Result<()>;

    /// Record the issued music task id. Status stays `generating_music`; the
    /// id is written only if still unset, so the first issue always wins.
    async fn cas_set_music_task_id(&self, id: Uuid, task_id: &str) -> Result<()>;

    /// `generating_music` → `selecting_song`, writing the delivered songs.
    async fn cas_set_generated_songs(
        &self,
        id: Uuid,
        task_id: &str,
        songs: &[GeneratedSong],
    ) -> Result<()>;

    /// `selecting_song` → `generating_image`, writing the choice and its
    /// audio URL.
    async fn cas_set_selected_song(&self, id: Uuid, song_id: &str, audio_url: &str) -> Result<()>;

    /// Write `image_prompt` while in `generating_image`; no status change.
    async fn cas_set_image_prompt(&self, id: Uuid, prompt: &ImagePromptSpec) -> Result<()>;

    /// Record the issued image task id. Status stays `generating_image`; set
    /// once, as with the music task id.
    async fn cas_set_image_task_id(&self, id: Uuid, task_id: &str) -> Result<()>;

    /// `generating_image` → `processing_video`, writing `image_url`.
    async fn cas_set_image_url(&self, id: Uuid, task_id: &str, image_url: &str) -> Result<()>;

    /// `processing_video` → `uploading`. `video_url` is the local artifact
    /// handle at this point, not yet a public URL.
    async fn cas_set_video_url(&self, id: Uuid, video_url: &str) -> Result<()>;

    /// `uploading` → `completed`, replacing the local handle with the final
    /// public URL.
    async fn cas_complete(&self, id: Uuid, final_video_url: &str) -> Result<()>;

    /// Drop to `failed` from any non-terminal state. Returns `true` if the
    /// transition was applied, `false` if the job was already terminal (the
    /// row is left untouched).
    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool>;

    /// Administrative delete. Only terminal jobs may be removed.
    async fn delete(&self, id: Uuid) -> Result<()>;
}

/// Read access to job owners.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_by_id(&self, id: Uuid) -> Result<User>;
}

/// Read access to the current per-agent default prompts.
#[async_trait]
pub trait SystemPromptStore: Send + Sync {
    async fn get(&self, agent: AgentKind) -> Result<SystemPrompt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in &[
            JobStatus::Pending,
            JobStatus::Analyzing,
            JobStatus::GeneratingMusic,
            JobStatus::SelectingSong,
            JobStatus::GeneratingImage,
            JobStatus::ProcessingVideo,
            JobStatus::Uploading,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            let s = status.as_str();
            let parsed = JobStatus::parse(s).unwrap();
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn test_status_parse_invalid() {
        assert!(JobStatus::parse("rendering").is_err());
    }

    #[test]
    fn test_forward_edges() {
        use JobStatus::*;
        assert!(Pending.can_advance_to(Analyzing));
        assert!(Analyzing.can_advance_to(GeneratingMusic));
        assert!(GeneratingMusic.can_advance_to(SelectingSong));
        assert!(SelectingSong.can_advance_to(GeneratingImage));
        assert!(GeneratingImage.can_advance_to(ProcessingVideo));
        assert!(ProcessingVideo.can_advance_to(Uploading));
        assert!(Uploading.can_advance_to(Completed));
    }

    #[test]
    fn test_no_edge_leaves_terminal() {
        use JobStatus::*;
        for next in &[
            Pending,
            Analyzing,
            GeneratingMusic,
            SelectingSong,
            GeneratingImage,
            ProcessingVideo,
            Uploading,
            Completed,
            Failed,
        ] {
            assert!(!Completed.can_advance_to(*next));
            assert!(!Failed.can_advance_to(*next));
        }
    }

    #[test]
    fn test_no_skipping_stages() {
        use JobStatus::*;
        assert!(!Pending.can_advance_to(GeneratingMusic));
        assert!(!Analyzing.can_advance_to(SelectingSong));
        assert!(!GeneratingMusic.can_advance_to(GeneratingImage));
        assert!(!ProcessingVideo.can_advance_to(Completed));
    }

    #[test]
    fn test_new_job_is_pending() {
        let user = Uuid::new_v4();
        let job = Job::new(user, "sunset over ocean, calming", "gpt-4o-mini");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.user_id, user);
        assert!(job.generated_songs.is_empty());
        assert!(job.song_prompt.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn test_song_by_id() {
        let mut job = Job::new(Uuid::new_v4(), "c", "m");
        job.generated_songs = vec![
            GeneratedSong {
                id: "s1".into(),
                audio_url: "https://cdn1.suno.ai/s1.mp3".into(),
                title: "Sunset".into(),
                duration_seconds: 182.5,
            },
            GeneratedSong {
                id: "s2".into(),
                audio_url: "https://cdn1.suno.ai/s2.mp3".into(),
                title: "Dusk".into(),
                duration_seconds: 190.0,
            },
        ];
        assert_eq!(job.song_by_id("s2").unwrap().title, "Dusk");
        assert!(job.song_by_id("s3").is_none());
    }

    #[test]
    fn test_song_prompt_json_roundtrip() {
        let prompt = SongPrompt {
            prompt: "gentle waves, warm light".into(),
            style: "ambient, downtempo".into(),
            title: "Sunset".into(),
            model_tag: "V4".into(),
            instrumental: false,
        };
        let json = serde_json::to_string(&prompt).unwrap();
        let back: SongPrompt = serde_json::from_str(&json).unwrap();
        assert_eq!(prompt, back);
    }

    #[test]
    fn test_agent_kind_roundtrip() {
        for agent in &[
            AgentKind::ConceptAnalyst,
            AgentKind::SongSelector,
            AgentKind::ImagePrompter,
        ] {
            assert_eq!(AgentKind::parse(agent.as_str()).unwrap(), *agent);
        }
        assert!(AgentKind::parse("poet").is_err());
    }
}
