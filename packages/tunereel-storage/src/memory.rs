//! In-memory adapters for the storage ports.
//!
//! Same conditional-update semantics as the Postgres adapter, backed by a
//! mutex-guarded map. Used by unit and scenario tests across the workspace.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::domain::{
    AgentKind, GeneratedSong, ImagePromptSpec, Job, JobStatus, JobStore, SongPrompt, SystemPrompt,
    SystemPromptStore, User, UserStore, MAX_PER_PAGE,
};
use crate::error::{Result, StorageError};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct read of the stored row, bypassing the port. Test helper.
    pub fn snapshot(&self, id: Uuid) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    /// Apply `mutate` if the row exists and `guard` accepts it, refreshing
    /// `updated_at` to a strictly later instant.
    fn cas<G, M>(&self, id: Uuid, expected: &'static str, guard: G, mutate: M) -> Result<()>
    where
        G: FnOnce(&Job) -> bool,
        M: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or_else(|| StorageError::job_not_found(id))?;
        if !guard(job) {
            return Err(StorageError::status_conflict(id, expected));
        }
        mutate(job);
        let now = Utc::now();
        job.updated_at = if now > job.updated_at {
            now
        } else {
            job.updated_at + Duration::microseconds(1)
        };
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateId(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::job_not_found(id))
    }

    async fn get_by_music_task_id(&self, task_id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.external_music_task_id.as_deref() == Some(task_id))
            .cloned()
            .ok_or_else(|| StorageError::task_not_found(task_id))
    }

    async fn get_by_image_task_id(&self, task_id: &str) -> Result<Job> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .find(|j| j.external_image_task_id.as_deref() == Some(task_id))
            .cloned()
            .ok_or_else(|| StorageError::task_not_found(task_id))
    }

    async fn list_by_user(&self, user_id: Uuid, page: u32, per_page: u32) -> Result<Vec<Job>> {
        let per_page = per_page.clamp(1, MAX_PER_PAGE) as usize;
        let page = page.max(1) as usize;
        let mut rows: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect())
    }

    async fn cas_start_analysis(&self, id: Uuid) -> Result<()> {
        self.cas(
            id,
            "pending",
            |j| j.status == JobStatus::Pending,
            |j| j.status = JobStatus::Analyzing,
        )
    }

    async fn cas_set_song_prompt(&self, id: Uuid, prompt: &SongPrompt) -> Result<()> {
        self.cas(
            id,
            "analyzing",
            |j| j.status == JobStatus::Analyzing,
            |j| {
                j.song_prompt = Some(prompt.clone());
                j.status = JobStatus::GeneratingMusic;
            },
        )
    }

    async fn cas_set_music_task_id(&self, id: Uuid, task_id: &str) -> Result<()> {
        self.cas(
            id,
            "generating_music",
            |j| j.status == JobStatus::GeneratingMusic && j.external_music_task_id.is_none(),
            |j| j.external_music_task_id = Some(task_id.to_string()),
        )
    }

    async fn cas_set_generated_songs(
        &self,
        id: Uuid,
        task_id: &str,
        songs: &[GeneratedSong],
    ) -> Result<()> {
        self.cas(
            id,
            "generating_music",
            |j| j.status == JobStatus::GeneratingMusic,
            |j| {
                if j.external_music_task_id.is_none() {
                    j.external_music_task_id = Some(task_id.to_string());
                }
                j.generated_songs = songs.to_vec();
                j.status = JobStatus::SelectingSong;
            },
        )
    }

    async fn cas_set_selected_song(&self, id: Uuid, song_id: &str, audio_url: &str) -> Result<()> {
        self.cas(
            id,
            "selecting_song",
            |j| j.status == JobStatus::SelectingSong,
            |j| {
                j.selected_song_id = Some(song_id.to_string());
                j.audio_url = Some(audio_url.to_string());
                j.status = JobStatus::GeneratingImage;
            },
        )
    }

    async fn cas_set_image_prompt(&self, id: Uuid, prompt: &ImagePromptSpec) -> Result<()> {
        self.cas(
            id,
            "generating_image",
            |j| j.status == JobStatus::GeneratingImage,
            |j| j.image_prompt = Some(prompt.clone()),
        )
    }

    async fn cas_set_image_task_id(&self, id: Uuid, task_id: &str) -> Result<()> {
        self.cas(
            id,
            "generating_image",
            |j| j.status == JobStatus::GeneratingImage && j.external_image_task_id.is_none(),
            |j| j.external_image_task_id = Some(task_id.to_string()),
        )
    }

    async fn cas_set_image_url(&self, id: Uuid, task_id: &str, image_url: &str) -> Result<()> {
        self.cas(
            id,
            "generating_image",
            |j| j.status == JobStatus::GeneratingImage,
            |j| {
                if j.external_image_task_id.is_none() {
                    j.external_image_task_id = Some(task_id.to_string());
                }
                j.image_url = Some(image_url.to_string());
                j.status = JobStatus::ProcessingVideo;
            },
        )
    }

    async fn cas_set_video_url(&self, id: Uuid, video_url: &str) -> Result<()> {
        self.cas(
            id,
            "processing_video",
            |j| j.status == JobStatus::ProcessingVideo,
            |j| {
                j.video_url = Some(video_url.to_string());
                j.status = JobStatus::Uploading;
            },
        )
    }

    async fn cas_complete(&self, id: Uuid, final_video_url: &str) -> Result<()> {
        self.cas(
            id,
            "uploading",
            |j| j.status == JobStatus::Uploading,
            |j| {
                j.video_url = Some(final_video_url.to_string());
                j.status = JobStatus::Completed;
            },
        )
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(&id).ok_or_else(|| StorageError::job_not_found(id))?;
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.error_message = Some(error_message.to_string());
        let now = Utc::now();
        job.updated_at = if now > job.updated_at {
            now
        } else {
            job.updated_at + Duration::microseconds(1)
        };
        Ok(true)
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get(&id).ok_or_else(|| StorageError::job_not_found(id))?;
        if !job.status.is_terminal() {
            return Err(StorageError::invalid("only terminal jobs may be deleted"));
        }
        jobs.remove(&id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: Mutex<HashMap<Uuid, User>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, user: User) {
        self.users.lock().unwrap().insert(user.id, user);
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        self.users
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::user_not_found(id))
    }
}

/// Prompt store preloaded with workable defaults for every agent kind.
pub struct MemorySystemPromptStore {
    prompts: Mutex<HashMap<AgentKind, SystemPrompt>>,
}

impl MemorySystemPromptStore {
    pub fn new() -> Self {
        let mut prompts = HashMap::new();
        for agent in [
            AgentKind::ConceptAnalyst,
            AgentKind::SongSelector,
            AgentKind::ImagePrompter,
        ] {
            prompts.insert(
                agent,
                SystemPrompt {
                    agent,
                    content: format!("You are the {} agent.", agent),
                    updated_at: Utc::now(),
                },
            );
        }
        Self {
            prompts: Mutex::new(prompts),
        }
    }

    pub fn set(&self, agent: AgentKind, content: impl Into<String>) {
        self.prompts.lock().unwrap().insert(
            agent,
            SystemPrompt {
                agent,
                content: content.into(),
                updated_at: Utc::now(),
            },
        );
    }
}

impl Default for MemorySystemPromptStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemPromptStore for MemorySystemPromptStore {
    async fn get(&self, agent: AgentKind) -> Result<SystemPrompt> {
        self.prompts
            .lock()
            .unwrap()
            .get(&agent)
            .cloned()
            .ok_or_else(|| StorageError::prompt_not_found(agent.as_str()))
    }
}
