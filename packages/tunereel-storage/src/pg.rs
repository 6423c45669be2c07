//! PostgreSQL adapters for the storage ports.
//!
//! Every transition is a single conditional `UPDATE ... WHERE status = $expected`;
//! the row count disambiguates between a lost race (`StatusConflict`) and a
//! missing row (`NotFound`). Handlers never read-modify-write the status
//! column.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::{
    AgentKind, GeneratedSong, ImagePromptSpec, Job, JobStatus, JobStore, SongPrompt, SystemPrompt,
    SystemPromptStore, User, UserStore, MAX_PER_PAGE,
};
use crate::error::{Result, StorageError};

const JOB_COLUMNS: &str = "id, user_id, status, concept, llm_model, song_prompt, \
     external_music_task_id, generated_songs, selected_song_id, image_prompt, \
     external_image_task_id, audio_url, image_url, video_url, error_message, \
     created_at, updated_at";

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let song_prompt: Option<Json<SongPrompt>> = row.try_get("song_prompt")?;
    let generated_songs: Option<Json<Vec<GeneratedSong>>> = row.try_get("generated_songs")?;
    let image_prompt: Option<Json<ImagePromptSpec>> = row.try_get("image_prompt")?;
    Ok(Job {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        status: JobStatus::parse(&status)?,
        concept: row.try_get("concept")?,
        llm_model: row.try_get("llm_model")?,
        song_prompt: song_prompt.map(|p| p.0),
        external_music_task_id: row.try_get("external_music_task_id")?,
        generated_songs: generated_songs.map(|s| s.0).unwrap_or_default(),
        selected_song_id: row.try_get("selected_song_id")?,
        image_prompt: image_prompt.map(|p| p.0),
        external_image_task_id: row.try_get("external_image_task_id")?,
        audio_url: row.try_get("audio_url")?,
        image_url: row.try_get("image_url")?,
        video_url: row.try_get("video_url")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Turn a zero-row conditional update into the right error: the row is
    /// either in another state or gone entirely.
    async fn zero_rows(&self, id: Uuid, expected: &'static str) -> StorageError {
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match exists {
            Ok(Some(_)) => StorageError::status_conflict(id, expected),
            Ok(None) => StorageError::job_not_found(id),
            Err(e) => StorageError::Database(e),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, user_id, status, concept, llm_model, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(job.user_id)
        .bind(job.status.as_str())
        .bind(&job.concept)
        .bind(&job.llm_model)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StorageError::DuplicateId(job.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Job> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::job_not_found(id))?;
        job_from_row(&row)
    }

    async fn get_by_music_task_id(&self, task_id: &str) -> Result<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE external_music_task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::task_not_found(task_id))?;
        job_from_row(&row)
    }

    async fn get_by_image_task_id(&self, task_id: &str) -> Result<Job> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE external_image_task_id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::task_not_found(task_id))?;
        job_from_row(&row)
    }

    async fn list_by_user(&self, user_id: Uuid, page: u32, per_page: u32) -> Result<Vec<Job>> {
        let per_page = per_page.clamp(1, MAX_PER_PAGE) as i64;
        let offset = (page.max(1) as i64 - 1) * per_page;
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = $1 \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(per_page)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn cas_start_analysis(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'analyzing', updated_at = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "pending").await);
        }
        Ok(())
    }

    async fn cas_set_song_prompt(&self, id: Uuid, prompt: &SongPrompt) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'generating_music', song_prompt = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'analyzing'",
        )
        .bind(id)
        .bind(Json(prompt))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "analyzing").await);
        }
        Ok(())
    }

    async fn cas_set_music_task_id(&self, id: Uuid, task_id: &str) -> Result<()> {
        // The id column is written once; a retry that already issued a task
        // observes zero rows and backs off.
        let result = sqlx::query(
            "UPDATE jobs SET external_music_task_id = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'generating_music' \
             AND external_music_task_id IS NULL",
        )
        .bind(id)
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "generating_music").await);
        }
        Ok(())
    }

    async fn cas_set_generated_songs(
        &self,
        id: Uuid,
        task_id: &str,
        songs: &[GeneratedSong],
    ) -> Result<()> {
        let payload = if songs.is_empty() {
            None
        } else {
            Some(Json(songs.to_vec()))
        };
        let result = sqlx::query(
            "UPDATE jobs SET status = 'selecting_song', generated_songs = $2, \
             external_music_task_id = COALESCE(external_music_task_id, $3), updated_at = $4 \
             WHERE id = $1 AND status = 'generating_music'",
        )
        .bind(id)
        .bind(payload)
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "generating_music").await);
        }
        Ok(())
    }

    async fn cas_set_selected_song(&self, id: Uuid, song_id: &str, audio_url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'generating_image', selected_song_id = $2, \
             audio_url = $3, updated_at = $4 \
             WHERE id = $1 AND status = 'selecting_song'",
        )
        .bind(id)
        .bind(song_id)
        .bind(audio_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "selecting_song").await);
        }
        Ok(())
    }

    async fn cas_set_image_prompt(&self, id: Uuid, prompt: &ImagePromptSpec) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET image_prompt = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'generating_image'",
        )
        .bind(id)
        .bind(Json(prompt))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "generating_image").await);
        }
        Ok(())
    }

    async fn cas_set_image_task_id(&self, id: Uuid, task_id: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET external_image_task_id = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'generating_image' \
             AND external_image_task_id IS NULL",
        )
        .bind(id)
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "generating_image").await);
        }
        Ok(())
    }

    async fn cas_set_image_url(&self, id: Uuid, task_id: &str, image_url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'processing_video', image_url = $2, \
             external_image_task_id = COALESCE(external_image_task_id, $3), updated_at = $4 \
             WHERE id = $1 AND status = 'generating_image'",
        )
        .bind(id)
        .bind(image_url)
        .bind(task_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "generating_image").await);
        }
        Ok(())
    }

    async fn cas_set_video_url(&self, id: Uuid, video_url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'uploading', video_url = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'processing_video'",
        )
        .bind(id)
        .bind(video_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "processing_video").await);
        }
        Ok(())
    }

    async fn cas_complete(&self, id: Uuid, final_video_url: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'completed', video_url = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'uploading'",
        )
        .bind(id)
        .bind(final_video_url)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.zero_rows(id, "uploading").await);
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'failed', error_message = $2, updated_at = $3 \
             WHERE id = $1 AND status NOT IN ('completed', 'failed')",
        )
        .bind(id)
        .bind(error_message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        // Terminal rows are left untouched; a missing row is still an error.
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(StorageError::job_not_found(id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id = $1 AND status IN ('completed', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let exists = sqlx::query("SELECT 1 FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Err(StorageError::invalid("only terminal jobs may be deleted")),
            None => Err(StorageError::job_not_found(id)),
        }
    }
}

pub struct PgUserStore {
    pool: PgPool,
}

impl PgUserStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn get_by_id(&self, id: Uuid) -> Result<User> {
        let row = sqlx::query(
            "SELECT id, role, preferred_llm_model, encrypted_llm_api_key, \
             encrypted_music_api_key, created_at, updated_at FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::user_not_found(id))?;
        Ok(User {
            id: row.try_get("id")?,
            role: row.try_get("role")?,
            preferred_llm_model: row.try_get("preferred_llm_model")?,
            encrypted_llm_api_key: row.try_get("encrypted_llm_api_key")?,
            encrypted_music_api_key: row.try_get("encrypted_music_api_key")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

pub struct PgSystemPromptStore {
    pool: PgPool,
}

impl PgSystemPromptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SystemPromptStore for PgSystemPromptStore {
    async fn get(&self, agent: AgentKind) -> Result<SystemPrompt> {
        let row = sqlx::query(
            "SELECT agent, content, updated_at FROM system_prompts WHERE agent = $1",
        )
        .bind(agent.as_str())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::prompt_not_found(agent.as_str()))?;
        let agent_str: String = row.try_get("agent")?;
        Ok(SystemPrompt {
            agent: AgentKind::parse(&agent_str)?,
            content: row.try_get("content")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
