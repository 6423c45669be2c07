use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("status conflict on job {id}: not in {expected}")]
    StatusConflict { id: Uuid, expected: &'static str },

    #[error("duplicate job id: {0}")]
    DuplicateId(Uuid),

    #[error("invalid data: {0}")]
    Invalid(String),

    #[error("migration {filename} failed: {message}")]
    Migration { filename: String, message: String },
}

impl StorageError {
    pub fn job_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "job",
            key: id.to_string(),
        }
    }

    pub fn user_not_found(id: Uuid) -> Self {
        Self::NotFound {
            entity: "user",
            key: id.to_string(),
        }
    }

    pub fn prompt_not_found(agent: &str) -> Self {
        Self::NotFound {
            entity: "system prompt",
            key: agent.to_string(),
        }
    }

    pub fn task_not_found(task_id: &str) -> Self {
        Self::NotFound {
            entity: "job by external task id",
            key: task_id.to_string(),
        }
    }

    pub fn status_conflict(id: Uuid, expected: &'static str) -> Self {
        Self::StatusConflict { id, expected }
    }

    pub fn invalid<E: std::fmt::Display>(e: E) -> Self {
        Self::Invalid(e.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    pub fn is_status_conflict(&self) -> bool {
        matches!(self, StorageError::StatusConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let id = Uuid::new_v4();
        let err = StorageError::job_not_found(id);
        assert!(err.is_not_found());
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_status_conflict_display() {
        let id = Uuid::new_v4();
        let err = StorageError::status_conflict(id, "uploading");
        assert!(err.is_status_conflict());
        let msg = err.to_string();
        assert!(msg.contains("uploading"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_predicates_are_disjoint() {
        let err = StorageError::DuplicateId(Uuid::new_v4());
        assert!(!err.is_not_found());
        assert!(!err.is_status_conflict());
    }
}
