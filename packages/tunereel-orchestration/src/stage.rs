//! Stage task identity.
//!
//! One task kind per pipeline stage; each kind maps to its own broker topic.
//! Stages resumed by an external callback carry a deterministic task id so a
//! duplicate callback cannot schedule the same stage twice concurrently.

use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    AnalyzeConcept,
    GenerateMusic,
    SelectSong,
    GenerateImage,
    ProcessVideo,
    UploadAssets,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::AnalyzeConcept,
        TaskKind::GenerateMusic,
        TaskKind::SelectSong,
        TaskKind::GenerateImage,
        TaskKind::ProcessVideo,
        TaskKind::UploadAssets,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AnalyzeConcept => "analyze_concept",
            TaskKind::GenerateMusic => "generate_music",
            TaskKind::SelectSong => "select_song",
            TaskKind::GenerateImage => "generate_image",
            TaskKind::ProcessVideo => "process_video",
            TaskKind::UploadAssets => "upload_assets",
        }
    }

    /// Broker topic carrying this kind of task.
    pub fn topic(&self) -> &'static str {
        match self {
            TaskKind::AnalyzeConcept => "job:analyze_concept",
            TaskKind::GenerateMusic => "job:generate_music",
            TaskKind::SelectSong => "job:select_song",
            TaskKind::GenerateImage => "job:generate_image",
            TaskKind::ProcessVideo => "job:process_video",
            TaskKind::UploadAssets => "job:upload_assets",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "analyze_concept" => Ok(TaskKind::AnalyzeConcept),
            "generate_music" => Ok(TaskKind::GenerateMusic),
            "select_song" => Ok(TaskKind::SelectSong),
            "generate_image" => Ok(TaskKind::GenerateImage),
            "process_video" => Ok(TaskKind::ProcessVideo),
            "upload_assets" => Ok(TaskKind::UploadAssets),
            _ => Err(OrchestratorError::invalid_input(format!(
                "unknown task kind: {s}"
            ))),
        }
    }

    /// Deterministic dedup id for stages scheduled by callbacks. Synchronous
    /// successors go without one; their pre-state check makes duplicates
    /// harmless.
    pub fn dedup_task_id(&self, job_id: Uuid) -> Option<String> {
        match self {
            TaskKind::SelectSong | TaskKind::ProcessVideo | TaskKind::UploadAssets => {
                Some(format!("{}-{}", self.as_str(), job_id))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
