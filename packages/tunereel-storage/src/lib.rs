//! Durable state for the tunereel generation pipeline.
//!
//! The job row is the single rendezvous point of the whole system: stage
//! handlers and webhook callbacks advance it exclusively through the typed
//! conditional-update operations of [`JobStore`], so concurrent deliveries
//! race on the database instead of in application code.
//!
//! - `domain`: models, the status graph, and the port traits
//! - `pg`: PostgreSQL adapters (sqlx)
//! - `memory`: in-memory adapters with identical semantics, for tests
//! - `migrate`: embedded schema migrations

pub mod domain;
pub mod error;
pub mod memory;
pub mod migrate;
pub mod pg;

pub use domain::{
    AgentKind, GeneratedSong, ImagePromptSpec, Job, JobStatus, JobStore, SongPrompt, SystemPrompt,
    SystemPromptStore, User, UserStore, MAX_PER_PAGE,
};
pub use error::{Result, StorageError};
pub use memory::{MemoryJobStore, MemorySystemPromptStore, MemoryUserStore};
pub use pg::{PgJobStore, PgSystemPromptStore, PgUserStore};
