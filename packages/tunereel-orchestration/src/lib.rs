//! tunereel orchestration: the durable multi-stage pipeline that turns a
//! short user concept into a finished music video.
//!
//! Architecture:
//! - Stage handlers advance one job per task through status-guarded
//!   conditional updates; losers of any race ack and mutate nothing
//! - The queue is the durable continuation: payloads carry only `{ job_id }`,
//!   and the job row is the single rendezvous point
//! - Stages backed by asynchronous external services park the job until the
//!   webhook router (or the polling fallback) resumes it
//! - Every externally-supplied URL passes the SSRF guard before it is stored
//!   or fetched

pub mod agents;
pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod error;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod stage;
pub mod stages;
pub mod urlguard;
pub mod webhook;
pub mod worker;

#[cfg(test)]
mod testutil;

pub use config::{BlobConfig, Config};
pub use crypto::CryptoService;
pub use error::{Disposition, OrchestratorError, Result};
pub use pipeline::{StageContext, StageHandler, TaskResolution};
pub use queue::{
    DeliveredTask, EnqueueOptions, EnqueueOutcome, MemoryQueue, RedisQueue, TaskQueue, TaskRecord,
};
pub use stage::TaskKind;
pub use urlguard::{UrlGuard, UrlRejection};
pub use webhook::{router as webhook_router, WebhookState};
pub use worker::Worker;
