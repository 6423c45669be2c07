//! Worker pool: one puller per topic, shared handler set, bounded retries
//! with exponential backoff, two-phase shutdown.
//!
//! Shutdown runs in two steps: the shutdown token stops the pullers from
//! claiming new tasks, then (after the drain deadline) the cancel token
//! aborts whatever is still in flight. Aborted stages return retryable and
//! roll back naturally through the status CAS.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::{execute, StageContext, StageHandler, TaskResolution};
use crate::queue::DeliveredTask;
use crate::stage::TaskKind;
use crate::stages::default_handlers;

/// How long a puller blocks on an empty topic before re-checking shutdown.
const DEQUEUE_WAIT: Duration = Duration::from_secs(5);

/// Backoff before an errored puller touches the broker again.
const PULL_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Worker {
    ctx: StageContext,
    handlers: HashMap<TaskKind, Arc<dyn StageHandler>>,
    shutdown: CancellationToken,
    cancel: CancellationToken,
    worker_id: String,
}

impl Worker {
    pub fn new(ctx: StageContext) -> Self {
        let handlers = default_handlers()
            .into_iter()
            .map(|handler| (handler.kind(), handler))
            .collect();
        Self {
            ctx,
            handlers,
            shutdown: CancellationToken::new(),
            cancel: CancellationToken::new(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
        }
    }

    /// Stops pulling new tasks; in-flight stages keep running.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Aborts in-flight stages; they settle as retryable.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until shutdown. One puller task per topic.
    pub async fn run(self) {
        info!(worker_id = %self.worker_id, "worker starting");
        let mut pullers = Vec::with_capacity(TaskKind::ALL.len());
        for kind in TaskKind::ALL {
            let handler = self
                .handlers
                .get(&kind)
                .expect("every task kind has a handler")
                .clone();
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            let cancel = self.cancel.clone();
            pullers.push(tokio::spawn(async move {
                pull_loop(kind, handler, ctx, shutdown, cancel).await;
            }));
        }
        futures::future::join_all(pullers).await;
        info!(worker_id = %self.worker_id, "worker stopped");
    }
}

async fn pull_loop(
    kind: TaskKind,
    handler: Arc<dyn StageHandler>,
    ctx: StageContext,
    shutdown: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let claimed = tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = ctx.queue.dequeue(kind, DEQUEUE_WAIT) => claimed,
        };
        match claimed {
            Ok(Some(task)) => settle(&*handler, &ctx, task, &cancel).await,
            Ok(None) => {}
            Err(e) => {
                warn!(topic = kind.topic(), error = %e, "dequeue failed; backing off");
                tokio::time::sleep(PULL_ERROR_BACKOFF).await;
            }
        }
    }
}

async fn settle(
    handler: &dyn StageHandler,
    ctx: &StageContext,
    task: DeliveredTask,
    cancel: &CancellationToken,
) {
    let job_id = task.record.job_id;
    let resolution = execute(handler, ctx, job_id, cancel).await;
    let settled = match resolution {
        TaskResolution::Ack => ctx.queue.ack(&task).await,
        TaskResolution::Retry => {
            let next_attempt = task.record.attempt + 1;
            if next_attempt >= ctx.config.max_attempts {
                // The job row is the authoritative failure signal; the dead
                // list only preserves the task for operator inspection.
                warn!(
                    %job_id,
                    task = task.kind.as_str(),
                    attempts = next_attempt,
                    "retries exhausted; parking task"
                );
                ctx.queue.bury(&task).await
            } else {
                ctx.queue.requeue(&task, backoff_delay(task.record.attempt)).await
            }
        }
    };
    if let Err(e) = settled {
        warn!(%job_id, task = task.kind.as_str(), error = %e, "task settlement failed");
    }
}

/// 2s, 4s, 8s, ... capped at one minute.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_add(1)).min(60);
    Duration::from_secs(secs)
}
