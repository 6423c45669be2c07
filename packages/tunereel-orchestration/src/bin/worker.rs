//! Stage worker: pulls tasks from every topic and drives jobs through the
//! pipeline. SIGINT/SIGTERM drains in-flight stages up to the configured
//! deadline, then aborts them; aborted stages settle as retryable.

use tracing::info;
use tunereel_orchestration::bootstrap::{bootstrap, init_tracing, shutdown_signal, stage_context};
use tunereel_orchestration::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = bootstrap().await?;
    let drain_timeout = runtime.config.drain_timeout;
    let ctx = stage_context(&runtime).await?;

    let worker = Worker::new(ctx);
    let shutdown = worker.shutdown_token();
    let cancel = worker.cancel_token();
    let mut running = tokio::spawn(worker.run());

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown requested; draining in-flight stages");
            shutdown.cancel();
            if tokio::time::timeout(drain_timeout, &mut running).await.is_err() {
                info!("drain deadline exceeded; aborting in-flight stages");
                cancel.cancel();
                let _ = running.await;
            }
        }
        _ = &mut running => {}
    }

    info!("worker exited");
    Ok(())
}
