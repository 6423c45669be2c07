//! Webhook ingress daemon: receives generator completion callbacks and
//! resumes parked jobs.

use std::sync::Arc;

use tracing::info;
use tunereel_orchestration::bootstrap::{bootstrap, init_tracing, shutdown_signal};
use tunereel_orchestration::{webhook_router, WebhookState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let runtime = bootstrap().await?;
    let config = runtime.config.clone();

    let state = Arc::new(WebhookState::new(
        runtime.jobs.clone(),
        runtime.queue.clone(),
        runtime.url_guard.clone(),
        config.webhook_secret.clone(),
        config.webhook_rate_limit_rps,
        config.webhook_rate_limit_burst,
    ));
    let app = webhook_router(state);

    let listener = tokio::net::TcpListener::bind(config.webhook_listen_addr).await?;
    info!(addr = %config.webhook_listen_addr, "webhook ingress listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("webhook ingress exited");
    Ok(())
}
