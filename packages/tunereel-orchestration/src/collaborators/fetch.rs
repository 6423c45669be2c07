//! Download externally-supplied media through the SSRF guard.
//!
//! The client is pinned to the exact addresses the guard resolved and
//! checked, so the fetch never performs a second, unvetted DNS resolution.
//! Redirects are refused outright: a redirect target would be a fresh URL
//! that skipped the guard.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use reqwest::redirect::Policy;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{OrchestratorError, Result};
use crate::urlguard::UrlGuard;

pub struct GuardedFetcher {
    guard: Arc<UrlGuard>,
}

impl GuardedFetcher {
    pub fn new(guard: Arc<UrlGuard>) -> Self {
        Self { guard }
    }

    /// Validate `raw_url`, fetch it from the vetted addresses, and write the
    /// body to `dest`. Returns the number of bytes written.
    pub async fn download(&self, raw_url: &str, dest: &Path) -> Result<u64> {
        let vetted = self.guard.vet(raw_url).await.map_err(|reason| {
            OrchestratorError::UrlRejected {
                url: raw_url.to_string(),
                reason,
            }
        })?;

        let pinned: Vec<SocketAddr> = vetted
            .addrs
            .iter()
            .map(|ip| SocketAddr::new(*ip, vetted.port))
            .collect();
        let client = reqwest::Client::builder()
            .resolve_to_addrs(&vetted.host, &pinned)
            .redirect(Policy::none())
            .build()
            .map_err(OrchestratorError::transient)?;

        let mut response = client
            .get(vetted.url.clone())
            .send()
            .await
            .map_err(OrchestratorError::transient)?;
        let status = response.status();
        if status.is_redirection() {
            return Err(OrchestratorError::collaborator(
                "media fetch",
                format!("{} answered with a redirect ({status})", vetted.host),
            ));
        }
        if !status.is_success() {
            return Err(OrchestratorError::collaborator(
                "media fetch",
                format!("{} returned {status}", vetted.host),
            ));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(OrchestratorError::transient)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(OrchestratorError::transient)?
        {
            file.write_all(&chunk)
                .await
                .map_err(OrchestratorError::transient)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(OrchestratorError::transient)?;
        debug!(url = %vetted.url, bytes = written, dest = %dest.display(), "media downloaded");
        Ok(written)
    }
}
