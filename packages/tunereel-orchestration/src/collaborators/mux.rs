//! ffmpeg-backed video assembly: one still image looped under the selected
//! track.
//!
//! Both inputs are downloaded next to the output through the guarded
//! fetcher before ffmpeg starts; the child process only ever sees local
//! files and opens no network connections of its own.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use super::fetch::GuardedFetcher;
use super::{MuxOutput, MuxRequest, VideoMuxer};
use crate::error::{OrchestratorError, Result};
use crate::urlguard::UrlGuard;

const STDERR_TAIL_BYTES: usize = 400;

pub struct FfmpegMuxer {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    fetcher: GuardedFetcher,
}

impl FfmpegMuxer {
    pub fn new(
        ffmpeg_bin: impl Into<String>,
        ffprobe_bin: impl Into<String>,
        guard: Arc<UrlGuard>,
    ) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            fetcher: GuardedFetcher::new(guard),
        }
    }

    async fn probe_duration(&self, path: &Path) -> Result<f64> {
        let output = Command::new(&self.ffprobe_bin)
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                OrchestratorError::collaborator("video muxer", format!("ffprobe: {e}"))
            })?;
        if !output.status.success() {
            return Err(OrchestratorError::collaborator(
                "video muxer",
                format!("ffprobe exited with {}", output.status),
            ));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| {
                OrchestratorError::collaborator("video muxer", "ffprobe returned no duration")
            })
    }

    async fn run_ffmpeg(
        &self,
        audio_path: &Path,
        image_path: &Path,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut child = Command::new(&self.ffmpeg_bin)
            .args(["-y", "-loop", "1", "-i"])
            .arg(image_path)
            .arg("-i")
            .arg(audio_path)
            .args([
                "-c:v",
                "libx264",
                "-tune",
                "stillimage",
                "-c:a",
                "aac",
                "-b:a",
                "192k",
                "-pix_fmt",
                "yuv420p",
                "-shortest",
            ])
            .arg(output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::collaborator("video muxer", format!("spawn ffmpeg: {e}"))
            })?;

        // Drain stderr in the background so a chatty encode cannot stall the
        // pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(mut stream) = stderr {
                let _ = stream.read_to_string(&mut buf).await;
            }
            buf
        });

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                stderr_task.abort();
                return Err(OrchestratorError::Cancelled);
            }
            status = child.wait() => status.map_err(OrchestratorError::transient)?,
        };
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(OrchestratorError::collaborator(
                "video muxer",
                format!("ffmpeg exited with {status}: {}", tail(&stderr_text)),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VideoMuxer for FfmpegMuxer {
    async fn create_music_video(
        &self,
        request: &MuxRequest,
        cancel: &CancellationToken,
    ) -> Result<MuxOutput> {
        let dir = request
            .output_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let audio_path = dir.join(input_name("audio", &request.audio_url));
        let image_path = dir.join(input_name("image", &request.image_url));

        self.fetcher.download(&request.audio_url, &audio_path).await?;
        if let Err(e) = self.fetcher.download(&request.image_url, &image_path).await {
            remove_inputs(&audio_path, &image_path).await;
            return Err(e);
        }

        let run = self
            .run_ffmpeg(&audio_path, &image_path, &request.output_path, cancel)
            .await;
        match run {
            Ok(()) => remove_inputs(&audio_path, &image_path).await,
            // A cancelled run keeps its inputs; the redelivery overwrites
            // them anyway.
            Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(e) => {
                remove_inputs(&audio_path, &image_path).await;
                return Err(e);
            }
        }

        let metadata = tokio::fs::metadata(&request.output_path)
            .await
            .map_err(|e| {
                OrchestratorError::collaborator(
                    "video muxer",
                    format!("ffmpeg produced no output: {e}"),
                )
            })?;
        let duration_seconds = match self.probe_duration(&request.output_path).await {
            Ok(duration) => duration,
            Err(e) => {
                warn!(output = %request.output_path.display(), error = %e, "duration probe failed");
                0.0
            }
        };

        Ok(MuxOutput {
            output_path: request.output_path.clone(),
            file_size: metadata.len(),
            duration_seconds,
        })
    }
}

/// Local filename for a downloaded input, keeping the URL's extension when
/// it has one so format probing has every hint available.
fn input_name(kind: &str, raw_url: &str) -> String {
    let extension = Url::parse(raw_url).ok().and_then(|url| {
        Path::new(url.path())
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
    });
    match extension {
        Some(ext) if !ext.is_empty() => format!("{kind}.{ext}"),
        _ => kind.to_string(),
    }
}

async fn remove_inputs(audio_path: &Path, image_path: &Path) {
    let _ = tokio::fs::remove_file(audio_path).await;
    let _ = tokio::fs::remove_file(image_path).await;
}

fn tail(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed
        .char_indices()
        .rev()
        .nth(STDERR_TAIL_BYTES.saturating_sub(1))
    {
        Some((idx, _)) => &trimmed[idx..],
        None => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_name_keeps_extension() {
        assert_eq!(
            input_name("audio", "https://cdn1.suno.ai/s1.mp3"),
            "audio.mp3"
        );
        assert_eq!(
            input_name("image", "https://cdn.kie.ai/i1.png?sig=abc"),
            "image.png"
        );
    }

    #[test]
    fn test_input_name_without_extension() {
        assert_eq!(input_name("audio", "https://cdn1.suno.ai/stream"), "audio");
        assert_eq!(input_name("image", "not a url"), "image");
    }

    #[test]
    fn test_tail_short_text_untouched() {
        assert_eq!(tail("  some stderr  "), "some stderr");
    }

    #[test]
    fn test_tail_bounds_long_text() {
        let long = "x".repeat(2000);
        assert_eq!(tail(&long).len(), STDERR_TAIL_BYTES);
    }
}
