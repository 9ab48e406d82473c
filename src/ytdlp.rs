use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

use crate::downloads::MediaKind;
use crate::error::{AppError, Result};

const DEFAULT_BIN: &str = "yt-dlp";
const DEFAULT_MAX_HEIGHT: &str = "1080";

/// How many trailing stderr lines are kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 5;

/// Wrapper around the external yt-dlp executable.
#[derive(Debug, Clone)]
pub struct YtDlp {
    bin: PathBuf,
}

impl YtDlp {
    pub fn new(bin: PathBuf) -> Self {
        Self { bin }
    }

    /// Resolve the executable from `YTDLP_BIN`, falling back to `yt-dlp` on
    /// the PATH.
    pub fn from_env() -> Self {
        let bin = std::env::var("YTDLP_BIN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BIN));
        Self::new(bin)
    }

    /// Build the tool's format selector for a request.
    ///
    /// Audio-only requests take the best audio stream. Video requests bound
    /// the vertical resolution by the quality token (`4k` normalizes to
    /// `4000`, absent quality to 1080) and fall back to best video + audio.
    pub fn format_selector(kind: MediaKind, quality: Option<&str>) -> String {
        match kind {
            MediaKind::Audio => "bestaudio/best".to_string(),
            MediaKind::Video | MediaKind::Both => {
                format!(
                    "bestvideo[height<=?{}]+bestaudio/best",
                    normalize_quality(quality)
                )
            }
        }
    }

    /// Ask the tool for a direct media URL without downloading anything.
    pub async fn resolve_direct_url(&self, url: &str, selector: &str) -> Result<String> {
        let output = Command::new(&self.bin)
            .args(["-g", "-f", selector, "--no-warnings", url])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                AppError::ExtractionFailed(format!(
                    "failed to run {}: {}",
                    self.bin.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(AppError::ExtractionFailed(format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| AppError::ExtractionFailed("no stream URL found".to_string()))
    }

    /// Launch a download writing the final artifact to `dest`.
    ///
    /// The returned handle exposes the tool's output as it arrives, line by
    /// line; completion is observed through [`DownloadHandle::wait`].
    pub fn start_download(
        &self,
        url: &str,
        selector: &str,
        merge_format: &str,
        dest: &Path,
    ) -> Result<DownloadHandle> {
        let mut child = Command::new(&self.bin)
            .arg("-f")
            .arg(selector)
            .arg("--merge-output-format")
            .arg(merge_format)
            .arg("--output")
            .arg(dest)
            .arg("--no-check-certificate")
            .arg("--no-warnings")
            .arg("--progress")
            .arg("--newline")
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AppError::ExtractionFailed(format!(
                    "failed to spawn {}: {}",
                    self.bin.display(),
                    e
                ))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::ExtractionFailed("could not capture process stdout".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            AppError::ExtractionFailed("could not capture process stderr".to_string())
        })?;

        let (tx, lines) = mpsc::channel(64);
        let stderr_tail = Arc::new(Mutex::new(Vec::new()));

        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if stdout_tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        let tail = stderr_tail.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("[ytdlp] stderr: {}", line);
                tail.lock().unwrap().push(line.clone());
                if tx.send(line).await.is_err() {
                    break;
                }
            }
        });

        Ok(DownloadHandle {
            lines,
            child,
            dest: dest.to_path_buf(),
            stderr_tail,
        })
    }
}

/// A running download: its output line stream and terminal outcome.
pub struct DownloadHandle {
    pub lines: mpsc::Receiver<String>,
    child: Child,
    dest: PathBuf,
    stderr_tail: Arc<Mutex<Vec<String>>>,
}

impl DownloadHandle {
    /// Await process exit. Non-zero status and a zero exit that produced no
    /// output file both normalize to an extraction failure.
    pub async fn wait(mut self) -> Result<()> {
        let status = self.child.wait().await.map_err(|e| {
            AppError::ExtractionFailed(format!("failed waiting for process: {}", e))
        })?;

        if !status.success() {
            let tail = {
                let lines = self.stderr_tail.lock().unwrap();
                let skip = lines.len().saturating_sub(STDERR_TAIL_LINES);
                lines[skip..].join("; ")
            };
            let detail = if tail.is_empty() {
                format!("process exited with {}", status)
            } else {
                format!("process exited with {}: {}", status, tail)
            };
            return Err(AppError::ExtractionFailed(detail));
        }

        if !self.dest.is_file() {
            return Err(AppError::ExtractionFailed(
                "no output file was produced".to_string(),
            ));
        }
        Ok(())
    }
}

fn normalize_quality(quality: Option<&str>) -> String {
    match quality {
        Some(q) => match q.strip_suffix('k') {
            Some(n) => format!("{}000", n),
            None => q.to_string(),
        },
        None => DEFAULT_MAX_HEIGHT.to_string(),
    }
}
