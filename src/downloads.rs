use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStore;
use crate::error::{AppError, Result};
use crate::progress::{parse_percent, ProgressBroadcaster};
use crate::ytdlp::YtDlp;

/// What the caller wants out of the source media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Both,
}

impl MediaKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "video" => Some(Self::Video),
            "audio" => Some(Self::Audio),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Both => "both",
        }
    }
}

/// Supported output containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Mp4,
    Mp3,
    Wav,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mp4" => Some(Self::Mp4),
            "mp3" => Some(Self::Mp3),
            "wav" => Some(Self::Wav),
            _ => None,
        }
    }

    pub fn ext(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
            Self::Wav => "wav",
        }
    }
}

/// Raw query parameters of a download request, before validation.
#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub link: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub quality: Option<String>,
    pub format: Option<String>,
    pub filename: Option<String>,
    pub id: Option<String>,
}

/// A validated download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub link: String,
    pub kind: MediaKind,
    pub quality: Option<String>,
    pub format: OutputFormat,
    pub filename: Option<String>,
    pub id: Option<String>,
}

impl DownloadRequest {
    /// Purely syntactic validation; nothing is spawned or fetched here.
    pub fn from_query(query: DownloadQuery) -> Result<Self> {
        let link = query
            .link
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| AppError::invalid("Invalid URL"))?;
        let parsed = Url::parse(&link).map_err(|_| AppError::invalid("Invalid URL"))?;
        // Only web URLs reach the extraction tool.
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(AppError::invalid("Invalid URL"));
        }

        let kind = query
            .kind
            .as_deref()
            .and_then(MediaKind::parse)
            .ok_or_else(|| AppError::invalid("Invalid type"))?;

        let quality = query.quality.filter(|q| !q.trim().is_empty());
        if kind == MediaKind::Video && quality.is_none() {
            return Err(AppError::invalid("Quality required for video"));
        }

        let format = query
            .format
            .as_deref()
            .and_then(OutputFormat::parse)
            .ok_or_else(|| AppError::invalid("Invalid format"))?;

        Ok(Self {
            link,
            kind,
            quality,
            format,
            filename: query.filename,
            id: query.id,
        })
    }

    pub fn content_type(&self) -> &'static str {
        match self.kind {
            MediaKind::Audio => match self.format {
                OutputFormat::Mp3 => "audio/mpeg",
                OutputFormat::Wav => "audio/wav",
                OutputFormat::Mp4 => "audio/mp4",
            },
            MediaKind::Video | MediaKind::Both => match self.format {
                OutputFormat::Mp4 => "video/mp4",
                OutputFormat::Mp3 => "video/mp3",
                OutputFormat::Wav => "video/wav",
            },
        }
    }

    /// Name offered in the Content-Disposition header.
    pub fn attachment_filename(&self) -> String {
        let base = self
            .filename
            .as_deref()
            .map(sanitize_filename)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("downloaded_{}", self.kind.as_str()));
        format!("{}.{}", base, self.format.ext())
    }
}

/// Keep attachment names header-safe and free of path tricks.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.' | '(' | ')') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

enum Admission {
    Producer(watch::Sender<()>),
    Waiter(watch::Receiver<()>),
}

/// Ties validation, cache lookups, extraction and progress relay together.
///
/// One producer per fingerprint: concurrent identical requests queue behind
/// the first and re-check the cache once it finishes.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    pub cache: CacheStore,
    pub ytdlp: YtDlp,
    pub progress: ProgressBroadcaster,
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<()>>>>,
}

impl DownloadManager {
    pub fn new(cache: CacheStore, ytdlp: YtDlp, progress: ProgressBroadcaster) -> Self {
        Self {
            cache,
            ytdlp,
            progress,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Return the path of a complete artifact for this request, extracting
    /// it first on a cache miss.
    pub async fn ensure_artifact(&self, request: &DownloadRequest) -> Result<PathBuf> {
        let key = CacheStore::key_for(
            &request.link,
            request.kind,
            request.quality.as_deref(),
            request.format,
        );

        loop {
            if self.cache.has(&key, request.format) {
                debug!("[downloads] cache hit for {}", key);
                return Ok(self.cache.path_for(&key, request.format));
            }

            let admission = {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.get(&key) {
                    Some(rx) => Admission::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(());
                        inflight.insert(key.clone(), rx);
                        Admission::Producer(tx)
                    }
                }
            };

            match admission {
                Admission::Waiter(mut rx) => {
                    // Wakes when the producer drops its sender; loop back and
                    // re-check the cache.
                    let _ = rx.changed().await;
                }
                Admission::Producer(tx) => {
                    let manager = self.clone();
                    let task_key = key.clone();
                    let task_request = request.clone();
                    // Detached task: a caller that disconnects mid-request
                    // must never cancel an already-launched extraction.
                    let task = tokio::spawn(async move {
                        let result = manager.run_extraction(&task_key, &task_request).await;
                        manager.inflight.lock().unwrap().remove(&task_key);
                        drop(tx);
                        result
                    });
                    return match task.await {
                        Ok(result) => result,
                        Err(e) => Err(AppError::ExtractionFailed(format!(
                            "extraction task failed: {}",
                            e
                        ))),
                    };
                }
            }
        }
    }

    async fn run_extraction(&self, key: &str, request: &DownloadRequest) -> Result<PathBuf> {
        let staging = self.cache.staging_path_for(key, request.format);
        let selector = YtDlp::format_selector(request.kind, request.quality.as_deref());
        info!(
            "[downloads] extracting {} -> {}",
            request.link,
            staging.display()
        );

        let mut handle = match self.ytdlp.start_download(
            &request.link,
            &selector,
            request.format.ext(),
            &staging,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.cache.discard_partial(key, request.format);
                return Err(e);
            }
        };

        let mut last_published = -1.0f32;
        while let Some(line) = handle.lines.recv().await {
            let Some(percent) = parse_percent(&line) else {
                continue;
            };
            // The tool repeats and occasionally reorders values; forward
            // strictly increasing ones only.
            if percent <= last_published {
                continue;
            }
            last_published = percent;
            if let Some(id) = &request.id {
                self.progress.publish(id, percent);
            }
        }

        match handle.wait().await {
            Ok(()) => self.cache.commit(key, request.format),
            Err(e) => {
                self.cache.discard_partial(key, request.format);
                warn!("[downloads] extraction failed for {}: {}", request.link, e);
                Err(e)
            }
        }
    }
}
