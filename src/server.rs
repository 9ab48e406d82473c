use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tokio::fs::File;
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;

use crate::downloads::{DownloadManager, DownloadQuery, DownloadRequest, MediaKind};
use crate::error::{AppError, Result};
use crate::preview::fetch_preview;
use crate::progress::ProgressBroadcaster;
use crate::ytdlp::YtDlp;

#[derive(Clone)]
pub struct AppState {
    pub downloads: DownloadManager,
    pub http: reqwest::Client,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/download", get(download))
        .route("/preview", get(preview))
        .route("/resolve", get(resolve))
        .route("/progress", get(progress_ws))
        .with_state(state)
}

/// GET /download?link=..&type=..&quality=..&format=..&filename=..&id=..
///
/// Serves the cached artifact when one exists, otherwise extracts it first.
/// The response body streams from disk; headers advertise the attachment
/// name and media type of the requested output.
async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let request = DownloadRequest::from_query(query)?;
    let path = state.downloads.ensure_artifact(&request).await?;

    let file = File::open(&path).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(CONTENT_TYPE, request.content_type())
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", request.attachment_filename()),
        )
        .body(body)
        .map_err(|e| AppError::ExtractionFailed(format!("could not build response: {}", e)))
}

#[derive(Debug, Deserialize)]
struct ResolveQuery {
    link: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    quality: Option<String>,
}

fn validated_link(link: Option<String>) -> Result<String> {
    let link = link
        .filter(|l| !l.trim().is_empty())
        .ok_or_else(|| AppError::invalid("Invalid URL"))?;
    let parsed = Url::parse(&link).map_err(|_| AppError::invalid("Invalid URL"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::invalid("Invalid URL"));
    }
    Ok(link)
}

/// GET /preview?link=..
///
/// Serves the opening bytes of the link's best audio stream, capped at the
/// preview size, without caching anything.
async fn preview(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Response> {
    let link = validated_link(query.link)?;
    let body = fetch_preview(&state.downloads.ytdlp, &state.http, &link).await?;

    Response::builder()
        .header(CONTENT_TYPE, "audio/mpeg")
        .body(Body::from(body))
        .map_err(|e| AppError::PreviewFailed(format!("could not build response: {}", e)))
}

/// GET /resolve?link=..&type=..&quality=..
///
/// Returns the direct media URL for a link without downloading it. Defaults
/// to the best audio stream when no type is given.
async fn resolve(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<serde_json::Value>> {
    let link = validated_link(query.link)?;
    let kind = match query.kind.as_deref() {
        None => MediaKind::Audio,
        Some(raw) => MediaKind::parse(raw).ok_or_else(|| AppError::invalid("Invalid type"))?,
    };
    let selector = YtDlp::format_selector(kind, query.quality.as_deref());
    let url = state
        .downloads
        .ytdlp
        .resolve_direct_url(&link, &selector)
        .await?;
    Ok(Json(serde_json::json!({ "url": url })))
}

/// GET /progress, upgraded to a WebSocket carrying progress events as JSON
/// text frames.
async fn progress_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let broadcaster = state.downloads.progress.clone();
    ws.on_upgrade(move |socket| relay_progress(socket, broadcaster))
}

async fn relay_progress(mut socket: WebSocket, broadcaster: ProgressBroadcaster) {
    let mut events = broadcaster.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let Ok(text) = serde_json::to_string(&event) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // A slow listener loses old events; newer ones keep flowing.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("[ws] listener lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(_)) => {}
                _ => break,
            },
        }
    }
    debug!("[ws] progress listener disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::downloads::OutputFormat;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> AppState {
        let cache = CacheStore::new(dir.join("cache"), Duration::from_secs(60 * 60)).unwrap();
        // A tool path that cannot run; these tests must never reach it.
        let ytdlp = YtDlp::new(PathBuf::from("/nonexistent/tool-for-tests"));
        AppState {
            downloads: DownloadManager::new(cache, ytdlp, ProgressBroadcaster::new(16)),
            http: reqwest::Client::new(),
        }
    }

    async fn get_response(state: AppState, uri: &str) -> axum::response::Response {
        router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn download_rejects_malformed_query() {
        let dir = tempfile::tempdir().unwrap();
        let response = get_response(
            test_state(dir.path()),
            "/download?link=notaurl&type=audio&format=mp3",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Invalid URL" }));
    }

    #[tokio::test]
    async fn download_requires_quality_for_video() {
        let dir = tempfile::tempdir().unwrap();
        let response = get_response(
            test_state(dir.path()),
            "/download?link=https://x/y&type=video&format=mp4",
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Quality required for video" }));
    }

    #[tokio::test]
    async fn download_serves_cached_artifact_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let key = CacheStore::key_for("https://x/y", MediaKind::Audio, None, OutputFormat::Mp3);
        let cache = state.downloads.cache.clone();
        std::fs::write(cache.staging_path_for(&key, OutputFormat::Mp3), b"cached bytes").unwrap();
        cache.commit(&key, OutputFormat::Mp3).unwrap();

        let response = get_response(
            state,
            "/download?link=https://x/y&type=audio&format=mp3&filename=tune&id=r1",
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        assert_eq!(
            response.headers().get(CONTENT_DISPOSITION).unwrap(),
            "attachment; filename=\"tune.mp3\""
        );

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"cached bytes");
    }

    #[tokio::test]
    async fn preview_rejects_missing_link() {
        let dir = tempfile::tempdir().unwrap();
        let response = get_response(test_state(dir.path()), "/preview").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn preview_rejects_non_web_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let response =
            get_response(test_state(dir.path()), "/preview?link=ftp://host/file").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Invalid URL" }));
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_type() {
        let dir = tempfile::tempdir().unwrap();
        let response =
            get_response(test_state(dir.path()), "/resolve?link=https://x/y&type=gif").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Invalid type" }));
    }
}
