use reqwest::header::RANGE;

use crate::error::{AppError, Result};
use crate::ytdlp::YtDlp;

/// Upper bound on preview size. Enough audio for a few seconds of playback
/// without pulling a meaningful share of the full artifact.
pub const PREVIEW_MAX_BYTES: u64 = 131_072;

/// Fetch the opening bytes of a link's best audio stream.
///
/// Resolves the direct media URL first, then issues a bounded range request
/// against it. Hosts that ignore the Range header answer 200 with the full
/// body, so the cap is enforced here as well: reading stops at
/// [`PREVIEW_MAX_BYTES`] no matter what the host sends. Nothing touches the
/// cache; previews are always live.
pub async fn fetch_preview(
    ytdlp: &YtDlp,
    client: &reqwest::Client,
    link: &str,
) -> Result<Vec<u8>> {
    let direct_url = ytdlp
        .resolve_direct_url(link, "bestaudio/best")
        .await
        .map_err(|e| AppError::PreviewFailed(e.to_string()))?;

    let mut response = client
        .get(&direct_url)
        .header(RANGE, format!("bytes=0-{}", PREVIEW_MAX_BYTES - 1))
        .send()
        .await
        .map_err(|e| AppError::PreviewFailed(format!("stream request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(AppError::PreviewFailed(format!(
            "stream responded with {}",
            response.status()
        )));
    }

    let cap = PREVIEW_MAX_BYTES as usize;
    let mut body = Vec::with_capacity(cap.min(16 * 1024));
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| AppError::PreviewFailed(format!("stream read failed: {}", e)))?
    {
        let remaining = cap - body.len();
        if chunk.len() >= remaining {
            body.extend_from_slice(&chunk[..remaining]);
            break;
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}
