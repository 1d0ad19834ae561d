//! yt-dlp subprocess backend for media resolution.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::party::model::VideoFormat;
use crate::protocol_constants::RESOLVER_TIMEOUT_SECS;

use super::{MediaInfo, MediaResolver};

/// Resolver shelling out to `yt-dlp -j`.
///
/// Any failure (binary missing, timeout, non-zero exit, unparsable JSON)
/// resolves to `None`; the caller's fallback path handles it.
#[derive(Debug, Default)]
pub struct YtDlpResolver;

impl YtDlpResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, url: &str) -> Option<MediaInfo> {
        let child = Command::new("yt-dlp")
            .arg("--no-warnings")
            .arg("--no-playlist")
            .arg("-j")
            .arg("-f")
            .arg("best")
            // Prefer progressive HTTPS over HLS when both exist; progressive
            // streams carry trustworthy durations.
            .arg("--format-sort")
            .arg("proto:https")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                log::warn!("[Resolver] Failed to spawn yt-dlp: {}", e);
                return None;
            }
        };

        let output = match tokio::time::timeout(
            Duration::from_secs(RESOLVER_TIMEOUT_SECS),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                log::warn!("[Resolver] yt-dlp I/O error: {}", e);
                return None;
            }
            Err(_) => {
                log::warn!("[Resolver] yt-dlp timed out for {}", url);
                return None;
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            log::warn!(
                "[Resolver] yt-dlp exited with {} for {}: {}",
                output.status,
                url,
                stderr.trim()
            );
            return None;
        }

        let value: Value = match serde_json::from_slice(&output.stdout) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("[Resolver] yt-dlp output was not JSON: {}", e);
                return None;
            }
        };

        let info = parse_ytdlp_info(&value);
        if let Some(ref info) = info {
            log::info!(
                "[Resolver] Resolved {} -> {:?} ({:?}, {:.0}s)",
                url,
                info.title,
                info.format,
                info.duration
            );
        }
        info
    }
}

/// Maps one yt-dlp `-j` record to [`MediaInfo`].
///
/// Separate from the subprocess plumbing so the mapping is testable.
fn parse_ytdlp_info(value: &Value) -> Option<MediaInfo> {
    let stream_url = value.get("url").and_then(Value::as_str)?.to_string();

    let ext = value.get("ext").and_then(Value::as_str).unwrap_or("mp4");
    let protocol = value.get("protocol").and_then(Value::as_str).unwrap_or("");
    let format = if stream_url.to_ascii_lowercase().contains(".m3u8")
        || protocol == "m3u8_native"
        || protocol == "m3u8"
    {
        VideoFormat::Hls
    } else {
        VideoFormat::from_ext(ext)
    };

    let duration = if format == VideoFormat::Hls {
        0.0
    } else {
        value
            .get("duration")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .max(0.0)
    };

    // Header keys from yt-dlp vary in casing between extractors.
    let mut user_agent = None;
    let mut referer = None;
    if let Some(headers) = value.get("http_headers").and_then(Value::as_object) {
        for (key, val) in headers {
            match key.to_ascii_lowercase().as_str() {
                "user-agent" => user_agent = val.as_str().map(String::from),
                "referer" => referer = val.as_str().map(String::from),
                _ => {}
            }
        }
    }

    Some(MediaInfo {
        title: value
            .get("title")
            .and_then(Value::as_str)
            .map(String::from),
        stream_url,
        duration,
        thumbnail: value
            .get("thumbnail")
            .and_then(Value::as_str)
            .map(String::from),
        format,
        user_agent,
        referer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_progressive_mp4() {
        let info = parse_ytdlp_info(&json!({
            "title": "Clip",
            "url": "https://cdn/x.mp4",
            "ext": "mp4",
            "duration": 600.0,
            "thumbnail": "https://cdn/t.jpg",
            "http_headers": {"User-Agent": "UA", "Referer": "https://site"}
        }))
        .unwrap();

        assert_eq!(info.title.as_deref(), Some("Clip"));
        assert_eq!(info.stream_url, "https://cdn/x.mp4");
        assert_eq!(info.format, VideoFormat::Mp4);
        assert_eq!(info.duration, 600.0);
        assert_eq!(info.user_agent.as_deref(), Some("UA"));
        assert_eq!(info.referer.as_deref(), Some("https://site"));
    }

    #[test]
    fn hls_duration_is_zeroed() {
        let info = parse_ytdlp_info(&json!({
            "url": "https://cdn/live.m3u8",
            "ext": "mp4",
            "protocol": "m3u8_native",
            "duration": 3600.0
        }))
        .unwrap();

        assert_eq!(info.format, VideoFormat::Hls);
        assert_eq!(info.duration, 0.0);
    }

    #[test]
    fn hls_detected_from_url_suffix() {
        let info = parse_ytdlp_info(&json!({
            "url": "https://cdn/playlist.M3U8?sig=1",
            "ext": "mp4"
        }))
        .unwrap();
        assert_eq!(info.format, VideoFormat::Hls);
    }

    #[test]
    fn missing_stream_url_is_unresolvable() {
        assert!(parse_ytdlp_info(&json!({"title": "x"})).is_none());
    }

    #[test]
    fn header_keys_match_case_insensitively() {
        let info = parse_ytdlp_info(&json!({
            "url": "https://cdn/x.webm",
            "ext": "webm",
            "http_headers": {"user-agent": "ua-low", "REFERER": "ref-up"}
        }))
        .unwrap();
        assert_eq!(info.format, VideoFormat::Webm);
        assert_eq!(info.user_agent.as_deref(), Some("ua-low"));
        assert_eq!(info.referer.as_deref(), Some("ref-up"));
    }

    #[test]
    fn negative_duration_clamps_to_zero() {
        let info = parse_ytdlp_info(&json!({
            "url": "https://cdn/x.mp4",
            "ext": "mp4",
            "duration": -5.0
        }))
        .unwrap();
        assert_eq!(info.duration, 0.0);
    }
}
