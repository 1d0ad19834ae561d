//! External media metadata resolution.
//!
//! The sync engine never touches media bytes; it only needs a playable
//! stream URL and basic metadata for each room's video. [`MediaResolver`]
//! is the seam: production uses the yt-dlp subprocess backend, tests plug
//! in stubs.

mod probe;
mod ytdlp;

pub use probe::check_stream_available;
pub use ytdlp::YtDlpResolver;

use async_trait::async_trait;

use crate::party::model::VideoFormat;

/// Metadata extracted for a video URL.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub title: Option<String>,
    /// Direct stream URL (may differ from the page URL the user pasted).
    pub stream_url: String,
    /// Seconds; 0 = unknown. Always 0 for HLS, whose durations are not
    /// trusted anywhere in the engine.
    pub duration: f64,
    pub thumbnail: Option<String>,
    pub format: VideoFormat,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// Resolves a user-supplied URL to playable stream metadata.
///
/// `None` means resolution failed or the URL is not recognized; callers
/// fall back to the client-supplied metadata and infer the format from the
/// URL suffix.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Option<MediaInfo>;
}
