use super::error::DownloadResult;
use super::task::{MusicInfo, Quality};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct UrlRequest {
    pub music_info: MusicInfo,
    pub quality: Quality,
    /// Skip any cached answer
    pub force_refresh: bool,
    /// Accept a different quality when the requested one is unavailable
    pub allow_quality_fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LyricInfo {
    pub lyric: String,
    pub translated: Option<String>,
    pub romanized: Option<String>,
}

impl LyricInfo {
    /// Concatenate the enabled blocks, separated by a blank line
    pub fn merged(&self, with_translation: bool, with_romanization: bool) -> String {
        let mut content = self.lyric.clone();
        let extras = [
            (with_translation, &self.translated),
            (with_romanization, &self.romanized),
        ];
        for (enabled, block) in extras {
            if let (true, Some(text)) = (enabled, block) {
                if !text.is_empty() {
                    content.push_str("\n\n");
                    content.push_str(text);
                }
            }
        }
        content
    }
}

/// Lookup of playable URLs, cover images and lyrics for a song
#[async_trait]
pub trait SourceResolver: Send + Sync {
    async fn resolve_transfer_url(&self, request: &UrlRequest) -> DownloadResult<String>;

    /// Forget a cached transfer URL after a download from it failed
    fn invalidate_transfer_url(&self, _music_info: &MusicInfo, _quality: Quality) {}

    async fn resolve_cover_url(&self, music_info: &MusicInfo) -> DownloadResult<Option<String>>;

    async fn resolve_lyric(&self, music_info: &MusicInfo) -> DownloadResult<Option<LyricInfo>>;
}
