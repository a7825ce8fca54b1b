//! Cover and lyric sidecar files written after a song finishes.
//!
//! Everything here is best effort: failures are logged and never touch
//! the task's status.

use super::error::{DownloadError, DownloadResult};
use super::resolver::SourceResolver;
use super::task::DownloadTask;
use super::transport::{TransferHooks, TransferRequest, Transport};
use crate::app::config::MetadataConfig;
use crate::file::naming::sidecar_path;
use url::Url;

/// Identifying header sent with cover requests
pub const COVER_USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 10; Pixel 3) AppleWebKit/537.36";

pub async fn embed_metadata(
    transport: &dyn Transport,
    resolver: &dyn SourceResolver,
    task: &DownloadTask,
    settings: &MetadataConfig,
) {
    tokio::task::yield_now().await;

    if settings.embed_cover {
        if let Err(e) = download_cover(transport, resolver, task).await {
            tracing::error!(task_id = %task.id, "Failed to save cover: {}", e);
        }
    }

    tokio::task::yield_now().await;

    if settings.embed_lyric {
        if let Err(e) = write_lyric(transport, resolver, task, settings).await {
            tracing::error!(task_id = %task.id, "Failed to save lyric: {}", e);
        }
    }

    tracing::debug!(task_id = %task.id, "Metadata processing finished");
}

async fn download_cover(
    transport: &dyn Transport,
    resolver: &dyn SourceResolver,
    task: &DownloadTask,
) -> DownloadResult<()> {
    let Some(cover_url) = resolver.resolve_cover_url(&task.metadata.music_info).await? else {
        tracing::info!(task_id = %task.id, "No cover found");
        return Ok(());
    };

    let is_http = Url::parse(&cover_url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false);
    if !is_http {
        tracing::warn!(task_id = %task.id, "Skipping cover with unsupported URL: {}", cover_url);
        return Ok(());
    }

    let destination = sidecar_path(&task.metadata.file_path, "jpg");
    let request = TransferRequest::new(cover_url, &destination)
        .with_header("User-Agent", COVER_USER_AGENT);

    let job = transport.begin_transfer(request, TransferHooks::noop());
    let outcome = job.completion.await.map_err(|_| DownloadError::Interrupted)??;

    if outcome.status_code == 200 {
        tracing::info!(task_id = %task.id, "Cover saved to {:?}", destination);
    } else {
        tracing::warn!(task_id = %task.id, "Cover download returned HTTP {}", outcome.status_code);
    }
    Ok(())
}

async fn write_lyric(
    transport: &dyn Transport,
    resolver: &dyn SourceResolver,
    task: &DownloadTask,
    settings: &MetadataConfig,
) -> DownloadResult<()> {
    let Some(lyric) = resolver.resolve_lyric(&task.metadata.music_info).await? else {
        tracing::info!(task_id = %task.id, "No lyric found");
        return Ok(());
    };

    let content = lyric.merged(
        settings.embed_lyric_translation,
        settings.embed_lyric_romanization,
    );
    let destination = sidecar_path(&task.metadata.file_path, "lrc");
    transport.write_text_file(&destination, &content).await?;

    tracing::info!(task_id = %task.id, "Lyric saved to {:?}", destination);
    Ok(())
}
