use super::error::{DownloadError, DownloadResult};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::task::{AbortHandle, JoinHandle};

/// Called once with the total size (0 when unknown)
pub type BeginHook = Box<dyn Fn(u64) + Send + Sync>;
/// Called with (bytes_written, total) as data arrives
pub type ProgressHook = Box<dyn Fn(u64, u64) + Send + Sync>;

pub struct TransferHooks {
    pub on_begin: BeginHook,
    pub on_progress: ProgressHook,
}

impl TransferHooks {
    pub fn noop() -> Self {
        Self {
            on_begin: Box::new(|_| {}),
            on_progress: Box::new(|_, _| {}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    pub headers: Vec<(String, String)>,
}

impl TransferRequest {
    pub fn new(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Result of a transfer that ran to the end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status_code: u16,
    pub bytes_written: u64,
}

/// Stops one running transfer
#[derive(Debug, Clone)]
pub struct CancelHandle(AbortHandle);

impl CancelHandle {
    pub fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }

    pub fn cancel(&self) {
        self.0.abort();
    }
}

/// A started transfer: its cancel handle and the task that resolves when it ends
pub struct TransferJob {
    pub cancel: CancelHandle,
    pub completion: JoinHandle<DownloadResult<TransferOutcome>>,
}

impl TransferJob {
    /// Run `transfer` on the runtime and wrap it as a job
    pub fn spawn<F>(transfer: F) -> Self
    where
        F: Future<Output = DownloadResult<TransferOutcome>> + Send + 'static,
    {
        let completion = tokio::spawn(transfer);
        Self {
            cancel: CancelHandle::new(completion.abort_handle()),
            completion,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
}

/// File transfer primitive plus the filesystem calls the executor needs.
///
/// Only `begin_transfer` is required; the filesystem methods default to
/// `tokio::fs`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start streaming `request.url` into `request.destination`.
    /// Must be called from within a tokio runtime.
    fn begin_transfer(&self, request: TransferRequest, hooks: TransferHooks) -> TransferJob;

    fn cancel_transfer(&self, handle: &CancelHandle) {
        handle.cancel();
    }

    async fn exists(&self, path: &Path) -> DownloadResult<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn stat(&self, path: &Path) -> DownloadResult<FileStat> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(FileStat {
            size: metadata.len(),
        })
    }

    async fn make_directory(&self, path: &Path) -> DownloadResult<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| DownloadError::Directory {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn delete_file(&self, path: &Path) -> DownloadResult<()> {
        Ok(tokio::fs::remove_file(path).await?)
    }

    /// Remove whatever an abandoned transfer left behind for `destination`
    async fn discard_partial(&self, _destination: &Path) -> DownloadResult<()> {
        Ok(())
    }

    /// Write `content` as UTF-8
    async fn write_text_file(&self, path: &Path, content: &str) -> DownloadResult<()> {
        Ok(tokio::fs::write(path, content.as_bytes()).await?)
    }
}
