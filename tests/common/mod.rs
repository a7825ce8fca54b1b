#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::time::{Duration, timeout};
use tunegrab::app::config::{DownloadConfig, MetadataConfig};
use tunegrab::download::error::{DownloadError, DownloadResult};
use tunegrab::download::manager::DownloadManager;
use tunegrab::download::resolver::{LyricInfo, SourceResolver, UrlRequest};
use tunegrab::download::task::{DownloadTask, MusicInfo, Quality, TaskId, TaskStatus};
use tunegrab::download::transport::{
    TransferHooks, TransferJob, TransferOutcome, TransferRequest, Transport,
};

/// How `MockTransport::begin_transfer` behaves
#[derive(Debug, Clone, Copy)]
pub enum TransferMode {
    /// Transfers stay open until the test drives them
    Manual,
    /// Transfers finish at once with `status`, writing `bytes` bytes on 200
    Instant { status: u16, bytes: u64 },
}

/// A transfer started in manual mode; the test plays the network
pub struct ManualTransfer {
    pub url: String,
    pub destination: PathBuf,
    pub headers: Vec<(String, String)>,
    hooks: TransferHooks,
    finish: Mutex<Option<oneshot::Sender<DownloadResult<TransferOutcome>>>>,
}

impl ManualTransfer {
    pub fn begin(&self, total: u64) {
        (self.hooks.on_begin)(total);
    }

    pub fn progress(&self, written: u64, total: u64) {
        (self.hooks.on_progress)(written, total);
    }

    /// Finish with `status`; a 200 writes `bytes` zero bytes to the destination
    pub fn complete(&self, status: u16, bytes: u64) {
        if status == 200 {
            std::fs::write(&self.destination, vec![0u8; bytes as usize]).unwrap();
        }
        self.send(Ok(TransferOutcome {
            status_code: status,
            bytes_written: if status == 200 { bytes } else { 0 },
        }));
    }

    pub fn fail(&self, message: &str) {
        self.send(Err(DownloadError::Io(std::io::Error::other(message.to_string()))));
    }

    /// False once the job was cancelled or finished
    pub fn is_open(&self) -> bool {
        self.finish
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn send(&self, result: DownloadResult<TransferOutcome>) {
        if let Some(tx) = self.finish.lock().unwrap().take() {
            // Receiver is gone when the job was cancelled
            let _ = tx.send(result);
        }
    }
}

pub struct MockTransport {
    mode: Mutex<TransferMode>,
    transfers: Mutex<Vec<Arc<ManualTransfer>>>,
    discarded: Mutex<Vec<PathBuf>>,
    directory_race: AtomicBool,
}

impl MockTransport {
    pub fn new(mode: TransferMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            transfers: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            directory_race: AtomicBool::new(false),
        }
    }

    /// Make `make_directory` create the directory and still report failure,
    /// as when another run created it first
    pub fn race_directory_creation(&self, enabled: bool) {
        self.directory_race.store(enabled, Ordering::SeqCst);
    }

    /// Wait until staged data for `destination` has been discarded
    pub async fn wait_for_discard(&self, destination: &Path) {
        timeout(Duration::from_secs(5), async {
            while !self.discarded().iter().any(|p| p == destination) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timeout waiting for discard of {:?}", destination))
    }

    pub fn set_mode(&self, mode: TransferMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Every transfer begun so far, in order
    pub fn transfers(&self) -> Vec<Arc<ManualTransfer>> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfers.lock().unwrap().len()
    }

    pub fn transfer_for(&self, url: &str) -> Option<Arc<ManualTransfer>> {
        self.transfers().into_iter().find(|t| t.url == url)
    }

    pub fn started_urls(&self) -> Vec<String> {
        self.transfers().iter().map(|t| t.url.clone()).collect()
    }

    pub fn discarded(&self) -> Vec<PathBuf> {
        self.discarded.lock().unwrap().clone()
    }

    /// Wait until at least `count` transfers have begun; returns them all
    pub async fn wait_for_transfers(&self, count: usize) -> Vec<Arc<ManualTransfer>> {
        timeout(Duration::from_secs(5), async {
            loop {
                if self.transfer_count() >= count {
                    return self.transfers();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Timeout waiting for {} transfers", count))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn begin_transfer(&self, request: TransferRequest, hooks: TransferHooks) -> TransferJob {
        let mode = *self.mode.lock().unwrap();
        let (tx, rx) = oneshot::channel();
        let transfer = Arc::new(ManualTransfer {
            url: request.url,
            destination: request.destination,
            headers: request.headers,
            hooks,
            finish: Mutex::new(Some(tx)),
        });
        self.transfers.lock().unwrap().push(transfer.clone());

        if let TransferMode::Instant { status, bytes } = mode {
            if status == 200 {
                transfer.begin(bytes);
                transfer.progress(bytes, bytes);
            }
            transfer.complete(status, bytes);
        }

        TransferJob::spawn(async move { rx.await.unwrap_or(Err(DownloadError::Interrupted)) })
    }

    async fn make_directory(&self, path: &Path) -> DownloadResult<()> {
        let created = tokio::fs::create_dir_all(path).await;
        if self.directory_race.load(Ordering::SeqCst) {
            return Err(DownloadError::Directory {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "already exists"),
            });
        }
        created.map_err(|source| DownloadError::Directory {
            path: path.to_path_buf(),
            source,
        })
    }

    async fn discard_partial(&self, destination: &Path) -> DownloadResult<()> {
        self.discarded.lock().unwrap().push(destination.to_path_buf());
        Ok(())
    }
}

/// Lookup service double with call counters
#[derive(Default)]
pub struct MockResolver {
    pub url_calls: AtomicUsize,
    pub cover_calls: AtomicUsize,
    pub lyric_calls: AtomicUsize,
    pub invalidations: AtomicUsize,
    requests: Mutex<Vec<UrlRequest>>,
    url_error: Mutex<Option<String>>,
    cover_url: Mutex<Option<String>>,
    cover_error: Mutex<Option<String>>,
    lyric: Mutex<Option<LyricInfo>>,
    lyric_error: Mutex<Option<String>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_urls(&self, message: Option<&str>) {
        *self.url_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_cover_url(&self, url: Option<&str>) {
        *self.cover_url.lock().unwrap() = url.map(str::to_string);
    }

    pub fn fail_covers(&self, message: Option<&str>) {
        *self.cover_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn set_lyric(&self, lyric: Option<LyricInfo>) {
        *self.lyric.lock().unwrap() = lyric;
    }

    pub fn fail_lyrics(&self, message: Option<&str>) {
        *self.lyric_error.lock().unwrap() = message.map(str::to_string);
    }

    pub fn url_requests(&self) -> Vec<UrlRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn url_call_count(&self) -> usize {
        self.url_calls.load(Ordering::SeqCst)
    }

    /// URL the mock hands out for `info`
    pub fn url_for(info: &MusicInfo) -> String {
        format!("http://cdn.test/{}/{}", info.source, info.id)
    }
}

#[async_trait]
impl SourceResolver for MockResolver {
    async fn resolve_transfer_url(&self, request: &UrlRequest) -> DownloadResult<String> {
        self.url_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(message) = self.url_error.lock().unwrap().clone() {
            return Err(DownloadError::resolve(message));
        }
        Ok(Self::url_for(&request.music_info))
    }

    fn invalidate_transfer_url(&self, _music_info: &MusicInfo, _quality: Quality) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    async fn resolve_cover_url(&self, _music_info: &MusicInfo) -> DownloadResult<Option<String>> {
        self.cover_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.cover_error.lock().unwrap().clone() {
            return Err(DownloadError::resolve(message));
        }
        Ok(self.cover_url.lock().unwrap().clone())
    }

    async fn resolve_lyric(&self, _music_info: &MusicInfo) -> DownloadResult<Option<LyricInfo>> {
        self.lyric_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.lyric_error.lock().unwrap().clone() {
            return Err(DownloadError::resolve(message));
        }
        Ok(self.lyric.lock().unwrap().clone())
    }
}

pub struct TestHarness {
    pub manager: DownloadManager,
    pub transport: Arc<MockTransport>,
    pub resolver: Arc<MockResolver>,
}

/// Manager over mocks with post-processing switched off
pub fn create_test_manager(save_dir: Option<&Path>, max_concurrent: usize) -> TestHarness {
    create_test_manager_with(save_dir, max_concurrent, no_metadata(), TransferMode::Manual)
}

pub fn create_test_manager_with(
    save_dir: Option<&Path>,
    max_concurrent: usize,
    metadata: MetadataConfig,
    mode: TransferMode,
) -> TestHarness {
    let transport = Arc::new(MockTransport::new(mode));
    let resolver = Arc::new(MockResolver::new());
    let download = DownloadConfig {
        save_path: save_dir.map(Path::to_path_buf),
        max_concurrent,
        ..DownloadConfig::default()
    };
    let manager = DownloadManager::new(download, metadata, transport.clone(), resolver.clone());
    TestHarness {
        manager,
        transport,
        resolver,
    }
}

pub fn no_metadata() -> MetadataConfig {
    MetadataConfig {
        embed_cover: false,
        embed_lyric: false,
        embed_lyric_translation: false,
        embed_lyric_romanization: false,
    }
}

/// A song with a unique id and readable name
pub fn song(id: &str) -> MusicInfo {
    MusicInfo {
        id: id.to_string(),
        name: format!("Song {}", id),
        singer: "Artist".to_string(),
        source: "kw".to_string(),
        album: None,
    }
}

/// Helper to wait for a task to reach a specific status
pub async fn wait_for_status(
    manager: &DownloadManager,
    task_id: &TaskId,
    expected_status: TaskStatus,
    timeout_secs: u64,
) -> Result<DownloadTask, String> {
    timeout(Duration::from_secs(timeout_secs), async {
        loop {
            if let Some(task) = manager.get_task(task_id) {
                if task.status == expected_status {
                    return task;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| {
        let actual = manager.get_task(task_id).map(|t| t.status);
        format!("Timeout waiting for status {:?} (now {:?})", expected_status, actual)
    })
}

/// Wait until no task holds a slot
pub async fn wait_until_idle(manager: &DownloadManager, timeout_secs: u64) {
    timeout(Duration::from_secs(timeout_secs), async {
        while manager.running_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timeout waiting for the queue to go idle");
}

/// Route library logs to the test output
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Generate test file content of a specific size
pub fn generate_test_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_content() {
        let content = generate_test_content(100);
        assert_eq!(content.len(), 100);
        assert_eq!(content[0], 0);
        assert_eq!(content[99], 99);
    }

    #[test]
    fn test_song_helper() {
        let info = song("7");
        assert_eq!(info.name, "Song 7");
        assert_eq!(MockResolver::url_for(&info), "http://cdn.test/kw/7");
    }
}
