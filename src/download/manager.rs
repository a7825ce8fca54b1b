use super::api_resolver::HttpResolver;
use super::error::DownloadResult;
use super::http_client::HttpTransport;
use super::resolver::SourceResolver;
use super::store::{StoreEvent, TaskStore};
use super::task::{DownloadTask, TaskId};
use super::transport::{CancelHandle, Transport};
use crate::app::config::{Config, DownloadConfig, MetadataConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};

/// A claimed task: the run that owns it and, once started, its transfer
pub(crate) struct InFlight {
    pub(crate) generation: u64,
    pub(crate) cancel: Option<CancelHandle>,
}

/// Handle to the download queue.
///
/// Cheap to clone; all clones share the same store, in-flight map and
/// collaborators. Scheduling lives in `queue_controller.rs`, the per-task
/// lifecycle in `executor.rs`.
#[derive(Clone)]
pub struct DownloadManager {
    pub(crate) store: TaskStore,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resolver: Arc<dyn SourceResolver>,

    /// Task id -> owning run. Keys equal the store's running set.
    pub(crate) in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    /// Last applied progress sample per task
    pub(crate) progress_throttle: Arc<Mutex<HashMap<TaskId, Instant>>>,

    metadata: Arc<RwLock<MetadataConfig>>,
    pub(crate) next_generation: Arc<AtomicU64>,
    pub(crate) post_processing: Arc<AtomicUsize>,
    /// While set, no task is admitted
    pub(crate) held: Arc<AtomicBool>,
}

impl DownloadManager {
    pub fn new(
        download: DownloadConfig,
        metadata: MetadataConfig,
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self {
            store: TaskStore::new(download),
            transport,
            resolver,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            progress_throttle: Arc::new(Mutex::new(HashMap::new())),
            metadata: Arc::new(RwLock::new(metadata)),
            next_generation: Arc::new(AtomicU64::new(1)),
            post_processing: Arc::new(AtomicUsize::new(0)),
            held: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build with the HTTP transport and lookup client described by `config`
    pub fn from_config(config: &Config) -> DownloadResult<Self> {
        let transport = HttpTransport::from_config(&config.network)?;
        let resolver = HttpResolver::from_config(&config.resolver, &config.network)?;
        Ok(Self::new(
            config.download.clone(),
            config.metadata.clone(),
            Arc::new(transport),
            Arc::new(resolver),
        ))
    }

    pub(crate) fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<TaskId, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_throttle(&self) -> MutexGuard<'_, HashMap<TaskId, Instant>> {
        self.progress_throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Queries ---

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn task_list(&self) -> Vec<DownloadTask> {
        self.store.task_list()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<DownloadTask> {
        self.store.get_task(id)
    }

    /// Number of tasks holding a slot
    pub fn running_count(&self) -> usize {
        self.lock_in_flight().len()
    }

    pub fn is_running(&self, id: &TaskId) -> bool {
        self.lock_in_flight().contains_key(id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    /// Cover/lyric jobs still running
    pub fn pending_post_processing(&self) -> usize {
        self.post_processing.load(Ordering::Acquire)
    }

    /// Wait until detached cover/lyric jobs finish or `timeout` elapses.
    /// Returns true when none are left.
    pub async fn wait_for_post_processing(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_post_processing() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    // --- Configuration ---

    pub fn download_config(&self) -> DownloadConfig {
        self.store.config()
    }

    /// Change queue settings; takes effect on the next scheduling pass
    pub fn update_download_config<F>(&self, update: F) -> DownloadConfig
    where
        F: FnOnce(&mut DownloadConfig),
    {
        let config = self.store.update_config(update);
        tracing::info!(
            "Download config updated: max_concurrent={}, quality={}",
            config.max_concurrent,
            config.quality
        );
        self.schedule_process_queue();
        config
    }

    pub fn metadata_config(&self) -> MetadataConfig {
        self.metadata
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_metadata_config(&self, metadata: MetadataConfig) {
        *self.metadata.write().unwrap_or_else(PoisonError::into_inner) = metadata;
    }

    // --- Persistence ---

    pub async fn save_queue(&self, path: &Path) -> DownloadResult<()> {
        self.store.save_to_file(path).await
    }

    /// Replace the list from `path`; interrupted tasks come back as waiting
    pub async fn load_queue(&self, path: &Path) -> DownloadResult<usize> {
        self.store.load_from_file(path).await
    }
}
