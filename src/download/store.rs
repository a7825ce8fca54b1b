use super::error::DownloadResult;
use super::task::{DownloadTask, STATUS_TEXT_WAITING, TaskId, TaskStatus};
use crate::app::config::DownloadConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Coalescing window for progress notifications
pub const PROGRESS_DEBOUNCE: Duration = Duration::from_millis(100);

const EVENT_CAPACITY: usize = 256;

/// Wrapper for TOML serialization (TOML requires root to be a table, not an array)
#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    #[serde(default)]
    tasks: Vec<DownloadTask>,
}

/// Change notifications for list consumers
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Full snapshot of the list after a mutation
    ListChanged(Arc<Vec<DownloadTask>>),
    ConfigChanged(DownloadConfig),
}

struct StoreState {
    list: Vec<DownloadTask>,
    running_ids: Vec<TaskId>,
    config: DownloadConfig,
}

impl StoreState {
    /// Re-derive `is_complete` and the running set from statuses
    fn normalize(&mut self) {
        self.running_ids.clear();
        for task in &mut self.list {
            task.is_complete = task.status == TaskStatus::Completed;
            if task.status == TaskStatus::Run {
                self.running_ids.push(task.id.clone());
            }
        }
    }

    fn position(&self, id: &TaskId) -> Option<usize> {
        self.list.iter().position(|t| &t.id == id)
    }
}

struct StoreInner {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
    progress_pending: AtomicBool,
}

/// Ordered list of download tasks plus the queue settings.
///
/// All mutation goes through the methods below; each one emits a
/// [`StoreEvent`] so subscribers can re-render from the snapshot.
#[derive(Clone)]
pub struct TaskStore {
    inner: Arc<StoreInner>,
}

impl TaskStore {
    pub fn new(config: DownloadConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    list: Vec::new(),
                    running_ids: Vec::new(),
                    config,
                }),
                events,
                progress_pending: AtomicBool::new(false),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_list(&self, state: &StoreState) {
        // No subscribers is fine
        let _ = self
            .inner
            .events
            .send(StoreEvent::ListChanged(Arc::new(state.list.clone())));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    // --- Queries ---

    pub fn task_list(&self) -> Vec<DownloadTask> {
        self.lock().list.clone()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<DownloadTask> {
        let state = self.lock();
        state.position(id).map(|i| state.list[i].clone())
    }

    pub fn len(&self) -> usize {
        self.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().list.is_empty()
    }

    /// Ids currently in `run`, in list order
    pub fn running_ids(&self) -> Vec<TaskId> {
        self.lock().running_ids.clone()
    }

    /// Ids in `waiting`, in insertion order
    pub fn waiting_ids(&self) -> Vec<TaskId> {
        self.lock()
            .list
            .iter()
            .filter(|t| t.status == TaskStatus::Waiting)
            .map(|t| t.id.clone())
            .collect()
    }

    pub fn config(&self) -> DownloadConfig {
        self.lock().config.clone()
    }

    // --- Config actions ---

    pub fn set_config(&self, config: DownloadConfig) {
        let mut state = self.lock();
        state.config = config.clone();
        let _ = self.inner.events.send(StoreEvent::ConfigChanged(config));
    }

    pub fn update_config<F>(&self, update: F) -> DownloadConfig
    where
        F: FnOnce(&mut DownloadConfig),
    {
        let mut state = self.lock();
        update(&mut state.config);
        let config = state.config.clone();
        let _ = self.inner.events.send(StoreEvent::ConfigChanged(config.clone()));
        config
    }

    // --- List actions ---

    /// Replace the whole list
    pub fn set_list(&self, list: Vec<DownloadTask>) {
        let mut state = self.lock();
        state.list = list;
        state.normalize();
        self.emit_list(&state);
    }

    pub fn add_task(&self, task: DownloadTask) {
        let mut state = self.lock();
        state.list.push(task);
        state.normalize();
        self.emit_list(&state);
    }

    /// Append several tasks with a single notification
    pub fn add_tasks(&self, tasks: Vec<DownloadTask>) {
        if tasks.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.list.extend(tasks);
        state.normalize();
        self.emit_list(&state);
    }

    /// Apply `update` to one task. Returns false when the id is unknown.
    pub fn update_task<F>(&self, id: &TaskId, update: F) -> bool
    where
        F: FnOnce(&mut DownloadTask),
    {
        let mut state = self.lock();
        let Some(index) = state.position(id) else {
            return false;
        };
        update(&mut state.list[index]);
        state.normalize();
        self.emit_list(&state);
        true
    }

    /// Set status (and optionally status text)
    pub fn update_task_status(&self, id: &TaskId, status: TaskStatus, status_text: Option<&str>) -> bool {
        self.update_task(id, |task| {
            task.status = status;
            if let Some(text) = status_text {
                task.status_text = text.to_string();
            }
        })
    }

    /// Apply a progress change now and notify within [`PROGRESS_DEBOUNCE`].
    ///
    /// Bursts of calls share one trailing notification carrying the latest list.
    pub fn update_task_progress<F>(&self, id: &TaskId, update: F) -> bool
    where
        F: FnOnce(&mut DownloadTask),
    {
        {
            let mut state = self.lock();
            let Some(index) = state.position(id) else {
                return false;
            };
            update(&mut state.list[index]);
        }
        self.schedule_list_update();
        true
    }

    fn schedule_list_update(&self) {
        if self.inner.progress_pending.swap(true, Ordering::AcqRel) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(PROGRESS_DEBOUNCE).await;
                    store.inner.progress_pending.store(false, Ordering::Release);
                    let state = store.lock();
                    store.emit_list(&state);
                });
            }
            Err(_) => {
                self.inner.progress_pending.store(false, Ordering::Release);
                let state = self.lock();
                self.emit_list(&state);
            }
        }
    }

    pub fn remove_task(&self, id: &TaskId) -> Option<DownloadTask> {
        let mut state = self.lock();
        let index = state.position(id)?;
        let removed = state.list.remove(index);
        state.normalize();
        self.emit_list(&state);
        Some(removed)
    }

    /// Remove several tasks with a single notification
    pub fn remove_tasks(&self, ids: &[TaskId]) -> usize {
        let targets: HashSet<&TaskId> = ids.iter().collect();
        let mut state = self.lock();
        let before = state.list.len();
        state.list.retain(|t| !targets.contains(&t.id));
        let removed = before - state.list.len();
        state.normalize();
        self.emit_list(&state);
        removed
    }

    pub fn clear_completed(&self) -> usize {
        let mut state = self.lock();
        let before = state.list.len();
        state.list.retain(|t| t.status != TaskStatus::Completed);
        let removed = before - state.list.len();
        state.normalize();
        self.emit_list(&state);
        removed
    }

    pub fn clear_all(&self) {
        let mut state = self.lock();
        state.list.clear();
        state.normalize();
        self.emit_list(&state);
    }

    // --- Persistence ---

    /// Write the list to a TOML file (atomic temp + rename)
    pub async fn save_to_file(&self, path: &Path) -> DownloadResult<()> {
        let queue_file = QueueFile {
            tasks: self.task_list(),
        };
        let content = toml::to_string_pretty(&queue_file)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension("toml.tmp");
        tokio::fs::write(&temp_path, content).await?;
        tokio::fs::rename(&temp_path, path).await?;

        tracing::debug!("Saved {} tasks to {:?}", queue_file.tasks.len(), path);
        Ok(())
    }

    /// Replace the list with the contents of a TOML file.
    ///
    /// Tasks saved while running come back as `waiting`. A missing file
    /// leaves the store untouched.
    pub async fn load_from_file(&self, path: &Path) -> DownloadResult<usize> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let queue_file: QueueFile = toml::from_str(&content)?;
        let mut tasks = queue_file.tasks;
        for task in &mut tasks {
            if task.status == TaskStatus::Run {
                task.status = TaskStatus::Waiting;
                task.status_text = STATUS_TEXT_WAITING.to_string();
                task.speed.clear();
            }
        }

        let count = tasks.len();
        self.set_list(tasks);
        tracing::info!("Loaded {} tasks from {:?}", count, path);
        Ok(count)
    }
}
