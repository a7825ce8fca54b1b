use super::error::{DownloadError, DownloadResult};
use super::manager::DownloadManager;
use super::task::{DownloadTask, MusicInfo, Quality, STATUS_TEXT_WAITING, TaskId, TaskStatus};
use crate::app::config::DownloadConfig;
use std::path::Path;
use std::sync::atomic::Ordering;

impl DownloadManager {
    /// Admit waiting tasks in list order until the concurrency limit is reached.
    ///
    /// Each admitted task runs on its own spawned future; a failing run never
    /// blocks the others. Returns the number of tasks started.
    /// Must be called from within a tokio runtime.
    pub fn process_queue(&self) -> usize {
        if self.is_held() {
            tracing::debug!("Queue held, scan skipped");
            return 0;
        }

        let max = self.store.config().effective_max_concurrent();
        let claimed = {
            let mut in_flight = self.lock_in_flight();
            if in_flight.len() >= max {
                tracing::debug!("All {} slots busy", max);
                return 0;
            }
            let slots = max - in_flight.len();

            let mut claimed = Vec::with_capacity(slots);
            for id in self.store.waiting_ids() {
                if claimed.len() >= slots {
                    break;
                }
                if in_flight.contains_key(&id) {
                    continue;
                }
                if let Some(generation) = self.claim_locked(&mut in_flight, &id) {
                    claimed.push((id, generation));
                }
            }
            claimed
        };

        for (id, generation) in &claimed {
            tracing::debug!(task_id = %id, "Admitting task");
            let manager = self.clone();
            let id = id.clone();
            let generation = *generation;
            tokio::spawn(async move {
                // Failures are already recorded on the task
                if let Err(e) = manager.run_claimed(id.clone(), generation).await {
                    tracing::debug!(task_id = %id, "Run ended with error: {}", e);
                }
            });
        }
        claimed.len()
    }

    /// Run `process_queue` after the current turn instead of inline
    pub(crate) fn schedule_process_queue(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No runtime available, deferred queue scan dropped");
            return;
        };
        let manager = self.clone();
        handle.spawn(async move {
            tokio::task::yield_now().await;
            manager.process_queue();
        });
    }

    fn save_dir(config: &DownloadConfig) -> DownloadResult<&Path> {
        config
            .save_path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(DownloadError::SavePathNotSet)
    }

    fn new_task(
        config: &DownloadConfig,
        save_dir: &Path,
        music_info: MusicInfo,
        quality: Option<Quality>,
    ) -> DownloadTask {
        DownloadTask::new(
            music_info,
            quality.unwrap_or(config.quality),
            save_dir,
            config.file_name_template,
        )
    }

    /// Queue one song. Fails without touching the list when no save path is set.
    pub fn enqueue(&self, music_info: MusicInfo, quality: Option<Quality>) -> DownloadResult<TaskId> {
        let config = self.store.config();
        let save_dir = Self::save_dir(&config)?;
        let task = Self::new_task(&config, save_dir, music_info, quality);
        let id = task.id.clone();
        tracing::info!(task_id = %id, "Queued {}", task.metadata.file_name);

        self.store.add_task(task);
        self.schedule_process_queue();
        Ok(id)
    }

    /// Queue several songs with a single list notification
    pub fn enqueue_batch(
        &self,
        items: Vec<MusicInfo>,
        quality: Option<Quality>,
    ) -> DownloadResult<Vec<TaskId>> {
        let config = self.store.config();
        let save_dir = Self::save_dir(&config)?;
        let tasks: Vec<DownloadTask> = items
            .into_iter()
            .map(|info| Self::new_task(&config, save_dir, info, quality))
            .collect();
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
        tracing::info!("Queued {} tasks", ids.len());

        self.store.add_tasks(tasks);
        self.schedule_process_queue();
        Ok(ids)
    }

    /// Start a task now if a slot is free, otherwise leave it waiting.
    ///
    /// When admitted, resolves once the run has finished. Failures of the run
    /// are returned after being recorded on the task.
    pub async fn request_start(&self, id: &TaskId) -> DownloadResult<()> {
        if self.is_held() {
            tracing::warn!(task_id = %id, "Queue held, start ignored");
            return Ok(());
        }

        let generation = {
            let mut in_flight = self.lock_in_flight();
            if in_flight.contains_key(id) {
                tracing::warn!(task_id = %id, "Task is already running, start ignored");
                return Ok(());
            }
            let Some(task) = self.store.get_task(id) else {
                tracing::warn!(task_id = %id, "Task not found, start ignored");
                return Ok(());
            };
            if task.status == TaskStatus::Completed {
                tracing::debug!(task_id = %id, "Task already completed, start ignored");
                return Ok(());
            }

            let max = self.store.config().effective_max_concurrent();
            if in_flight.len() >= max {
                self.store
                    .update_task_status(id, TaskStatus::Waiting, Some(STATUS_TEXT_WAITING));
                tracing::info!(task_id = %id, "Concurrency limit reached, task left waiting");
                return Ok(());
            }
            self.claim_locked(&mut in_flight, id)
        };

        match generation {
            Some(generation) => self.run_claimed(id.clone(), generation).await,
            None => Ok(()),
        }
    }

    /// Pause a running task and hand its slot to the next waiting one
    pub fn request_pause(&self, id: &TaskId) -> bool {
        let paused = self.pause_task(id);
        self.process_queue();
        paused
    }

    /// Put a paused or failed task back in the queue
    pub fn request_resume(&self, id: &TaskId) -> bool {
        let requeued = self.requeue(id, "Resume", false, |status| {
            matches!(status, TaskStatus::Pause | TaskStatus::Error)
        });
        if requeued {
            self.process_queue();
        }
        requeued
    }

    /// Re-queue a failed task; its download URL is resolved again
    pub fn request_retry(&self, id: &TaskId) -> bool {
        let requeued = self.requeue(id, "Retry", true, |status| status == TaskStatus::Error);
        if requeued {
            self.process_queue();
        }
        requeued
    }

    fn requeue<F>(&self, id: &TaskId, action: &str, clear_url: bool, allowed: F) -> bool
    where
        F: Fn(TaskStatus) -> bool,
    {
        // Held so a concurrent claim cannot interleave with the status change
        let in_flight = self.lock_in_flight();
        let Some(task) = self.store.get_task(id) else {
            tracing::warn!(task_id = %id, "{} ignored, task not found", action);
            return false;
        };
        if in_flight.contains_key(id) || !allowed(task.status) {
            tracing::warn!(task_id = %id, "{} ignored, task is {}", action, task.status);
            return false;
        }

        self.store.update_task(id, |t| {
            t.status = TaskStatus::Waiting;
            t.status_text = STATUS_TEXT_WAITING.to_string();
            if clear_url {
                t.metadata.url = None;
            }
        });
        drop(in_flight);

        tracing::info!(task_id = %id, "{}: task re-queued", action);
        true
    }

    /// Stop the task if running, delete it from the list and refill the slot
    pub fn request_cancel(&self, id: &TaskId) -> Option<DownloadTask> {
        let removed = self.cancel_task(id);
        self.process_queue();
        removed
    }

    /// Pause every running task.
    /// Returns the number of tasks paused.
    pub fn pause_all(&self) -> usize {
        let paused = self
            .store
            .running_ids()
            .iter()
            .filter(|id| self.pause_task(id))
            .count();
        tracing::info!("Paused {} tasks", paused);
        self.process_queue();
        paused
    }

    /// Let the concurrency limit decide what starts.
    /// Returns the number of tasks started.
    pub fn start_all(&self) -> usize {
        self.process_queue()
    }

    /// Stop admitting tasks; running ones continue
    pub fn hold_queue(&self) {
        self.held.store(true, Ordering::Release);
        tracing::debug!("Queue held");
    }

    /// Allow admission again. Does not scan by itself.
    pub fn release_queue(&self) {
        self.held.store(false, Ordering::Release);
        tracing::debug!("Queue released");
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Hold the queue and pause everything running.
    /// Returns the number of tasks paused.
    pub fn shutdown(&self) -> usize {
        self.hold_queue();
        let paused = self
            .store
            .running_ids()
            .iter()
            .filter(|id| self.pause_task(id))
            .count();
        tracing::info!("Shutdown: paused {} running tasks", paused);
        paused
    }

    /// Remove several tasks, stopping any that are running.
    /// Returns the number of tasks removed.
    pub fn remove_tasks(&self, ids: &[TaskId]) -> usize {
        let (removed, idle) = {
            let mut in_flight = self.lock_in_flight();
            let mut idle = Vec::new();
            for id in ids {
                match in_flight.remove(id) {
                    Some(entry) => {
                        self.lock_throttle().remove(id);
                        if let Some(cancel) = &entry.cancel {
                            self.transport.cancel_transfer(cancel);
                        }
                    }
                    None => idle.extend(self.store.get_task(id)),
                }
            }
            (self.store.remove_tasks(ids), idle)
        };
        tracing::info!("Removed {} tasks", removed);
        // Stopped runs clean up after themselves
        for task in idle {
            self.spawn_discard(task);
        }
        self.process_queue();
        removed
    }

    /// Drop every completed task from the list.
    /// Returns the number of tasks removed.
    pub fn clear_completed(&self) -> usize {
        let removed = self.store.clear_completed();
        tracing::info!("Cleared {} completed tasks", removed);
        removed
    }
}
