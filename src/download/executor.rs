//! Per-task lifecycle: resolve, transfer, settle.
//!
//! A task is owned by exactly one run while it sits in the in-flight map.
//! Each run carries the generation it was claimed with; once the entry is
//! gone or replaced (pause, cancel, a newer run) every late callback and
//! the final settle from the old run are dropped.

use super::error::{DownloadError, DownloadResult};
use super::manager::{DownloadManager, InFlight};
use super::post_process;
use super::resolver::UrlRequest;
use super::task::{
    DownloadTask, ProgressInfo, STATUS_TEXT_COMPLETED, STATUS_TEXT_DOWNLOADING, STATUS_TEXT_PAUSED,
    STATUS_TEXT_RESOLVING, TaskId, TaskStatus,
};
use super::transport::{TransferHooks, TransferRequest};
use crate::util::format::format_speed;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio::time::{Duration, Instant};

/// Minimum spacing between applied progress samples per task
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(500);

/// How a run ended, before it is written back to the store
enum Finish {
    Completed {
        downloaded: u64,
        total: u64,
        post_process: bool,
    },
    Failed {
        error: DownloadError,
        status_text: String,
        count_retry: bool,
    },
    /// Ownership moved elsewhere; nothing to write
    Lost,
}

impl Finish {
    fn failed(error: DownloadError) -> Self {
        let status_text = format!("Download failed: {}", error);
        Finish::Failed {
            error,
            status_text,
            count_retry: true,
        }
    }
}

impl DownloadManager {
    /// Reserve a slot for `id` and mark it running.
    ///
    /// Caller holds the in-flight lock, so the check and the insert are one
    /// step. Returns the generation of the new run.
    pub(crate) fn claim_locked(
        &self,
        in_flight: &mut HashMap<TaskId, InFlight>,
        id: &TaskId,
    ) -> Option<u64> {
        if in_flight.contains_key(id) {
            tracing::warn!(task_id = %id, "Task is already running, start ignored");
            return None;
        }
        let Some(task) = self.store.get_task(id) else {
            tracing::warn!(task_id = %id, "Task not found, start ignored");
            return None;
        };
        if task.status == TaskStatus::Completed {
            tracing::debug!(task_id = %id, "Task already completed, start ignored");
            return None;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(
            id.clone(),
            InFlight {
                generation,
                cancel: None,
            },
        );
        self.store
            .update_task_status(id, TaskStatus::Run, Some(STATUS_TEXT_RESOLVING));
        Some(generation)
    }

    /// Run one task to the end without consulting the concurrency limit.
    ///
    /// Returns immediately when the task is already running or finished.
    pub async fn start_task(&self, id: &TaskId) -> DownloadResult<()> {
        let generation = {
            let mut in_flight = self.lock_in_flight();
            self.claim_locked(&mut in_flight, id)
        };
        match generation {
            Some(generation) => self.run_claimed(id.clone(), generation).await,
            None => Ok(()),
        }
    }

    /// Drive a claimed run, write its result back and refill the queue
    pub(crate) async fn run_claimed(&self, id: TaskId, generation: u64) -> DownloadResult<()> {
        let finish = self.drive(&id, generation).await;
        let outcome = self.settle(&id, generation, finish);
        self.schedule_process_queue();
        outcome
    }

    fn owns(&self, id: &TaskId, generation: u64) -> bool {
        self.lock_in_flight()
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Apply `update` only while this run still owns the task
    fn update_if_owned<F>(&self, id: &TaskId, generation: u64, update: F) -> bool
    where
        F: FnOnce(&mut DownloadTask),
    {
        let in_flight = self.lock_in_flight();
        if !in_flight
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
        {
            return false;
        }
        self.store.update_task(id, update)
    }

    async fn drive(&self, id: &TaskId, generation: u64) -> Finish {
        let Some(task) = self.store.get_task(id) else {
            tracing::warn!(task_id = %id, "Task disappeared before it started");
            return Finish::Lost;
        };
        let file_path = task.metadata.file_path.clone();

        if let Some(dir) = file_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(error) = self.ensure_directory(dir).await {
                let reason = match &error {
                    DownloadError::Directory { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                return Finish::Failed {
                    status_text: format!("Failed to create save directory: {}", reason),
                    error,
                    count_retry: false,
                };
            }
        }

        let url = match task.metadata.url.clone() {
            Some(url) => url,
            None => {
                let request = UrlRequest {
                    music_info: task.metadata.music_info.clone(),
                    quality: task.metadata.quality,
                    force_refresh: true,
                    allow_quality_fallback: false,
                };
                let url = match self.resolver.resolve_transfer_url(&request).await {
                    Ok(url) => url,
                    Err(e) => return Finish::failed(e),
                };
                tracing::debug!(task_id = %id, "Resolved download URL: {}", url);
                self.store
                    .update_task(id, |t| t.metadata.url = Some(url.clone()));
                url
            }
        };

        match self.transport.exists(&file_path).await {
            Ok(true) => {
                let size = match self.transport.stat(&file_path).await {
                    Ok(stat) => stat.size,
                    Err(e) => {
                        tracing::warn!(task_id = %id, "Could not stat existing file: {}", e);
                        0
                    }
                };
                tracing::info!(task_id = %id, "File already exists, skipping transfer: {:?}", file_path);
                return Finish::Completed {
                    downloaded: size,
                    total: size,
                    post_process: false,
                };
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(task_id = %id, "Could not check destination: {}", e),
        }

        if !self.update_if_owned(id, generation, |t| {
            t.status_text = STATUS_TEXT_DOWNLOADING.to_string();
        }) {
            // Cancelled while resolving; an earlier paused run may have staged data
            self.discard_if_removed(id, &file_path).await;
            return Finish::Lost;
        }

        let hooks = self.transfer_hooks(id, generation, task.created_at);
        let job = self
            .transport
            .begin_transfer(TransferRequest::new(url, &file_path), hooks);

        let attached = {
            let mut in_flight = self.lock_in_flight();
            match in_flight.get_mut(id) {
                Some(entry) if entry.generation == generation => {
                    entry.cancel = Some(job.cancel.clone());
                    true
                }
                _ => false,
            }
        };
        if !attached {
            // Paused or cancelled between the status update and here
            self.transport.cancel_transfer(&job.cancel);
            let _ = job.completion.await;
            self.discard_if_removed(id, &file_path).await;
            return Finish::Lost;
        }

        match job.completion.await {
            Ok(Ok(outcome)) if outcome.status_code == 200 => {
                let known_total = self.store.get_task(id).map(|t| t.total).unwrap_or(0);
                Finish::Completed {
                    downloaded: outcome.bytes_written,
                    total: known_total.max(outcome.bytes_written),
                    post_process: true,
                }
            }
            Ok(Ok(outcome)) => {
                self.resolver
                    .invalidate_transfer_url(&task.metadata.music_info, task.metadata.quality);
                Finish::failed(DownloadError::from_status(outcome.status_code))
            }
            Ok(Err(e)) => {
                self.resolver
                    .invalidate_transfer_url(&task.metadata.music_info, task.metadata.quality);
                Finish::failed(e)
            }
            Err(join_error) if join_error.is_cancelled() => {
                if self.owns(id, generation) {
                    Finish::failed(DownloadError::Interrupted)
                } else {
                    self.discard_if_removed(id, &file_path).await;
                    Finish::Lost
                }
            }
            Err(join_error) => {
                tracing::error!(task_id = %id, "Transfer task panicked: {}", join_error);
                Finish::failed(DownloadError::Interrupted)
            }
        }
    }

    async fn ensure_directory(&self, dir: &Path) -> DownloadResult<()> {
        if self.transport.exists(dir).await? {
            return Ok(());
        }
        match self.transport.make_directory(dir).await {
            Ok(()) => Ok(()),
            // Another run may have created it in the meantime
            Err(e) if self.transport.exists(dir).await.unwrap_or(false) => {
                tracing::warn!("Directory creation raced, continuing: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Drop staged data of a task that was cancelled rather than paused
    async fn discard_if_removed(&self, id: &TaskId, file_path: &Path) {
        if self.store.get_task(id).is_some() {
            return;
        }
        if let Err(e) = self.transport.discard_partial(file_path).await {
            tracing::warn!(task_id = %id, "Failed to remove partial file: {}", e);
        }
    }

    /// Remove whatever a paused or failed run of `task` left behind.
    ///
    /// Only for tasks already gone from the list with no run in flight;
    /// an in-flight run discards for itself once its transfer has stopped.
    pub async fn discard_staged(&self, task: &DownloadTask) {
        if let Err(e) = self.transport.discard_partial(&task.metadata.file_path).await {
            tracing::warn!(task_id = %task.id, "Failed to remove partial file: {}", e);
        }
    }

    pub(crate) fn spawn_discard(&self, task: DownloadTask) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(task_id = %task.id, "No runtime available, partial file kept");
            return;
        };
        let manager = self.clone();
        handle.spawn(async move {
            manager.discard_staged(&task).await;
        });
    }

    fn transfer_hooks(&self, id: &TaskId, generation: u64, created_at: DateTime<Utc>) -> TransferHooks {
        let on_begin = {
            let manager = self.clone();
            let id = id.clone();
            Box::new(move |total: u64| {
                manager.update_if_owned(&id, generation, |t| {
                    t.total = total;
                    t.downloaded = 0;
                    t.progress = 0.0;
                    t.speed = format_speed(0);
                });
            })
        };
        let on_progress = {
            let manager = self.clone();
            let id = id.clone();
            Box::new(move |written: u64, total: u64| {
                manager.apply_progress(&id, generation, created_at, written, total);
            })
        };
        TransferHooks {
            on_begin,
            on_progress,
        }
    }

    /// Record a progress sample unless one was applied within the throttle window
    fn apply_progress(
        &self,
        id: &TaskId,
        generation: u64,
        created_at: DateTime<Utc>,
        written: u64,
        total: u64,
    ) {
        let in_flight = self.lock_in_flight();
        if !in_flight
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
        {
            return;
        }

        {
            let now = Instant::now();
            let mut throttle = self.lock_throttle();
            if let Some(last) = throttle.get(id) {
                if now.duration_since(*last) < PROGRESS_THROTTLE {
                    return;
                }
            }
            throttle.insert(id.clone(), now);
        }

        let elapsed = (Utc::now() - created_at).num_milliseconds() as f64 / 1000.0;
        let bytes_per_second = if elapsed > 0.0 {
            (written as f64 / elapsed).floor() as u64
        } else {
            0
        };
        let sample = ProgressInfo {
            downloaded: written,
            total,
        };

        self.store.update_task_progress(id, |t| {
            t.downloaded = sample.downloaded;
            if sample.total > 0 {
                t.total = sample.total;
            }
            t.progress = sample.fraction();
            t.speed = format_speed(bytes_per_second);
        });
        drop(in_flight);
    }

    /// Release the slot and write the result, if this run still owns the task
    fn settle(&self, id: &TaskId, generation: u64, finish: Finish) -> DownloadResult<()> {
        let finished = {
            let mut in_flight = self.lock_in_flight();
            if !in_flight
                .get(id)
                .is_some_and(|entry| entry.generation == generation)
            {
                if let Finish::Failed { error, .. } = &finish {
                    tracing::debug!(task_id = %id, "Dropping result of superseded run: {}", error);
                }
                return Ok(());
            }
            in_flight.remove(id);
            self.lock_throttle().remove(id);

            match finish {
                Finish::Completed {
                    downloaded,
                    total,
                    post_process,
                } => {
                    self.store.update_task(id, |t| {
                        t.status = TaskStatus::Completed;
                        t.status_text = STATUS_TEXT_COMPLETED.to_string();
                        t.downloaded = downloaded;
                        t.total = total;
                        t.progress = 1.0;
                        t.speed.clear();
                        t.finished_at = Some(Utc::now());
                    });
                    tracing::info!(task_id = %id, "Download completed ({} bytes)", downloaded);
                    if post_process { self.store.get_task(id) } else { None }
                }
                Finish::Failed {
                    error,
                    status_text,
                    count_retry,
                } => {
                    self.store.update_task(id, |t| {
                        t.status = TaskStatus::Error;
                        t.status_text = status_text;
                        t.speed.clear();
                        if count_retry {
                            t.retry_count += 1;
                        }
                    });
                    tracing::error!(task_id = %id, "Download failed: {}", error);
                    return Err(error);
                }
                Finish::Lost => None,
            }
        };

        if let Some(task) = finished {
            self.spawn_post_process(task);
        }
        Ok(())
    }

    /// Fetch cover and lyric in the background; the task stays completed regardless
    fn spawn_post_process(&self, task: DownloadTask) {
        let settings = self.metadata_config();
        if !settings.embed_cover && !settings.embed_lyric {
            return;
        }

        self.post_processing.fetch_add(1, Ordering::AcqRel);
        let transport = self.transport.clone();
        let resolver = self.resolver.clone();
        let counter = self.post_processing.clone();
        tokio::spawn(async move {
            post_process::embed_metadata(transport.as_ref(), resolver.as_ref(), &task, &settings)
                .await;
            counter.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Stop a running task and free its slot. Returns false if it was not running.
    ///
    /// Bytes already written are kept; the next start begins from zero.
    pub fn pause_task(&self, id: &TaskId) -> bool {
        let mut in_flight = self.lock_in_flight();
        let Some(entry) = in_flight.remove(id) else {
            tracing::warn!(task_id = %id, "Pause ignored, task is not running");
            return false;
        };
        self.lock_throttle().remove(id);
        if let Some(cancel) = &entry.cancel {
            self.transport.cancel_transfer(cancel);
        }
        self.store.update_task(id, |t| {
            t.status = TaskStatus::Pause;
            t.status_text = STATUS_TEXT_PAUSED.to_string();
            t.speed.clear();
        });
        tracing::info!(task_id = %id, "Download paused");
        true
    }

    /// Stop the task if running and remove it from the list.
    ///
    /// Staged data is discarded in the background: by the stopped run, or
    /// here when nothing was running.
    pub fn cancel_task(&self, id: &TaskId) -> Option<DownloadTask> {
        let mut in_flight = self.lock_in_flight();
        let was_running = match in_flight.remove(id) {
            Some(entry) => {
                self.lock_throttle().remove(id);
                if let Some(cancel) = &entry.cancel {
                    self.transport.cancel_transfer(cancel);
                }
                true
            }
            None => false,
        };
        let removed = self.store.remove_task(id);
        drop(in_flight);

        match &removed {
            Some(task) => {
                tracing::info!(task_id = %id, "Download cancelled");
                if !was_running {
                    self.spawn_discard(task.clone());
                }
            }
            None => tracing::warn!(task_id = %id, "Cancel ignored, task not found"),
        }
        removed
    }
}
