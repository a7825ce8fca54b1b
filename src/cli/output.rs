use crate::download::task::{DownloadTask, TaskStatus};
use crate::util::format::format_size;

fn percent(task: &DownloadTask) -> u8 {
    (task.progress.clamp(0.0, 1.0) * 100.0) as u8
}

/// Format a single task for display
pub fn format_task(task: &DownloadTask, detailed: bool) -> String {
    let mut output = String::new();

    if detailed {
        let info = &task.metadata.music_info;
        output.push_str(&format!("ID: {}\n", task.id));
        output.push_str(&format!("Song: {} - {}\n", info.name, info.singer));
        if let Some(album) = &info.album {
            output.push_str(&format!("Album: {}\n", album));
        }
        output.push_str(&format!("Source: {} ({})\n", info.source, info.id));
        output.push_str(&format!("Quality: {}\n", task.metadata.quality));
        output.push_str(&format!("File: {}\n", task.metadata.file_path.display()));
        output.push_str(&format!("Status: {} ({})\n", task.status, task.status_text));

        if task.total > 0 {
            output.push_str(&format!("Size: {}\n", format_size(task.total)));
        }
        if task.downloaded > 0 {
            output.push_str(&format!("Downloaded: {}\n", format_size(task.downloaded)));
            output.push_str(&format!("Progress: {}%\n", percent(task)));
        }
        if !task.speed.is_empty() {
            output.push_str(&format!("Speed: {}\n", task.speed));
        }
        if task.retry_count > 0 {
            output.push_str(&format!("Retries: {}\n", task.retry_count));
        }

        output.push_str(&format!("Created: {}\n", task.created_at.format("%Y-%m-%d %H:%M:%S")));
        if let Some(finished) = task.finished_at {
            output.push_str(&format!("Finished: {}\n", finished.format("%Y-%m-%d %H:%M:%S")));
        }
    } else {
        // Compact format for lists
        let status_icon = match task.status {
            TaskStatus::Waiting => "…",
            TaskStatus::Run => "⬇",
            TaskStatus::Pause => "⏸",
            TaskStatus::Error => "✗",
            TaskStatus::Completed => "✓",
        };

        let progress_str = if task.total > 0 {
            format!("{}%", percent(task))
        } else {
            format_size(task.downloaded)
        };

        output.push_str(&format!(
            "{} {} [{}] {} ({})",
            status_icon, task.id, progress_str, task.metadata.file_name, task.status_text
        ));
    }

    output
}

/// Format multiple tasks for display (human or JSON)
pub fn format_tasks(tasks: &[DownloadTask], json: bool) -> String {
    if json {
        serde_json::to_string_pretty(tasks).unwrap_or_else(|_| "[]".to_string())
    } else {
        if tasks.is_empty() {
            return "No downloads in queue.".to_string();
        }

        tasks
            .iter()
            .map(|task| format_task(task, false))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Counts per status for the `run` summary line
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueSummary {
    pub waiting: usize,
    pub running: usize,
    pub paused: usize,
    pub failed: usize,
    pub completed: usize,
}

impl QueueSummary {
    pub fn from_tasks(tasks: &[DownloadTask]) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            match task.status {
                TaskStatus::Waiting => summary.waiting += 1,
                TaskStatus::Run => summary.running += 1,
                TaskStatus::Pause => summary.paused += 1,
                TaskStatus::Error => summary.failed += 1,
                TaskStatus::Completed => summary.completed += 1,
            }
        }
        summary
    }

    /// Nothing left for the queue to do
    pub fn is_drained(&self) -> bool {
        self.waiting == 0 && self.running == 0
    }

    pub fn line(&self) -> String {
        format!(
            "running {} | waiting {} | done {} | failed {} | paused {}",
            self.running, self.waiting, self.completed, self.failed, self.paused
        )
    }
}
