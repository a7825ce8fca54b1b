use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::download::task::{FileNameTemplate, MusicInfo, Quality, TaskId};

static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[<>:"/\\|?*\x00-\x1F]+"#).expect("invalid filename pattern")
});

static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

const UNKNOWN: &str = "Unknown";

/// Strip characters that are not allowed in file names.
/// Falls back to "Unknown" when nothing usable is left.
pub fn sanitize_component(value: &str) -> String {
    let stripped = INVALID_CHARS.replace_all(value, "");
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        UNKNOWN.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Compose `<derived-name>.<ext>` from the song name and singer
pub fn generate_file_name(info: &MusicInfo, ext: &str, template: FileNameTemplate) -> String {
    let name = sanitize_component(&info.name);
    let singer = sanitize_component(&info.singer);

    let base = match template {
        FileNameTemplate::NameSinger => format!("{} - {}", name, singer),
        FileNameTemplate::SingerName => format!("{} - {}", singer, name),
        FileNameTemplate::Name => name,
    };

    format!("{}.{}", base, ext)
}

/// Derive a task id from the item id, quality and creation time.
///
/// A process-wide sequence number is appended so that items added in the
/// same millisecond (batch adds, repeated re-adds) never share an id.
pub fn generate_task_id(item_id: &str, quality: Quality, created_at: DateTime<Utc>) -> TaskId {
    let seq = TASK_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    TaskId::from(format!(
        "{}_{}_{}_{}",
        item_id,
        quality.as_str(),
        created_at.timestamp_millis(),
        seq
    ))
}

/// Path of a sidecar file next to the song: final extension replaced by `ext`
pub fn sidecar_path(file_path: &Path, ext: &str) -> PathBuf {
    file_path.with_extension(ext)
}
