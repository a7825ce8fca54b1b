use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::file::naming;

/// Opaque task identifier, `<itemId>_<quality>_<millis>_<seq>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Run,
    Pause,
    Error,
    Completed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Run => "run",
            TaskStatus::Pause => "pause",
            TaskStatus::Error => "error",
            TaskStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Requested audio quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Quality {
    #[serde(rename = "128k")]
    K128,
    #[serde(rename = "192k")]
    K192,
    #[default]
    #[serde(rename = "320k")]
    K320,
    #[serde(rename = "flac")]
    Flac,
    #[serde(rename = "flac24bit")]
    Flac24bit,
    #[serde(rename = "wav")]
    Wav,
    #[serde(rename = "ape")]
    Ape,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::K128 => "128k",
            Quality::K192 => "192k",
            Quality::K320 => "320k",
            Quality::Flac => "flac",
            Quality::Flac24bit => "flac24bit",
            Quality::Wav => "wav",
            Quality::Ape => "ape",
        }
    }

    /// File extension written for this quality
    pub fn file_ext(&self) -> &'static str {
        match self {
            Quality::Flac | Quality::Flac24bit => "flac",
            Quality::Wav => "wav",
            Quality::Ape => "ape",
            _ => "mp3",
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "128k" => Ok(Quality::K128),
            "192k" => Ok(Quality::K192),
            "320k" => Ok(Quality::K320),
            "flac" => Ok(Quality::Flac),
            "flac24bit" => Ok(Quality::Flac24bit),
            "wav" => Ok(Quality::Wav),
            "ape" => Ok(Quality::Ape),
            other => Err(format!("Unknown quality: {}", other)),
        }
    }
}

/// How the song name and singer are combined into a file name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileNameTemplate {
    #[default]
    #[serde(rename = "{name} - {singer}")]
    NameSinger,
    #[serde(rename = "{singer} - {name}")]
    SingerName,
    #[serde(rename = "{name}")]
    Name,
}

impl FromStr for FileNameTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "{name} - {singer}" => Ok(FileNameTemplate::NameSinger),
            "{singer} - {name}" => Ok(FileNameTemplate::SingerName),
            "{name}" => Ok(FileNameTemplate::Name),
            other => Err(format!("Unknown file name template: {}", other)),
        }
    }
}

/// The source item a task downloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MusicInfo {
    pub id: String,
    pub name: String,
    pub singer: String,
    /// Source platform key understood by the lookup service
    pub source: String,
    #[serde(default)]
    pub album: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub music_info: MusicInfo,
    pub quality: Quality,
    /// Resolved transfer URL; None until resolved and after a retry
    #[serde(default)]
    pub url: Option<String>,
    pub ext: String,
    pub file_name: String,
    pub file_path: PathBuf,
}

/// One row of the download list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub id: TaskId,
    pub is_complete: bool,
    pub status: TaskStatus,
    pub status_text: String,
    pub downloaded: u64,
    pub total: u64,
    pub progress: f64,
    pub speed: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    pub metadata: TaskMetadata,
}

pub const STATUS_TEXT_WAITING: &str = "Waiting";
pub const STATUS_TEXT_RESOLVING: &str = "Resolving download URL...";
pub const STATUS_TEXT_DOWNLOADING: &str = "Downloading...";
pub const STATUS_TEXT_COMPLETED: &str = "Completed";
pub const STATUS_TEXT_PAUSED: &str = "Paused";

impl DownloadTask {
    /// Build a waiting task for `music_info` saved under `save_dir`
    pub fn new(
        music_info: MusicInfo,
        quality: Quality,
        save_dir: &Path,
        template: FileNameTemplate,
    ) -> Self {
        let created_at = Utc::now();
        let ext = quality.file_ext().to_string();
        let file_name = naming::generate_file_name(&music_info, &ext, template);
        let file_path = save_dir.join(&file_name);
        let id = naming::generate_task_id(&music_info.id, quality, created_at);

        Self {
            id,
            is_complete: false,
            status: TaskStatus::Waiting,
            status_text: STATUS_TEXT_WAITING.to_string(),
            downloaded: 0,
            total: 0,
            progress: 0.0,
            speed: String::new(),
            created_at,
            finished_at: None,
            retry_count: 0,
            metadata: TaskMetadata {
                music_info,
                quality,
                url: None,
                ext,
                file_name,
                file_path,
            },
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Error)
    }
}

/// Snapshot of a transfer's byte counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressInfo {
    pub downloaded: u64,
    pub total: u64,
}

impl ProgressInfo {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64).min(1.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn song() -> MusicInfo {
        MusicInfo {
            id: "1001".to_string(),
            name: "Song".to_string(),
            singer: "Artist".to_string(),
            source: "kw".to_string(),
            album: None,
        }
    }

    #[test]
    fn test_quality_ext_mapping() {
        assert_eq!(Quality::Flac24bit.file_ext(), "flac");
        assert_eq!(Quality::Flac.file_ext(), "flac");
        assert_eq!(Quality::Wav.file_ext(), "wav");
        assert_eq!(Quality::Ape.file_ext(), "ape");
        assert_eq!(Quality::K128.file_ext(), "mp3");
        assert_eq!(Quality::K320.file_ext(), "mp3");
    }

    #[test]
    fn test_quality_parse() {
        assert_eq!("flac24bit".parse::<Quality>().unwrap(), Quality::Flac24bit);
        assert_eq!("320K".parse::<Quality>().unwrap(), Quality::K320);
        assert!("hires".parse::<Quality>().is_err());
    }

    #[test]
    fn test_new_task_is_waiting() {
        let task = DownloadTask::new(
            song(),
            Quality::Flac24bit,
            Path::new("/music"),
            FileNameTemplate::NameSinger,
        );

        assert_eq!(task.status, TaskStatus::Waiting);
        assert!(!task.is_complete);
        assert_eq!(task.metadata.file_name, "Song - Artist.flac");
        assert_eq!(task.metadata.file_path, PathBuf::from("/music/Song - Artist.flac"));
        assert_eq!(task.metadata.ext, "flac");
        assert_eq!(task.metadata.url, None);
        assert!(task.id.as_str().starts_with("1001_flac24bit_"));
    }

    #[test]
    fn test_repeated_adds_get_distinct_ids() {
        let a = DownloadTask::new(song(), Quality::K128, Path::new("/m"), FileNameTemplate::Name);
        let b = DownloadTask::new(song(), Quality::K128, Path::new("/m"), FileNameTemplate::Name);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
        let quality = serde_json::to_string(&Quality::K320).unwrap();
        assert_eq!(quality, "\"320k\"");
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(ProgressInfo { downloaded: 50, total: 0 }.fraction(), 0.0);
        assert_eq!(ProgressInfo { downloaded: 50, total: 200 }.fraction(), 0.25);
    }
}
