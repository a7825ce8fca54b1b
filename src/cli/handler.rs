use super::error;
use super::output::{self, QueueSummary};
use super::{Commands, ConfigAction};
use crate::app::config::Config;
use crate::download::error::DownloadError;
use crate::download::manager::DownloadManager;
use crate::download::store::StoreEvent;
use crate::download::task::{MusicInfo, Quality, TaskId, TaskStatus};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Duration;

/// How long `run` waits for cover/lyric jobs before exiting
const POST_PROCESS_GRACE: Duration = Duration::from_secs(30);

/// Handle a CLI command and return exit code
pub async fn handle_command(
    command: Commands,
    config: Config,
    manager: DownloadManager,
    queue_path: &Path,
) -> i32 {
    let mutates_queue = command.mutates_queue();

    let result = match command {
        Commands::Add {
            id,
            name,
            singer,
            source,
            album,
            quality,
        } => {
            let info = MusicInfo {
                id,
                name,
                singer,
                source,
                album,
            };
            handle_add(info, quality, &manager)
        }
        Commands::BatchAdd { file, quality } => handle_batch_add(&manager, file, quality),
        Commands::List { json } => handle_list(&manager, json),
        Commands::Status { id, json } => handle_status(id, &manager, json),
        Commands::Run => handle_run(&manager).await,
        Commands::Resume { id } => handle_resume(id, &manager),
        Commands::Retry { id } => handle_retry(id, &manager),
        Commands::Remove { id } => handle_remove(id, &manager).await,
        Commands::ClearCompleted => handle_clear_completed(&manager),
        Commands::Config { action } => handle_config(action, config),
    };

    if mutates_queue {
        if let Err(e) = manager.save_queue(queue_path).await {
            eprintln!("Error: failed to save queue: {}", e);
            return error::ERROR;
        }
    }

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            error::ERROR
        }
    }
}

fn parse_quality(quality: Option<String>) -> std::result::Result<Option<Quality>, String> {
    quality.map(|q| q.parse::<Quality>()).transpose()
}

fn report_enqueue_error(e: &DownloadError) -> i32 {
    eprintln!("Error: {}", e);
    if matches!(e, DownloadError::SavePathNotSet) {
        eprintln!("Set one with `config set download.save_path <DIR>`");
    }
    error::for_download_error(e)
}

/// Queue a single song
fn handle_add(info: MusicInfo, quality: Option<String>, manager: &DownloadManager) -> Result<i32> {
    let quality = match parse_quality(quality) {
        Ok(quality) => quality,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(error::INVALID_INPUT);
        }
    };

    let label = format!("{} - {}", info.name, info.singer);
    let id = match manager.enqueue(info, quality) {
        Ok(id) => id,
        Err(e) => return Ok(report_enqueue_error(&e)),
    };
    println!("Added download: {} (ID: {})", label, id);

    Ok(error::SUCCESS)
}

/// Queue every song listed in a JSON file
fn handle_batch_add(manager: &DownloadManager, file: String, quality: Option<String>) -> Result<i32> {
    let quality = match parse_quality(quality) {
        Ok(quality) => quality,
        Err(e) => {
            eprintln!("Error: {}", e);
            return Ok(error::INVALID_INPUT);
        }
    };

    let file_path = PathBuf::from(&file);
    if !file_path.exists() {
        eprintln!("Error: File not found: {}", file);
        return Ok(error::NOT_FOUND);
    }

    let content = std::fs::read(&file_path).with_context(|| format!("Failed to read {}", file))?;
    let items: Vec<MusicInfo> = match serde_json::from_slice(&content) {
        Ok(items) => items,
        Err(e) => {
            eprintln!("Error: {} is not a valid song list: {}", file, e);
            return Ok(error::INVALID_INPUT);
        }
    };

    if items.is_empty() {
        println!("No songs found in file");
        return Ok(error::SUCCESS);
    }

    let ids = match manager.enqueue_batch(items, quality) {
        Ok(ids) => ids,
        Err(e) => return Ok(report_enqueue_error(&e)),
    };
    println!("Added {} download(s) from {}", ids.len(), file);
    Ok(error::SUCCESS)
}

/// List all tasks
fn handle_list(manager: &DownloadManager, json: bool) -> Result<i32> {
    let tasks = manager.task_list();
    println!("{}", output::format_tasks(&tasks, json));
    Ok(error::SUCCESS)
}

/// Show one task
fn handle_status(id: String, manager: &DownloadManager, json: bool) -> Result<i32> {
    let Some(task) = manager.get_task(&TaskId::from(id.as_str())) else {
        eprintln!("Error: Download not found: {}", id);
        return Ok(error::NOT_FOUND);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("{}", output::format_task(&task, true));
    }
    Ok(error::SUCCESS)
}

/// Download everything waiting until the queue drains or Ctrl+C
async fn handle_run(manager: &DownloadManager) -> Result<i32> {
    let mut events = manager.subscribe();
    manager.release_queue();
    let started = manager.start_all();
    tracing::info!("Run started with {} task(s)", started);

    let mut reported: HashSet<TaskId> = manager
        .task_list()
        .into_iter()
        .filter(|t| t.is_terminal())
        .map(|t| t.id)
        .collect();

    let summary = QueueSummary::from_tasks(&manager.task_list());
    if summary.is_drained() {
        println!("Nothing to download.");
        return Ok(error::SUCCESS);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    tracing::error!("Error waiting for Ctrl+C: {}", e);
                }
                let paused = manager.shutdown();
                println!("\nInterrupted, paused {} download(s)", paused);
                break;
            }
            event = events.recv() => match event {
                Ok(StoreEvent::ListChanged(tasks)) => {
                    for task in tasks.iter().filter(|t| t.is_terminal()) {
                        if reported.insert(task.id.clone()) {
                            let mark = if task.status == TaskStatus::Completed { "✓" } else { "✗" };
                            println!("\r{} {} ({})", mark, task.metadata.file_name, task.status_text);
                        }
                    }
                    let summary = QueueSummary::from_tasks(&tasks);
                    print!("\r{}   ", summary.line());
                    io::stdout().flush()?;
                    if summary.is_drained() {
                        println!();
                        break;
                    }
                }
                Ok(StoreEvent::ConfigChanged(_)) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} queue notifications", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if manager.pending_post_processing() > 0 {
        println!("Saving covers and lyrics...");
        if !manager.wait_for_post_processing(POST_PROCESS_GRACE).await {
            tracing::warn!("Post-processing still running at exit");
        }
    }

    let summary = QueueSummary::from_tasks(&manager.task_list());
    if summary.failed > 0 {
        println!("{} download(s) failed; use `retry <id>` to try again", summary.failed);
        return Ok(error::ERROR);
    }
    Ok(error::SUCCESS)
}

fn handle_resume(id: String, manager: &DownloadManager) -> Result<i32> {
    let id = TaskId::from(id);
    let Some(task) = manager.get_task(&id) else {
        eprintln!("Error: Download not found: {}", id);
        return Ok(error::NOT_FOUND);
    };
    if !manager.request_resume(&id) {
        eprintln!("Error: cannot resume a task that is {}", task.status);
        return Ok(error::INVALID_INPUT);
    }
    println!("Resumed download: {}", task.metadata.file_name);
    Ok(error::SUCCESS)
}

fn handle_retry(id: String, manager: &DownloadManager) -> Result<i32> {
    let id = TaskId::from(id);
    let Some(task) = manager.get_task(&id) else {
        eprintln!("Error: Download not found: {}", id);
        return Ok(error::NOT_FOUND);
    };
    if !manager.request_retry(&id) {
        eprintln!("Error: only failed tasks can be retried (task is {})", task.status);
        return Ok(error::INVALID_INPUT);
    }
    println!("Queued retry: {}", task.metadata.file_name);
    Ok(error::SUCCESS)
}

async fn handle_remove(id: String, manager: &DownloadManager) -> Result<i32> {
    let id = TaskId::from(id);
    let Some(task) = manager.request_cancel(&id) else {
        eprintln!("Error: Download not found: {}", id);
        return Ok(error::NOT_FOUND);
    };
    // The process may exit before the background discard runs
    manager.discard_staged(&task).await;
    println!("Removed download: {}", task.metadata.file_name);
    Ok(error::SUCCESS)
}

fn handle_clear_completed(manager: &DownloadManager) -> Result<i32> {
    let removed = manager.clear_completed();
    println!("Cleared {} completed download(s)", removed);
    Ok(error::SUCCESS)
}

/// Handle configuration commands
fn handle_config(action: ConfigAction, mut config: Config) -> Result<i32> {
    match action {
        ConfigAction::Get { key } => {
            let value = get_config_value(&config, &key)?;
            println!("{}", value);
            Ok(error::SUCCESS)
        }
        ConfigAction::Set { key, value } => {
            if let Err(e) = set_config_value(&mut config, &key, &value) {
                eprintln!("Error: {:#}", e);
                return Ok(error::INVALID_INPUT);
            }
            config.save()?;
            println!("Configuration updated: {} = {}", key, value);
            Ok(error::SUCCESS)
        }
        ConfigAction::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
            Ok(error::SUCCESS)
        }
    }
}

/// Get configuration value by dot notation key
fn get_config_value(config: &Config, key: &str) -> Result<String> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["download", "save_path"] => Ok(config
            .download
            .save_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()),
        ["download", "quality"] => Ok(config.download.quality.to_string()),
        ["download", "max_concurrent"] => Ok(config.download.max_concurrent.to_string()),
        ["download", "file_name_template"] => Ok(serde_json::to_value(config.download.file_name_template)?
            .as_str()
            .unwrap_or_default()
            .to_string()),
        ["metadata", "embed_cover"] => Ok(config.metadata.embed_cover.to_string()),
        ["metadata", "embed_lyric"] => Ok(config.metadata.embed_lyric.to_string()),
        ["metadata", "embed_lyric_translation"] => Ok(config.metadata.embed_lyric_translation.to_string()),
        ["metadata", "embed_lyric_romanization"] => Ok(config.metadata.embed_lyric_romanization.to_string()),
        ["network", "user_agent"] => Ok(config.network.user_agent.clone()),
        ["network", "connect_timeout_secs"] => Ok(config.network.connect_timeout_secs.to_string()),
        ["network", "timeout_secs"] => Ok(config.network.timeout_secs.to_string()),
        ["resolver", "api_base"] => Ok(config.resolver.api_base.clone()),
        _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
}

/// Set configuration value by dot notation key
fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["download", "save_path"] => {
            config.download.save_path = (!value.is_empty()).then(|| PathBuf::from(value));
        }
        ["download", "quality"] => {
            config.download.quality = value.parse().map_err(anyhow::Error::msg)?;
        }
        ["download", "max_concurrent"] => {
            let max: usize = value.parse()?;
            if max == 0 {
                return Err(anyhow::anyhow!("max_concurrent must be at least 1"));
            }
            config.download.max_concurrent = max;
        }
        ["download", "file_name_template"] => {
            config.download.file_name_template = value.parse().map_err(anyhow::Error::msg)?;
        }
        ["metadata", "embed_cover"] => config.metadata.embed_cover = value.parse()?,
        ["metadata", "embed_lyric"] => config.metadata.embed_lyric = value.parse()?,
        ["metadata", "embed_lyric_translation"] => config.metadata.embed_lyric_translation = value.parse()?,
        ["metadata", "embed_lyric_romanization"] => config.metadata.embed_lyric_romanization = value.parse()?,
        ["network", "user_agent"] => config.network.user_agent = value.to_string(),
        ["network", "connect_timeout_secs"] => config.network.connect_timeout_secs = value.parse()?,
        ["network", "timeout_secs"] => config.network.timeout_secs = value.parse()?,
        ["resolver", "api_base"] => {
            url::Url::parse(value).with_context(|| format!("Invalid URL: {}", value))?;
            config.resolver.api_base = value.to_string();
        }
        _ => return Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::task::FileNameTemplate;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_config_round_trip_through_keys() {
        let mut config = Config::default();
        set_config_value(&mut config, "download.save_path", "/music").unwrap();
        set_config_value(&mut config, "download.quality", "FLAC").unwrap();
        set_config_value(&mut config, "download.file_name_template", "{singer} - {name}").unwrap();
        set_config_value(&mut config, "metadata.embed_lyric_translation", "true").unwrap();

        assert_eq!(config.download.save_path, Some(PathBuf::from("/music")));
        assert_eq!(config.download.quality, Quality::Flac);
        assert_eq!(config.download.file_name_template, FileNameTemplate::SingerName);
        assert_eq!(get_config_value(&config, "download.quality").unwrap(), "flac");
        assert_eq!(
            get_config_value(&config, "download.file_name_template").unwrap(),
            "{singer} - {name}"
        );
        assert_eq!(
            get_config_value(&config, "metadata.embed_lyric_translation").unwrap(),
            "true"
        );
    }

    #[test]
    fn test_set_rejects_bad_values() {
        let mut config = Config::default();
        assert!(set_config_value(&mut config, "download.max_concurrent", "0").is_err());
        assert!(set_config_value(&mut config, "download.max_concurrent", "many").is_err());
        assert!(set_config_value(&mut config, "download.quality", "hires").is_err());
        assert!(set_config_value(&mut config, "resolver.api_base", "not a url").is_err());
        assert!(set_config_value(&mut config, "general.theme", "dark").is_err());
        assert_eq!(config.download.max_concurrent, 3);
    }

    #[test]
    fn test_empty_save_path_unsets() {
        let mut config = Config::default();
        set_config_value(&mut config, "download.save_path", "/music").unwrap();
        set_config_value(&mut config, "download.save_path", "").unwrap();
        assert_eq!(config.download.save_path, None);
        assert_eq!(get_config_value(&config, "download.save_path").unwrap(), "");
    }

    #[test]
    fn test_parse_quality() {
        assert_eq!(parse_quality(None).unwrap(), None);
        assert_eq!(parse_quality(Some("320k".to_string())).unwrap(), Some(Quality::K320));
        assert!(parse_quality(Some("lossless".to_string())).is_err());
    }
}
