pub mod app;
pub mod cli;
pub mod download;
pub mod file;
pub mod util;

pub use app::config::Config;
pub use download::manager::DownloadManager;
