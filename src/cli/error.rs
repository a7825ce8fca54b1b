//! Process exit codes, stable for scripts driving the queue

use crate::download::error::DownloadError;

pub const SUCCESS: i32 = 0;
/// Runtime failure, including downloads that ended in error during `run`
pub const ERROR: i32 = 1;
/// No task with the given id
pub const NOT_FOUND: i32 = 2;
/// Bad argument, or a request the current configuration cannot serve
pub const INVALID_INPUT: i32 = 3;

/// Exit code for a failed queue operation
pub fn for_download_error(error: &DownloadError) -> i32 {
    match error {
        DownloadError::TaskNotFound(_) => NOT_FOUND,
        DownloadError::SavePathNotSet => INVALID_INPUT,
        _ => ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_codes() {
        assert_eq!(for_download_error(&DownloadError::SavePathNotSet), INVALID_INPUT);
        assert_eq!(for_download_error(&DownloadError::TaskNotFound("x".into())), NOT_FOUND);
        assert_eq!(for_download_error(&DownloadError::Interrupted), ERROR);
    }
}
