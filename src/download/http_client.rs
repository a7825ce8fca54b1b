use super::error::DownloadResult;
use super::http_errors::HttpErrorInfo;
use super::transport::{TransferHooks, TransferJob, TransferOutcome, TransferRequest, Transport};
use crate::app::config::NetworkConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Streams songs and covers over HTTP with reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration, timeout: Duration) -> DownloadResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        Ok(Self { client })
    }

    pub fn from_config(network: &NetworkConfig) -> DownloadResult<Self> {
        Self::new(
            &network.user_agent,
            Duration::from_secs(network.connect_timeout_secs),
            Duration::from_secs(network.timeout_secs),
        )
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn begin_transfer(&self, request: TransferRequest, hooks: TransferHooks) -> TransferJob {
        let client = self.client.clone();
        TransferJob::spawn(download_to_file(client, request, hooks))
    }

    async fn discard_partial(&self, destination: &Path) -> DownloadResult<()> {
        match tokio::fs::remove_file(partial_path(destination)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Staging file the body is streamed into before the final rename
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Download `request.url` with streaming and progress hooks.
///
/// The body goes to `<destination>.part` and is renamed into place once
/// complete, so an interrupted transfer never leaves a truncated song at
/// the destination. Any status other than 200 is returned as-is without
/// touching the filesystem.
async fn download_to_file(
    client: reqwest::Client,
    request: TransferRequest,
    hooks: TransferHooks,
) -> DownloadResult<TransferOutcome> {
    tracing::trace!("Starting download: url={}, path={:?}", request.url, request.destination);

    let mut builder = client.get(&request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    tracing::trace!("Received response with status: {}", status);

    if status != 200 {
        tracing::warn!(
            "Transfer rejected for {}: {}",
            request.url,
            HttpErrorInfo::from_status(status).format()
        );
        return Ok(TransferOutcome {
            status_code: status,
            bytes_written: 0,
        });
    }

    let total = response.content_length().unwrap_or(0);
    (hooks.on_begin)(total);

    let partial = partial_path(&request.destination);
    match stream_body(response, &partial, &hooks, total).await {
        Ok(written) => {
            tokio::fs::rename(&partial, &request.destination).await?;
            Ok(TransferOutcome {
                status_code: status,
                bytes_written: written,
            })
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

async fn stream_body(
    response: reqwest::Response,
    path: &Path,
    hooks: &TransferHooks,
    total: u64,
) -> DownloadResult<u64> {
    let file = File::create(path).await?;
    // 64KB buffer keeps syscall count low on fast links
    let mut file = BufWriter::with_capacity(64 * 1024, file);

    let mut stream = response.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
        (hooks.on_progress)(written, total);
    }

    file.flush().await?;
    Ok(written)
}
