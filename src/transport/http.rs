//! HTTP transport: signed-URL issuance, streamed upload/download, status
//! polling (C3, spec §4.3).

use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::{ClientOptions, ResolvedConfig};
use crate::error::{ExperimentError, NetworkErrorKind, ProtocolErrorKind};
use crate::transport::retry::{next_poll_interval, with_backoff};

/// Shared `reqwest::Client` plus the timeout/retry knobs every request
/// obeys. One instance per `Experiment`, never re-created per call — the
/// connection pool is shared across components (spec §5).
#[derive(Clone)]
pub struct TransportClient {
    client: reqwest::Client,
    options: ClientOptions,
}

impl TransportClient {
    pub fn new(options: ClientOptions) -> Result<Self, ExperimentError> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.idle_timeout);
        if let Some(suffix) = &options.user_agent_suffix {
            builder = builder.user_agent(format!("simforge/{} {}", env!("CARGO_PKG_VERSION"), suffix));
        } else {
            builder = builder.user_agent(format!("simforge/{}", env!("CARGO_PKG_VERSION")));
        }
        let client = builder
            .build()
            .map_err(|e| ExperimentError::network(NetworkErrorKind::Connect, format!("build HTTP client: {e}")))?;
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub(crate) fn raw(&self) -> &reqwest::Client {
        &self.client
    }
}

pub(crate) fn classify_status(status: StatusCode) -> Option<ExperimentError> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(ExperimentError::Auth);
    }
    if status.is_client_error() {
        return Some(ExperimentError::protocol(ProtocolErrorKind::Rejected, format!("status {}", status.as_u16())));
    }
    None
}

fn is_retryable_network(err: &ExperimentError) -> bool {
    matches!(err, ExperimentError::Network { .. } | ExperimentError::ServiceUnavailable { .. })
}

#[derive(Debug, Clone)]
pub struct SignedUrls {
    pub upload_url: String,
    pub public_key_pem: String,
    pub status_url: String,
}

#[derive(Deserialize)]
struct SignedUrlsResponse {
    exppackageurl: Option<String>,
    #[serde(rename = "publicKey")]
    public_key: Option<String>,
    statusget: Option<String>,
}

/// `POST <gateway>/createsignedurls` (§4.3.1).
pub async fn get_signed_urls(
    transport: &TransportClient,
    config: &ResolvedConfig,
    uuid: &str,
    workload_label: &str,
    core: &str,
    token: &CancellationToken,
) -> Result<SignedUrls, ExperimentError> {
    let url = format!("{}/createsignedurls", config.gateway.trim_end_matches('/'));

    with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        let resp = transport
            .client
            .post(&url)
            .header("apikey", &config.api_key)
            .header("extversion", &config.client_version)
            .header("channel", &config.channel)
            .header("exp-uuid", uuid)
            .header("workload", workload_label)
            .header("core", core)
            .header("action", "experiment")
            .send()
            .await
            .map_err(to_network_error)?;

        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        if resp.status().is_server_error() {
            return Err(ExperimentError::network(NetworkErrorKind::Connect, format!("status {}", resp.status().as_u16())));
        }

        let body: SignedUrlsResponse = resp
            .json()
            .await
            .map_err(|e| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, format!("invalid JSON: {e}")))?;

        let upload_url = body
            .exppackageurl
            .ok_or_else(|| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, "missing exppackageurl"))?;
        let public_key_pem = body
            .public_key
            .ok_or_else(|| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, "missing publicKey"))?;
        let status_url = body
            .statusget
            .ok_or_else(|| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, "missing statusget"))?;

        Ok(SignedUrls { upload_url, public_key_pem, status_url })
    })
    .await
}

/// `PUT <uploadURL>` streamed from disk (§4.3.2).
pub async fn upload(transport: &TransportClient, upload_url: &str, path: &Path, token: &CancellationToken) -> Result<(), ExperimentError> {
    let len = tokio::fs::metadata(path)
        .await
        .map_err(|e| ExperimentError::network(NetworkErrorKind::Upload, format!("stat file: {e}")))?
        .len();

    with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ExperimentError::network(NetworkErrorKind::Upload, format!("open file: {e}")))?;
        let stream = tokio_util_file_stream(file);

        let resp = transport
            .client
            .put(upload_url)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Length", len.to_string())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(to_network_error)?;

        if !resp.status().is_success() {
            if let Some(err) = classify_status(resp.status()) {
                return Err(err);
            }
            return Err(ExperimentError::network(NetworkErrorKind::Upload, format!("status {}", resp.status().as_u16())));
        }
        Ok(())
    })
    .await
}

/// Bridge a `tokio::fs::File` into a `futures_util::Stream<Item = io::Result<Bytes>>`
/// without pulling in `tokio-util` solely for `ReaderStream`.
fn tokio_util_file_stream(file: tokio::fs::File) -> impl futures_util::Stream<Item = std::io::Result<bytes::Bytes>> {
    futures_util::stream::unfold(tokio::io::BufReader::new(file), |mut reader| async move {
        use tokio::io::AsyncReadExt;
        let mut buf = vec![0u8; 64 * 1024];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(bytes::Bytes::from(buf)), reader))
            }
            Err(e) => Some((Err(e), reader)),
        }
    })
}

pub(crate) fn to_network_error(e: reqwest::Error) -> ExperimentError {
    let kind = if e.is_timeout() { NetworkErrorKind::Timeout } else { NetworkErrorKind::Connect };
    ExperimentError::network(kind, e.to_string())
}

/// Outcome of one completed poll sequence (§4.3.3).
#[derive(Debug, Clone)]
pub enum StatusOutcome {
    Completed { result_url: String },
    NotFound,
    ServerFailure { message: String },
}

#[derive(Deserialize)]
struct StatusResponse {
    code: i64,
    url: Option<String>,
    message: Option<String>,
}

/// `GET <statusURL>` until completion/failure or `deadline` elapses
/// (§4.3.3). `deadline` is measured from the call to this function.
pub async fn poll_status(
    transport: &TransportClient,
    status_url: &str,
    deadline: Duration,
    token: &CancellationToken,
) -> Result<StatusOutcome, ExperimentError> {
    let start = Instant::now();
    let mut interval = transport.options.poll_initial_interval;

    loop {
        if token.is_cancelled() {
            return Err(ExperimentError::Cancelled);
        }
        if start.elapsed() >= deadline {
            return Err(ExperimentError::Timeout);
        }

        let attempt = match with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
            let resp = transport.client.get(status_url).send().await.map_err(to_network_error)?;
            if let Some(err) = classify_status(resp.status()) {
                return Err(err);
            }
            if resp.status().is_server_error() {
                return Err(ExperimentError::network(NetworkErrorKind::Connect, format!("status {}", resp.status().as_u16())));
            }
            resp.json::<StatusResponse>()
                .await
                .map_err(|e| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, format!("invalid JSON: {e}")))
        })
        .await
        {
            Ok(v) => v,
            // Transport errors during poll are retried until the overall
            // deadline, never terminal on their own (§4.3.3) — a burst of
            // connection resets shouldn't fail the run.
            Err(e) if is_retryable_network(&e) => {
                warn!(error = %e, interval = ?interval, "poll transport error, retrying until deadline");
                tokio::select! {
                    _ = tokio::time::sleep(interval.min(deadline.saturating_sub(start.elapsed()))) => {}
                    _ = token.cancelled() => return Err(ExperimentError::Cancelled),
                }
                interval = next_poll_interval(interval, transport.options.poll_max_interval);
                continue;
            }
            Err(e) => return Err(e),
        };

        match attempt.code {
            100 => {
                info!(interval = ?interval, "poll in progress, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(interval.min(deadline.saturating_sub(start.elapsed()))) => {}
                    _ = token.cancelled() => return Err(ExperimentError::Cancelled),
                }
                interval = next_poll_interval(interval, transport.options.poll_max_interval);
            }
            200 => {
                let result_url = attempt
                    .url
                    .ok_or_else(|| ExperimentError::protocol(ProtocolErrorKind::MalformedResponse, "code 200 missing url"))?;
                return Ok(StatusOutcome::Completed { result_url });
            }
            404 => return Ok(StatusOutcome::NotFound),
            500 => {
                return Ok(StatusOutcome::ServerFailure { message: attempt.message.unwrap_or_default() });
            }
            other => {
                return Err(ExperimentError::protocol(ProtocolErrorKind::UnknownCode, format!("unexpected status code {other}")));
            }
        }
    }
}

/// `GET <resultURL>` streamed to disk (§4.3.4). Partial files are deleted on
/// failure; truncation relative to `Content-Length` (when present) is a
/// `NetworkError{kind: truncated}`.
pub async fn download(transport: &TransportClient, result_url: &str, dest_path: &Path, token: &CancellationToken) -> Result<(), ExperimentError> {
    let attempt = with_backoff(3, Duration::from_secs(1), token, is_retryable_network, || async {
        download_once(transport, result_url, dest_path, token).await
    })
    .await;

    if attempt.is_err() {
        let _ = tokio::fs::remove_file(dest_path).await;
    }
    attempt
}

async fn download_once(transport: &TransportClient, result_url: &str, dest_path: &Path, token: &CancellationToken) -> Result<(), ExperimentError> {
    let resp = transport.client.get(result_url).send().await.map_err(to_network_error)?;
    if !resp.status().is_success() {
        if let Some(err) = classify_status(resp.status()) {
            return Err(err);
        }
        return Err(ExperimentError::network(NetworkErrorKind::Download, format!("status {}", resp.status().as_u16())));
    }
    let expected_len = resp.content_length();

    let mut file = tokio::fs::File::create(dest_path)
        .await
        .map_err(|e| ExperimentError::network(NetworkErrorKind::Download, format!("create file: {e}")))?;

    let mut stream = resp.bytes_stream();
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        if token.is_cancelled() {
            return Err(ExperimentError::Cancelled);
        }
        let chunk = chunk.map_err(to_network_error)?;
        written += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| ExperimentError::network(NetworkErrorKind::Download, format!("write file: {e}")))?;
    }
    file.flush().await.map_err(|e| ExperimentError::network(NetworkErrorKind::Download, format!("flush file: {e}")))?;

    if let Some(expected) = expected_len {
        if written != expected {
            warn!(expected, written, "download truncated");
            return Err(ExperimentError::network(NetworkErrorKind::Truncated, format!("expected {expected} bytes, got {written}")));
        }
    }
    Ok(())
}
