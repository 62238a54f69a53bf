//! Resumable, integrity-checked artifact download.
//!
//! A transfer is an offset state machine over a `<id>.<ext>.part` file:
//!
//! - an interrupted body resumes with `Range: bytes=<offset>-`;
//! - a `200` answer to a range request restarts the file from zero;
//! - `416` with a total equal to the offset means the file is complete.
//!
//! After the last byte the length is checked against the provider size and
//! the server-declared total, the sha256 against the provider digest, and
//! only then is the `.part` file renamed into place.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use vidgen_core::backoff::{next_delay, RetryBackoff};
use vidgen_core::hashing::{digest_matches, StreamingSha256};
use vidgen_core::{EngineConfig, JobId, ResultRef};
use vidgen_providers::error::is_retryable_status;

/// `.part` files untouched for this long are left over from dead transfers.
const STALE_PART_AGE: Duration = Duration::from_secs(3600);

/// Extensions recognised as finished artifacts when pruning.
const ARTIFACT_EXTENSIONS: &[&str] = &["mp4", "mov", "webm", "mkv"];

const PART_SUFFIX: &str = "part";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of one range request or body stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    /// Network error, timeout or retryable status. Resume later.
    #[error("transfer interrupted: {0}")]
    Interrupted(String),

    #[error("server rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// `416`; `total` is the resource size when the server reports it.
    #[error("requested range not satisfiable")]
    RangeNotSatisfiable { total: Option<u64> },
}

/// Why a download did not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download cancelled")]
    Cancelled,

    #[error("gave up after {attempts} interrupted attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    #[error("server rejected the download ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Range source
// ---------------------------------------------------------------------------

/// Whether the server honoured the requested offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// `206`: the body starts at the requested offset.
    Partial,
    /// `200`: the body starts at byte zero.
    Full,
}

/// An open response body.
pub struct RangeBody {
    pub kind: BodyKind,
    /// Size of the whole resource, when known.
    pub total: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, TransferError>>,
}

/// Something that can serve a URL from a byte offset.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn open(&self, url: &str, offset: u64) -> Result<RangeBody, TransferError>;
}

/// [`RangeSource`] over plain HTTP(S).
pub struct HttpRangeSource {
    client: reqwest::Client,
}

impl HttpRangeSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for HttpRangeSource {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(client)
    }
}

/// Parse `bytes <start>-<end>/<total>` or `bytes */<total>`.
///
/// Returns the start offset (if any) and the total (if not `*`).
pub fn parse_content_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let start = match range.trim() {
        "*" => None,
        r => Some(r.split_once('-')?.0.trim().parse().ok()?),
    };
    Some((start, total))
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn open(&self, url: &str, offset: u64) -> Result<RangeBody, TransferError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))?;

        let status = response.status();
        let content_range = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let (kind, total) = match status.as_u16() {
            206 => {
                let (start, total) = content_range.unwrap_or((None, None));
                if start.is_some_and(|s| s != offset) {
                    return Err(TransferError::Interrupted(format!(
                        "server answered from byte {} instead of {offset}",
                        start.unwrap_or_default()
                    )));
                }
                let total = total.or_else(|| response.content_length().map(|len| offset + len));
                (BodyKind::Partial, total)
            }
            416 => {
                return Err(TransferError::RangeNotSatisfiable {
                    total: content_range.and_then(|(_, total)| total),
                });
            }
            code if status.is_success() => {
                tracing::trace!(code, "Full body response");
                (BodyKind::Full, response.content_length())
            }
            code if is_retryable_status(code) => {
                return Err(TransferError::Interrupted(format!("HTTP {status}")));
            }
            code => {
                return Err(TransferError::Rejected {
                    status: code,
                    message: status.canonical_reason().unwrap_or("error").to_string(),
                });
            }
        };

        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| TransferError::Interrupted(e.to_string()))
            })
            .boxed();
        Ok(RangeBody {
            kind,
            total,
            chunks,
        })
    }
}

// ---------------------------------------------------------------------------
// Download manager
// ---------------------------------------------------------------------------

/// A verified file in the download directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Per-attempt outcome.
enum AttemptError {
    Retry(String),
    Cancelled,
    Fatal(DownloadError),
}

impl From<std::io::Error> for AttemptError {
    fn from(e: std::io::Error) -> Self {
        AttemptError::Fatal(DownloadError::Io(e))
    }
}

/// Offset bookkeeping shared across attempts.
struct Progress {
    offset: u64,
    total: Option<u64>,
}

pub struct DownloadManager {
    source: Arc<dyn RangeSource>,
    retries: u32,
    backoff: RetryBackoff,
    max_artifacts: usize,
}

impl DownloadManager {
    pub fn new(source: Arc<dyn RangeSource>, config: &EngineConfig) -> Self {
        Self {
            source,
            retries: config.download_retries,
            backoff: RetryBackoff::default(),
            max_artifacts: config.max_artifacts,
        }
    }

    /// Override the delay schedule between interrupted attempts.
    pub fn with_backoff(mut self, backoff: RetryBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Download `result` into `dest` as `<job_id>.<ext>`.
    ///
    /// Interrupted transfers resume from the written offset up to the
    /// configured number of retries. On any failure, cancellation included,
    /// the partial file is removed. A successful fetch prunes old artifacts.
    pub async fn fetch(
        &self,
        job_id: &JobId,
        result: &ResultRef,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Artifact, DownloadError> {
        fs::create_dir_all(dest).await?;
        let target = dest.join(format!("{job_id}.{}", artifact_extension(&result.url)));
        let part = part_path(&target);

        tracing::info!(job_id = %job_id, url = %result.url, path = %target.display(), "Starting download");

        let bytes = match self.fetch_into(job_id, result, &part, cancel).await {
            Ok(bytes) => bytes,
            Err(e) => {
                discard(&part).await;
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&part, &target).await {
            discard(&part).await;
            return Err(e.into());
        }

        tracing::info!(job_id = %job_id, bytes, path = %target.display(), "Download complete");

        match prune_artifacts(dest, self.max_artifacts).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, dir = %dest.display(), "Pruned old artifacts"),
            Err(e) => tracing::warn!(error = %e, dir = %dest.display(), "Artifact pruning failed"),
        }

        Ok(Artifact {
            path: target,
            bytes,
        })
    }

    async fn fetch_into(
        &self,
        job_id: &JobId,
        result: &ResultRef,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, DownloadError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part)
            .await?;
        let mut progress = Progress {
            offset: 0,
            total: None,
        };
        let mut failures = 0u32;
        let mut delay = self.backoff.initial_delay;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            match self
                .attempt(&mut file, &mut progress, &result.url, cancel)
                .await
            {
                Ok(()) => break,
                Err(AttemptError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retry(reason)) => {
                    failures += 1;
                    if failures > self.retries {
                        tracing::warn!(job_id = %job_id, attempts = failures, error = %reason, "Download retries exhausted");
                        return Err(DownloadError::Exhausted {
                            attempts: failures,
                            last: reason,
                        });
                    }
                    tracing::warn!(
                        job_id = %job_id,
                        offset = progress.offset,
                        attempt = failures,
                        retries = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Download interrupted, resuming",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_delay(delay, &self.backoff);
                }
            }
        }

        file.flush().await?;
        drop(file);

        verify(result, &progress, part).await?;
        Ok(progress.offset)
    }

    /// One range request, streamed to the end or to the first error.
    async fn attempt(
        &self,
        file: &mut File,
        progress: &mut Progress,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<(), AttemptError> {
        let body = match self.source.open(url, progress.offset).await {
            Ok(body) => body,
            Err(TransferError::RangeNotSatisfiable { total }) => {
                if progress.offset > 0 && total == Some(progress.offset) {
                    progress.total = total;
                    return Ok(());
                }
                restart(file, progress).await?;
                return Err(AttemptError::Retry(
                    "range not satisfiable, restarting".to_string(),
                ));
            }
            Err(TransferError::Rejected { status, message }) => {
                return Err(AttemptError::Fatal(DownloadError::Rejected { status, message }));
            }
            Err(e @ TransferError::Interrupted(_)) => return Err(AttemptError::Retry(e.to_string())),
        };

        if body.kind == BodyKind::Full && progress.offset > 0 {
            tracing::warn!(offset = progress.offset, "Server ignored range request, restarting from zero");
            restart(file, progress).await?;
        }
        if body.total.is_some() {
            progress.total = body.total;
        }

        let mut chunks = body.chunks;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                next = chunks.next() => next,
            };
            let bytes = match next {
                None => break,
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(AttemptError::Retry(e.to_string())),
            };
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            file.write_all(&bytes).await?;
            progress.offset += bytes.len() as u64;

            if let Some(total) = progress.total {
                if progress.offset > total {
                    return Err(AttemptError::Fatal(DownloadError::Integrity(format!(
                        "received {} bytes, server declared {total}",
                        progress.offset
                    ))));
                }
            }
        }

        match progress.total {
            Some(total) if progress.offset < total => Err(AttemptError::Retry(format!(
                "body ended at {} of {total} bytes",
                progress.offset
            ))),
            _ => Ok(()),
        }
    }
}

async fn restart(file: &mut File, progress: &mut Progress) -> std::io::Result<()> {
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    progress.offset = 0;
    progress.total = None;
    Ok(())
}

async fn verify(result: &ResultRef, progress: &Progress, part: &Path) -> Result<(), DownloadError> {
    let written = progress.offset;
    if written == 0 {
        return Err(DownloadError::Integrity("artifact is empty".to_string()));
    }
    for (source, expected) in [("provider", result.size), ("server", progress.total)] {
        if let Some(expected) = expected {
            if expected != written {
                return Err(DownloadError::Integrity(format!(
                    "length {written} does not match {source} size {expected}"
                )));
            }
        }
    }
    if let Some(expected) = &result.sha256 {
        let actual = sha256_file(part).await?;
        if !digest_matches(expected, &actual) {
            return Err(DownloadError::Integrity(format!(
                "sha256 {actual} does not match expected {expected}"
            )));
        }
    }
    Ok(())
}

async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = StreamingSha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish_hex())
}

async fn discard(part: &Path) {
    match fs::remove_file(part).await {
        Ok(()) => tracing::debug!(path = %part.display(), "Removed partial download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %part.display(), error = %e, "Failed to remove partial download"),
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".");
    name.push(PART_SUFFIX);
    PathBuf::from(name)
}

/// File extension for a result URL; unknown or missing extensions map to
/// `mp4`.
pub fn artifact_extension(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let name = path.rsplit('/').next().unwrap_or(path);
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    ARTIFACT_EXTENSIONS
        .iter()
        .find(|known| **known == ext)
        .copied()
        .unwrap_or("mp4")
}

/// Keep the `keep` newest artifacts in `dir` and delete stale `.part` files.
/// Returns the number of files removed.
pub async fn prune_artifacts(dir: &Path, keep: usize) -> std::io::Result<usize> {
    let now = SystemTime::now();
    let mut finished = Vec::new();
    let mut removed = 0;

    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let path = entry.path();
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        if ext == PART_SUFFIX {
            let stale = now
                .duration_since(modified)
                .is_ok_and(|age| age >= STALE_PART_AGE);
            if stale && remove_logged(&path).await {
                removed += 1;
            }
        } else if ARTIFACT_EXTENSIONS.contains(&ext.as_str()) {
            finished.push((modified, path));
        }
    }

    if finished.len() > keep {
        finished.sort_by_key(|(modified, _)| *modified);
        let excess = finished.len() - keep;
        for (_, path) in finished.into_iter().take(excess) {
            if remove_logged(&path).await {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

async fn remove_logged(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed file");
            true
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
