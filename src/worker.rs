//! Segmented download of one media playlist.
//!
//! A request goes `Idle -> FetchingManifest -> Downloading -> Merging ->
//! Complete`. It can end `Cancelled` while downloading or merging, and
//! `Failed` from any state. A failed merge hands the downloaded chunks back
//! so the merge can be retried. Chunks finish in whatever order the network
//! allows but are always merged by ascending index.

use std::{
    collections::BTreeMap,
    ops::RangeInclusive,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use tokio::{
    fs::File,
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc::UnboundedSender, Semaphore},
    task::{JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, hls, util};

pub const DEFAULT_CONCURRENCY: usize = 8;

#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("Could not fetch playlist {url}")]
    ManifestUnreachable {
        url: String,
        #[source]
        source: util::DownloadError,
    },
    #[error("Playlist does not list any chunks")]
    EmptyPlaylist,
    #[error("Invalid chunk range {min}..={max}")]
    InvalidRange { min: u32, max: u32 },
    #[error("No chunk could be downloaded ({failed} failed)")]
    NoChunksDownloaded { failed: usize },
    #[error("Merge failed with {succeeded} chunks downloaded and {failed} failed")]
    Merge {
        succeeded: usize,
        failed: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error")]
    IoError(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DownloadState {
    /// Accepted, nothing fetched yet.
    Idle,
    FetchingManifest,
    Downloading,
    Merging,
    Complete,
    Cancelled,
    Failed,
}

/// Advisory notifications for observers. Nothing depends on them being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    State(DownloadState),
    Started { total_chunks: usize },
    ChunkCompleted {
        index: u32,
        bytes: u64,
        /// Size of the first chunk to finish, for estimating the total.
        first_chunk_bytes: u64,
    },
    ChunkFailed { index: u32, attempts: usize },
}

#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    /// Writes the chunk at `url` to `dest` and returns its size.
    async fn fetch_chunk(&self, url: &str, dest: &Path) -> Result<u64, util::DownloadError>;
}

#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn fetch_playlist(&self, url: &str) -> Result<String, util::DownloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkJob {
    /// 1-based position in the playlist.
    pub index: u32,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChunkOutcome {
    Success { bytes: u64 },
    Failed { attempts: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResult {
    pub index: u32,
    pub path: PathBuf,
    pub outcome: ChunkOutcome,
}

impl ChunkResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ChunkOutcome::Success { .. })
    }
}

pub type MergeManifest = BTreeMap<u32, ChunkResult>;

/// Subrange of chunk indices to download. Unset bounds mean the first and
/// last chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl ChunkRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(min: Option<u32>, max: Option<u32>) -> Self {
        Self { min, max }
    }

    /// Clamps both bounds to `1..=total`.
    pub fn resolve(&self, total: u32) -> Result<RangeInclusive<u32>, WorkerError> {
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(WorkerError::InvalidRange { min, max });
            }
        }
        if total == 0 {
            return Err(WorkerError::EmptyPlaylist);
        }
        let min = self.min.unwrap_or(1).clamp(1, total);
        let max = self.max.unwrap_or(total).clamp(1, total);
        Ok(min..=max)
    }
}

/// Turns a media playlist into jobs for the chunks in `range`.
pub fn jobs_from_playlist(
    content: &str,
    playlist_url: &str,
    range: ChunkRange,
) -> Result<Vec<ChunkJob>, WorkerError> {
    let urls = hls::segment_urls(content, hls::base_url(playlist_url));
    let range = range.resolve(urls.len() as u32)?;

    Ok(urls
        .into_iter()
        .zip(1..)
        .filter(|(_, index)| range.contains(index))
        .map(|(url, index)| ChunkJob { index, url })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Absolute path of the merged file.
    pub output: PathBuf,
    pub chunks_written: usize,
    pub bytes: u64,
    /// Requested chunks that were not in the output.
    pub gaps: Vec<u32>,
}

/// Downloaded chunks waiting to be merged.
///
/// Chunk files live in a scratch directory owned by this value and are
/// deleted when it is dropped, whichever way the request ended.
#[derive(Debug)]
pub struct ChunkSet {
    scratch: TempDir,
    expected: Vec<u32>,
    manifest: MergeManifest,
}

impl ChunkSet {
    pub fn manifest(&self) -> &MergeManifest {
        &self.manifest
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn succeeded(&self) -> usize {
        self.manifest.values().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.manifest.len() - self.succeeded()
    }

    /// Requested indices without a successful chunk, ascending.
    pub fn gaps(&self) -> Vec<u32> {
        self.expected
            .iter()
            .copied()
            .filter(|i| !self.manifest.get(i).is_some_and(ChunkResult::is_success))
            .collect()
    }

    /// Writes every successful chunk to `output` in index order, skipping
    /// gaps. Chunk files are left in place, so this can be repeated.
    ///
    /// Returns `None` when there is nothing to merge or `cancel` fired before
    /// the output was complete; any partial output is removed.
    pub async fn merge(
        &self,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<MergeReport>, WorkerError> {
        let gaps = self.gaps();
        for gap in &gaps {
            warn!("Chunk {} is missing, skipping it", gap);
        }

        if self.succeeded() == 0 {
            return Ok(None);
        }

        match self.write_merged(output, cancel).await {
            Ok(Some((chunks_written, bytes))) => {
                let output = tokio::fs::canonicalize(output).await?;
                info!("Merged {} chunks into {}", chunks_written, output.display());
                Ok(Some(MergeReport {
                    output,
                    chunks_written,
                    bytes,
                    gaps,
                }))
            }
            Ok(None) => {
                info!("Merge cancelled");
                let _ = tokio::fs::remove_file(output).await;
                Ok(None)
            }
            Err(source) => {
                let _ = tokio::fs::remove_file(output).await;
                Err(WorkerError::Merge {
                    succeeded: self.succeeded(),
                    failed: self.failed(),
                    source,
                })
            }
        }
    }

    async fn write_merged(
        &self,
        output: &Path,
        cancel: &CancellationToken,
    ) -> std::io::Result<Option<(usize, u64)>> {
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut out = BufWriter::new(File::create(output).await?);
        let mut written = 0;
        let mut bytes = 0;

        for result in self.manifest.values().filter(|r| r.is_success()) {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let mut chunk = File::open(&result.path).await?;
            bytes += tokio::io::copy(&mut chunk, &mut out).await?;
            written += 1;
        }

        out.flush().await?;
        Ok(Some((written, bytes)))
    }

    /// Deletes the chunk files now instead of on drop.
    pub fn release(self) -> std::io::Result<()> {
        self.scratch.close()
    }
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Complete(MergeReport),
    /// Whatever had finished when the request was cancelled. Call
    /// [`ChunkSet::merge`] to keep it.
    Cancelled(ChunkSet),
    /// Every chunk was fetched but writing the output failed. The chunks are
    /// still on disk; call [`ChunkSet::merge`] again once the cause is fixed.
    MergeFailed { chunks: ChunkSet, error: WorkerError },
}

/// Counts transfers in progress and remembers the highest count seen.
#[derive(Debug, Default)]
pub struct AdmissionCounter {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl AdmissionCounter {
    fn enter(self: &Arc<Self>) -> AdmissionGuard {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        AdmissionGuard(self.clone())
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct AdmissionGuard(Arc<AdmissionCounter>);

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Everything a chunk task needs, cloned once per task.
struct JobContext<S> {
    source: Arc<S>,
    retry: util::RetryPolicy,
    cancel: CancellationToken,
    counter: Arc<AdmissionCounter>,
    events: Option<UnboundedSender<ProgressEvent>>,
    first_chunk_bytes: Arc<OnceLock<u64>>,
    dir: PathBuf,
}

impl<S> Clone for JobContext<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            counter: self.counter.clone(),
            events: self.events.clone(),
            first_chunk_bytes: self.first_chunk_bytes.clone(),
            dir: self.dir.clone(),
        }
    }
}

impl<S> JobContext<S> {
    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

async fn remove_partial(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
    let _ = tokio::fs::remove_file(path.with_extension("part")).await;
}

/// Fetches one chunk with retries. `None` means the job was cancelled and
/// left nothing behind.
async fn run_job<S: ChunkSource>(ctx: JobContext<S>, job: ChunkJob) -> Option<ChunkResult> {
    if ctx.cancel.is_cancelled() {
        return None;
    }

    let path = ctx.dir.join(format!("{:06}.ts", job.index));
    let _slot = ctx.counter.enter();

    let fetch = ctx
        .retry
        .run(&ctx.cancel, || ctx.source.fetch_chunk(&job.url, &path));
    let (result, attempts) = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            remove_partial(&path).await;
            return None;
        }
        r = fetch => r,
    };

    match result {
        Ok(bytes) => {
            let first = *ctx.first_chunk_bytes.get_or_init(|| bytes);
            ctx.emit(ProgressEvent::ChunkCompleted {
                index: job.index,
                bytes,
                first_chunk_bytes: first,
            });
            Some(ChunkResult {
                index: job.index,
                path,
                outcome: ChunkOutcome::Success { bytes },
            })
        }
        Err(_) if ctx.cancel.is_cancelled() => {
            remove_partial(&path).await;
            None
        }
        Err(e) => {
            warn!("Chunk {} failed after {} attempts: {}", job.index, attempts, e);
            remove_partial(&path).await;
            ctx.emit(ProgressEvent::ChunkFailed {
                index: job.index,
                attempts,
            });
            Some(ChunkResult {
                index: job.index,
                path,
                outcome: ChunkOutcome::Failed { attempts },
            })
        }
    }
}

fn record(joined: Result<Option<ChunkResult>, JoinError>, manifest: &mut MergeManifest) {
    match joined {
        Ok(Some(result)) => {
            manifest.insert(result.index, result);
        }
        Ok(None) => (),
        Err(e) => error!("Chunk task panicked: {}", e),
    }
}

pub struct SegmentedDownloader<S> {
    source: Arc<S>,
    concurrency: usize,
    retry: util::RetryPolicy,
    scratch_parent: Option<PathBuf>,
    events: Option<UnboundedSender<ProgressEvent>>,
    counter: Arc<AdmissionCounter>,
}

impl<S: ChunkSource> SegmentedDownloader<S> {
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            concurrency: DEFAULT_CONCURRENCY,
            retry: util::RetryPolicy::default(),
            scratch_parent: None,
            events: None,
            counter: Arc::default(),
        }
    }

    pub fn from_config(source: Arc<S>, config: &Config) -> Self {
        let mut downloader = Self::new(source)
            .with_concurrency(config.concurrency)
            .with_retry(config.retry_policy());
        downloader.scratch_parent = config.scratch_dir.clone();
        downloader
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: util::RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_parent = Some(dir.into());
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<ProgressEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn admissions(&self) -> &AdmissionCounter {
        &self.counter
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn transition(&self, state: DownloadState) {
        debug!("Download state: {:?}", state);
        self.emit(ProgressEvent::State(state));
    }

    fn scratch(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("vod-recover-");
        match &self.scratch_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
    }

    /// Downloads `jobs` with at most `concurrency` transfers at once.
    ///
    /// Once `cancel` fires no new job starts and transfers in flight are
    /// dropped; the returned set then holds only the chunks that finished.
    pub async fn download_chunks(
        &self,
        jobs: Vec<ChunkJob>,
        cancel: &CancellationToken,
    ) -> Result<ChunkSet, WorkerError> {
        let scratch = self.scratch()?;
        let expected: Vec<u32> = jobs.iter().map(|j| j.index).collect();
        let gate = Arc::new(Semaphore::new(self.concurrency));
        let ctx = JobContext {
            source: self.source.clone(),
            retry: self.retry.clone(),
            cancel: cancel.clone(),
            counter: self.counter.clone(),
            events: self.events.clone(),
            first_chunk_bytes: Arc::default(),
            dir: scratch.path().to_path_buf(),
        };

        self.emit(ProgressEvent::Started {
            total_chunks: jobs.len(),
        });
        info!(
            "Downloading {} chunks, {} at a time",
            jobs.len(),
            self.concurrency
        );

        let mut tasks = JoinSet::new();
        let mut manifest = MergeManifest::new();

        for job in jobs {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = gate.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = tasks.try_join_next() {
                record(joined, &mut manifest);
            }

            let ctx = ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                run_job(ctx, job).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            record(joined, &mut manifest);
        }

        let chunks = ChunkSet {
            scratch,
            expected,
            manifest,
        };
        info!(
            "{} chunks downloaded, {} failed",
            chunks.succeeded(),
            chunks.failed()
        );
        Ok(chunks)
    }
}

impl<S: ChunkSource + PlaylistSource> SegmentedDownloader<S> {
    pub async fn fetch_jobs(
        &self,
        playlist_url: &str,
        range: ChunkRange,
    ) -> Result<Vec<ChunkJob>, WorkerError> {
        let content = self
            .source
            .fetch_playlist(playlist_url)
            .await
            .map_err(|source| WorkerError::ManifestUnreachable {
                url: playlist_url.to_string(),
                source,
            })?;
        jobs_from_playlist(&content, playlist_url, range)
    }

    /// Fetches the playlist at `playlist_url`, downloads its chunks and
    /// merges them into `output`.
    pub async fn download(
        &self,
        playlist_url: &str,
        output: &Path,
        range: ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, WorkerError> {
        self.transition(DownloadState::Idle);
        let result = self.run(playlist_url, output, range, cancel).await;
        match &result {
            Ok(DownloadOutcome::Complete(_)) => self.transition(DownloadState::Complete),
            Ok(DownloadOutcome::Cancelled(_)) => self.transition(DownloadState::Cancelled),
            Ok(DownloadOutcome::MergeFailed { error, .. }) => {
                error!("Merge of {} failed: {}", playlist_url, error);
                self.transition(DownloadState::Failed);
            }
            Err(e) => {
                error!("Download of {} failed: {}", playlist_url, e);
                self.transition(DownloadState::Failed);
            }
        }
        result
    }

    async fn run(
        &self,
        playlist_url: &str,
        output: &Path,
        range: ChunkRange,
        cancel: &CancellationToken,
    ) -> Result<DownloadOutcome, WorkerError> {
        self.transition(DownloadState::FetchingManifest);
        let jobs = self.fetch_jobs(playlist_url, range).await?;

        self.transition(DownloadState::Downloading);
        let chunks = self.download_chunks(jobs, cancel).await?;
        if cancel.is_cancelled() {
            return Ok(DownloadOutcome::Cancelled(chunks));
        }
        if chunks.succeeded() == 0 {
            return Err(WorkerError::NoChunksDownloaded {
                failed: chunks.failed(),
            });
        }

        self.transition(DownloadState::Merging);
        match chunks.merge(output, cancel).await {
            Ok(Some(report)) => Ok(DownloadOutcome::Complete(report)),
            Ok(None) => Ok(DownloadOutcome::Cancelled(chunks)),
            Err(error) => Ok(DownloadOutcome::MergeFailed { chunks, error }),
        }
    }
}
