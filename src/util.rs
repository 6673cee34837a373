use std::{
    future::Future,
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::{fs::File, io::AsyncWriteExt};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff as Backoff, FixedInterval},
    RetryIf,
};
use tokio_util::sync::CancellationToken;

use crate::{config::Config, reconstruct::Prober, worker::ChunkSource, worker::PlaylistSource};

pub struct HttpClient {
    /// Retries transient errors; used for playlists and the mirror list.
    pub client: ClientWithMiddleware,
    /// No retry layer. Probes must fail fast and chunk retries are counted
    /// by the worker.
    pub plain: reqwest::Client,
}

#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("reqwest error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("reqwest middleware error: {0}")]
    ReqwestMiddlewareError(#[from] reqwest_middleware::Error),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("server returned {0}")]
    Status(StatusCode),
}

impl HttpClient {
    pub fn new(config: &Config) -> reqwest::Result<HttpClient> {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

        let plain = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .build()?;

        let client = reqwest_middleware::ClientBuilder::new(plain.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(HttpClient { client, plain })
    }

    pub async fn download_file(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let mut resp = self.plain.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::Status(resp.status()));
        }

        let temp_path = path.with_extension("part");
        let mut file = File::create(&temp_path).await?;
        let mut size = 0;

        while let Some(chunk) = resp.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }

        file.flush().await?;
        tokio::fs::rename(temp_path, path).await?;

        Ok(size)
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, DownloadError> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(DownloadError::Status(resp.status()));
        }
        resp.text().await.map_err(|e| e.into())
    }
}

#[async_trait]
impl Prober for HttpClient {
    async fn exists(&self, url: &str) -> bool {
        match self.plain.get(url).send().await {
            Ok(resp) => resp.status() == StatusCode::OK,
            Err(e) => {
                trace!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }
}

#[async_trait]
impl ChunkSource for HttpClient {
    async fn fetch_chunk(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        self.download_file(url, dest).await
    }
}

#[async_trait]
impl PlaylistSource for HttpClient {
    async fn fetch_playlist(&self, url: &str) -> Result<String, DownloadError> {
        self.fetch_text(url).await
    }
}

/// Bounded retry for one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: usize,
    /// Zero means retry immediately.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Delays slept before each retry.
    pub fn delays(&self) -> Vec<Duration> {
        let retries = self.max_attempts.saturating_sub(1);
        if self.base_delay.is_zero() {
            FixedInterval::new(Duration::ZERO).take(retries).collect()
        } else {
            // Doubles from `base_delay`: 2^n * (base / 2).
            let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
            Backoff::from_millis(2)
                .factor(factor)
                .max_delay(Duration::from_secs(10))
                .map(jitter)
                .take(retries)
                .collect()
        }
    }

    /// Runs `action` until it succeeds, the attempts run out, or `cancel`
    /// fires. Returns the last result and how many attempts were made.
    pub async fn run<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut action: F,
    ) -> (Result<T, E>, usize)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = AtomicUsize::new(0);
        let result = RetryIf::start(
            self.delays(),
            || {
                attempts.fetch_add(1, Ordering::Relaxed);
                action()
            },
            |e: &E| {
                debug!("Attempt failed: {}", e);
                !cancel.is_cancelled()
            },
        )
        .await;

        (result, attempts.load(Ordering::Relaxed))
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut bytes = bytes as f64;
    let mut suffix = "B";

    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if bytes <= 1024.0 {
            break;
        }
        bytes /= 1024.0;
        suffix = next;
    }

    format!("{:.2} {}", bytes, suffix)
}
