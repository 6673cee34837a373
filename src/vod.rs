use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    feeds::{self, FeedSet},
    reconstruct::{self, Reconstructor, VerifiedUrl, VodIdentity},
    util::{DownloadError, HttpClient},
    worker::{ChunkRange, DownloadOutcome, ProgressEvent, SegmentedDownloader, WorkerError},
};

const USHER_URL: &str = "https://usher.ttvnw.net/vod";

#[derive(thiserror::Error, Debug)]
pub enum VodError {
    #[error("No feed with quality {0}")]
    QualityUnavailable(String),
    #[error("Could not fetch master playlist")]
    MasterPlaylist(#[from] DownloadError),
    #[error("Could not build playlist URL")]
    Url(#[from] reqwest::Error),
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Token and signature authorising playback of a listed VOD. Obtaining them
/// is up to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackAccess {
    pub token: String,
    pub signature: String,
}

pub fn master_playlist_url(
    client: &reqwest::Client,
    vod_id: u64,
    access: &PlaybackAccess,
) -> Result<String, VodError> {
    let request = client
        .get(format!("{}/{}.m3u8", USHER_URL, vod_id))
        .query(&[
            ("sig", access.signature.as_str()),
            ("token", access.token.as_str()),
            ("allow_source", "true"),
            ("allow_audio_only", "true"),
            ("player", "twitchweb"),
        ])
        .build()?;
    Ok(request.url().to_string())
}

pub fn default_file_name(stream_id: u64) -> String {
    format!("vod-recover-{}", stream_id)
}

/// Runs the whole chain for one VOD: find its URL, list its feeds, download
/// one of them.
pub struct VodRecovery {
    client: Arc<HttpClient>,
    config: Config,
}

impl VodRecovery {
    pub fn new(client: Arc<HttpClient>, config: Config) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn mirrors(&self) -> Vec<String> {
        reconstruct::fetch_mirrors(
            &self.client,
            self.config.mirror_list_url.as_deref(),
            &self.config.fallback_mirrors,
        )
        .await
    }

    fn reconstructor(&self, mirrors: Vec<String>) -> Reconstructor<'_, HttpClient> {
        Reconstructor::new(self.client.as_ref(), mirrors)
            .with_probe_concurrency(self.config.probe_concurrency)
    }

    pub async fn recover(&self, identity: &VodIdentity, exact: bool) -> Vec<VerifiedUrl> {
        let mirrors = self.mirrors().await;
        self.reconstructor(mirrors).find(identity, exact).await
    }

    pub async fn feeds(&self, verified: &VerifiedUrl) -> FeedSet {
        self.reconstructor(Vec::new())
            .enumerate_qualities(verified)
            .await
    }

    /// Feeds of a VOD that is still listed.
    pub async fn listed_feeds(
        &self,
        vod_id: u64,
        access: &PlaybackAccess,
    ) -> Result<FeedSet, VodError> {
        let url = master_playlist_url(&self.client.plain, vod_id, access)?;
        let content = self.client.fetch_text(&url).await?;
        Ok(feeds::parse_feeds(&content))
    }

    pub fn output_path(&self, output: &Path) -> PathBuf {
        self.config.output_format.apply(output)
    }

    pub async fn download_feed(
        &self,
        feed_url: &str,
        output: &Path,
        range: ChunkRange,
        cancel: &CancellationToken,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<DownloadOutcome, VodError> {
        let mut downloader = SegmentedDownloader::from_config(self.client.clone(), &self.config);
        if let Some(tx) = events {
            downloader = downloader.with_events(tx);
        }
        let output = self.output_path(output);
        Ok(downloader.download(feed_url, &output, range, cancel).await?)
    }

    /// Recovers, picks a feed (the source one unless `quality` names a video
    /// token) and downloads it. `Ok(None)` means the VOD was not found.
    pub async fn download_vod(
        &self,
        identity: &VodIdentity,
        quality: Option<&str>,
        output: &Path,
        range: ChunkRange,
        cancel: &CancellationToken,
        events: Option<UnboundedSender<ProgressEvent>>,
    ) -> Result<Option<DownloadOutcome>, VodError> {
        let Some(verified) = self.recover(identity, false).await.into_iter().next() else {
            return Ok(None);
        };

        let feeds = self.feeds(&verified).await;
        let entry = match quality {
            Some(token) => feeds.by_quality(token),
            None => feeds.source().or_else(|| feeds.get(0)),
        };
        let feed_url = match entry {
            Some(entry) => entry.url.clone(),
            // The verified URL is the source playlist even if no quality probe
            // answered.
            None if quality.is_none() => verified.url.clone(),
            None => return Err(VodError::QualityUnavailable(quality.unwrap_or_default().into())),
        };

        info!("Downloading {}", feed_url);
        self.download_feed(&feed_url, output, range, cancel, events)
            .await
            .map(Some)
    }
}
