//! Recover, list feeds and download against an in-memory platform.

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vod_recover::{
    quality,
    reconstruct::{self, Prober, Reconstructor, VodIdentity},
    util::{DownloadError, RetryPolicy},
    worker::{ChunkRange, ChunkSource, DownloadOutcome, PlaylistSource, SegmentedDownloader},
};

const MIRRORS: [&str; 2] = ["https://a.example", "https://b.example"];
// 2021-03-01 10:00:00 UTC
const MINUTE: i64 = 1_614_592_800;
const LIVE_SECOND: i64 = 17;

#[derive(Default)]
struct FakePlatform {
    live: HashSet<String>,
    playlists: HashMap<String, String>,
    chunks: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl Prober for FakePlatform {
    async fn exists(&self, url: &str) -> bool {
        self.live.contains(url)
    }
}

#[async_trait]
impl PlaylistSource for FakePlatform {
    async fn fetch_playlist(&self, url: &str) -> Result<String, DownloadError> {
        self.playlists
            .get(url)
            .cloned()
            .ok_or(DownloadError::Status(reqwest::StatusCode::NOT_FOUND))
    }
}

#[async_trait]
impl ChunkSource for FakePlatform {
    async fn fetch_chunk(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let body = self
            .chunks
            .get(url)
            .ok_or(DownloadError::Status(reqwest::StatusCode::FORBIDDEN))?;
        tokio::fs::write(dest, body).await?;
        Ok(body.len() as u64)
    }
}

/// One VOD started at 10:00:17, served by the second mirror only, with a
/// source and a 720p60 feed. Chunk 3 of the 720p60 feed is gone.
fn platform() -> FakePlatform {
    let path = reconstruct::candidate_path("foo", 123, MINUTE + LIVE_SECOND);
    let core = format!("{}{}", MIRRORS[1], path.trim_end_matches("chunked/index-dvr.m3u8"));

    let feed = format!("{}720p60/index-dvr.m3u8", core);
    let mut platform = FakePlatform::default();
    platform.live.insert(format!("{}{}", MIRRORS[1], path));
    platform.live.insert(format!("{}chunked/index-dvr.m3u8", core));
    platform.live.insert(feed.clone());

    platform.playlists.insert(
        feed,
        "#EXTM3U\n#EXTINF:10.0,\n0.ts\n#EXTINF:10.0,\n1-unmuted.ts\n#EXTINF:10.0,\n2.ts\n#EXTINF:10.0,\n3.ts\n#EXT-X-ENDLIST\n"
            .to_string(),
    );
    for name in ["0.ts", "1-muted.ts", "3.ts"] {
        platform.chunks.insert(
            format!("{}720p60/{}", core, name),
            format!("[{}]", name).into_bytes(),
        );
    }
    platform
}

#[tokio::test]
async fn recovers_and_downloads_a_vod() {
    let platform = Arc::new(platform());
    let mirrors = MIRRORS.iter().map(|m| m.to_string()).collect();
    let reconstructor = Reconstructor::new(platform.as_ref(), mirrors);

    let started = reconstruct::parse_timestamp("2021-03-01 10:00:42").unwrap();
    let identity = VodIdentity::new("Foo", 123, started);
    let found = reconstructor.find(&identity, false).await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].mirror, MIRRORS[1]);
    assert_eq!(found[0].unix_timestamp, MINUTE + LIVE_SECOND);
    assert!(reconstruct::hash_matches(&found[0].url));

    let feeds = reconstructor.enumerate_qualities(&found[0]).await;
    assert_eq!(feeds.len(), 2);
    assert_eq!(feeds.source().map(|e| e.quality), Some(Some(quality::source())));
    let feed = feeds.by_quality("720p60").unwrap().url.clone();

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("vod.ts");
    let downloader = SegmentedDownloader::new(platform.clone())
        .with_concurrency(2)
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
        })
        .with_scratch_dir(dir.path());

    let outcome = downloader
        .download(&feed, &output, ChunkRange::all(), &CancellationToken::new())
        .await
        .unwrap();

    let DownloadOutcome::Complete(report) = outcome else {
        panic!("download was not completed");
    };
    assert_eq!(report.chunks_written, 3);
    assert_eq!(report.gaps, vec![3]);
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        "[0.ts][1-muted.ts][3.ts]"
    );
}

#[tokio::test]
async fn chunk_range_limits_the_download() {
    let platform = Arc::new(platform());
    let path = reconstruct::candidate_path("foo", 123, MINUTE + LIVE_SECOND);
    let feed = format!(
        "{}{}",
        MIRRORS[1],
        path.replace("chunked/index-dvr.m3u8", "720p60/index-dvr.m3u8")
    );

    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("part.ts");
    let outcome = SegmentedDownloader::new(platform)
        .with_scratch_dir(dir.path())
        .download(
            &feed,
            &output,
            ChunkRange::new(Some(2), Some(2)),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let DownloadOutcome::Complete(report) = outcome else {
        panic!("download was not completed");
    };
    assert!(report.gaps.is_empty());
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "[1-muted.ts]");
}

#[tokio::test]
async fn unknown_vod_is_not_found() {
    let platform = platform();
    let mirrors = MIRRORS.iter().map(|m| m.to_string()).collect();
    let reconstructor = Reconstructor::new(&platform, mirrors);

    let started = reconstruct::parse_timestamp("2021-03-01 10:01:17").unwrap();
    let found = reconstructor
        .find(&VodIdentity::new("foo", 123, started), false)
        .await;
    assert!(found.is_empty());
}
