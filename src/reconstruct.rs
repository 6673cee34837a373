//! Rediscovers the private storage URL of a VOD from what is known about the
//! broadcast: channel login, stream id and start time.
//!
//! The platform stores every VOD under
//! `/{hash}_{channel}_{stream id}_{unix start}/chunked/index-dvr.m3u8`, where
//! `hash` is the first 20 hex characters of the SHA-1 of the rest of the
//! directory name. The directory can be served by any of several mirrors, so
//! every candidate path is probed against each of them.

use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, NaiveDateTime, TimeDelta, Utc};
use futures::{stream, StreamExt};
use regex::Regex;
use serde::Serialize;
use sha1::{Digest, Sha1};

use crate::{
    feeds::{FeedEntry, FeedSet},
    quality, util,
};

pub const MANIFEST_EXT: &str = "m3u8";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const HASH_LEN: usize = 20;
const SECONDS_PER_MINUTE: i64 = 60;

static RE_VOD_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://[^/]+)/([0-9a-f]{20})_(.+)_(\d+)_(\d+)/chunked/index-dvr\.m3u8$")
        .expect("valid regex")
});

#[derive(thiserror::Error, Debug)]
pub enum ReconstructError {
    #[error("Invalid timestamp {0:?}, expected YYYY-MM-DD HH:mm:ss")]
    InvalidTimestamp(String),
    #[error("Could not fetch mirror list")]
    MirrorList(#[from] util::DownloadError),
}

/// Existence check for a URL. Any failure counts as "not there".
#[async_trait]
pub trait Prober: Send + Sync {
    async fn exists(&self, url: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VodIdentity {
    pub channel: String,
    pub stream_id: u64,
    pub started_at: DateTime<Utc>,
}

impl VodIdentity {
    pub fn new(channel: impl Into<String>, stream_id: u64, started_at: DateTime<Utc>) -> Self {
        Self {
            channel: channel.into().to_lowercase(),
            stream_id,
            started_at,
        }
    }

    pub fn path_at(&self, unix_timestamp: i64) -> String {
        candidate_path(&self.channel, self.stream_id, unix_timestamp)
    }

    /// Unix timestamps of every second in the start minute.
    pub fn minute_candidates(&self) -> impl Iterator<Item = i64> {
        let minute = self
            .started_at
            .duration_trunc(TimeDelta::minutes(1))
            .unwrap_or(self.started_at)
            .timestamp();
        (0..SECONDS_PER_MINUTE).map(move |offset| minute + offset)
    }
}

/// Parses `YYYY-MM-DD HH:mm:ss` as UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, ReconstructError> {
    NaiveDateTime::parse_from_str(s.trim(), TIMESTAMP_FORMAT)
        .map(|dt| dt.and_utc())
        .map_err(|_| ReconstructError::InvalidTimestamp(s.to_string()))
}

pub fn vod_hash(base: &str) -> String {
    let digest = Sha1::digest(base.as_bytes());
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LEN);
    hash
}

/// `hash_channel_streamId_unixTimestamp`
pub fn directory_name(channel: &str, stream_id: u64, unix_timestamp: i64) -> String {
    let base = format!("{}_{}_{}", channel, stream_id, unix_timestamp);
    format!("{}_{}", vod_hash(&base), base)
}

pub fn candidate_path(channel: &str, stream_id: u64, unix_timestamp: i64) -> String {
    format!(
        "/{}/chunked/index-dvr.{}",
        directory_name(channel, stream_id, unix_timestamp),
        MANIFEST_EXT
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedUrl {
    pub mirror: String,
    pub url: String,
    pub unix_timestamp: i64,
}

impl VerifiedUrl {
    /// Splits a VOD playlist URL back into its parts. The hash is not checked.
    pub fn parse(url: &str) -> Option<Self> {
        let caps = RE_VOD_URL.captures(url.trim())?;
        Some(Self {
            mirror: caps[1].to_string(),
            url: caps[0].to_string(),
            unix_timestamp: caps[5].parse().ok()?,
        })
    }

    /// Everything before the quality segment, e.g. `https://mirror/{dir}/`.
    pub fn core_url(&self) -> &str {
        self.url
            .strip_suffix(&format!("chunked/index-dvr.{}", MANIFEST_EXT))
            .unwrap_or(&self.url)
    }
}

/// Checks that the hash in a VOD URL is the one its own name produces.
pub fn hash_matches(url: &str) -> bool {
    let Some(caps) = RE_VOD_URL.captures(url) else {
        return false;
    };
    let base = format!("{}_{}_{}", &caps[3], &caps[4], &caps[5]);
    vod_hash(&base) == caps[2]
}

fn normalize_mirror(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(line.trim_end_matches('/').to_string())
}

fn dedup(mirrors: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for m in mirrors {
        if !out.contains(&m) {
            out.push(m);
        }
    }
    out
}

/// Mirrors from a newline separated text file. Blank and `#` lines are
/// skipped.
pub fn parse_mirrors(text: &str) -> Vec<String> {
    dedup(text.lines().filter_map(normalize_mirror))
}

/// Downloads the mirror list, or returns `fallback` when the list cannot be
/// fetched or is empty.
pub async fn fetch_mirrors(
    client: &util::HttpClient,
    url: Option<&str>,
    fallback: &[String],
) -> Vec<String> {
    let fetched = match url {
        Some(url) => match client.fetch_text(url).await {
            Ok(text) => parse_mirrors(&text),
            Err(e) => {
                warn!("{}, using built-in mirrors", ReconstructError::from(e));
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    if fetched.is_empty() {
        dedup(fallback.iter().filter_map(|m| normalize_mirror(m)))
    } else {
        fetched
    }
}

pub fn export_results(urls: &[VerifiedUrl]) -> String {
    let mut lines = vec![crate::EXPORT_HEADER.to_string()];
    lines.extend(urls.iter().map(|u| u.url.clone()));
    lines.join("\n")
}

pub struct Reconstructor<'a, P: Prober + ?Sized> {
    prober: &'a P,
    mirrors: Vec<String>,
    probe_concurrency: usize,
}

impl<'a, P: Prober + ?Sized> Reconstructor<'a, P> {
    pub fn new(prober: &'a P, mirrors: Vec<String>) -> Self {
        Self {
            prober,
            mirrors,
            probe_concurrency: 4,
        }
    }

    pub fn with_probe_concurrency(mut self, n: usize) -> Self {
        self.probe_concurrency = n.max(1);
        self
    }

    pub fn mirrors(&self) -> &[String] {
        &self.mirrors
    }

    /// Every mirror serving `path`, in mirror list order.
    pub async fn verify_path(&self, path: &str, unix_timestamp: i64) -> Vec<VerifiedUrl> {
        stream::iter(self.mirrors.iter())
            .map(|mirror| async move {
                let url = format!("{}{}", mirror, path);
                self.prober.exists(&url).await.then(|| VerifiedUrl {
                    mirror: mirror.clone(),
                    url,
                    unix_timestamp,
                })
            })
            .buffered(self.probe_concurrency)
            .filter_map(|v| async move { v })
            .collect()
            .await
    }

    /// Probes only the exact start second.
    pub async fn find_exact(&self, identity: &VodIdentity) -> Vec<VerifiedUrl> {
        let ts = identity.started_at.timestamp();
        self.verify_path(&identity.path_at(ts), ts).await
    }

    /// Probes each second of the start minute in order and stops at the
    /// first one that resolves. An empty result means not found.
    pub async fn search_minute(&self, identity: &VodIdentity) -> Vec<VerifiedUrl> {
        for ts in identity.minute_candidates() {
            let found = self.verify_path(&identity.path_at(ts), ts).await;
            if !found.is_empty() {
                info!(
                    "Found VOD {} at {} on {} mirror(s)",
                    identity.stream_id,
                    ts,
                    found.len()
                );
                return found;
            }
            trace!("No mirror serves {}_{} at {}", identity.channel, identity.stream_id, ts);
        }

        info!(
            "VOD {} not found within the minute starting {}",
            identity.stream_id, identity.started_at
        );
        Vec::new()
    }

    pub async fn find(&self, identity: &VodIdentity, exact: bool) -> Vec<VerifiedUrl> {
        if exact {
            self.find_exact(identity).await
        } else {
            self.search_minute(identity).await
        }
    }

    /// Probes every catalog quality under a verified URL.
    pub async fn enumerate_qualities(&self, verified: &VerifiedUrl) -> FeedSet {
        let core = verified.core_url();
        let found: Vec<_> = stream::iter(quality::CATALOG.iter())
            .map(|q| async move {
                let url = format!("{}{}/index-dvr.{}", core, q.video_token, MANIFEST_EXT);
                self.prober.exists(&url).await.then(|| FeedEntry::new(url, Some(q)))
            })
            .buffered(self.probe_concurrency)
            .filter_map(|v| async move { v })
            .collect()
            .await;

        let mut feeds = FeedSet::new();
        for entry in found {
            if entry.quality == Some(quality::source()) {
                feeds.insert_source(entry);
            } else {
                feeds.push(entry);
            }
        }
        feeds
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Mutex};

    use super::*;

    const FOO_MINUTE: i64 = 1_614_592_800;

    /// Answers yes for a fixed set of URLs and records every probe.
    #[derive(Default)]
    struct FakeProber {
        live: HashSet<String>,
        probed: Mutex<Vec<String>>,
    }

    impl FakeProber {
        fn with(live: &[String]) -> Self {
            Self {
                live: live.iter().cloned().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn exists(&self, url: &str) -> bool {
            self.probed.lock().unwrap().push(url.to_string());
            self.live.contains(url)
        }
    }

    fn mirrors() -> Vec<String> {
        vec!["https://a.example".into(), "https://b.example".into(), "https://c.example".into()]
    }

    fn foo() -> VodIdentity {
        VodIdentity::new("foo", 123456789, parse_timestamp("2021-03-01 10:00:00").unwrap())
    }

    #[test]
    fn reference_hashes() {
        assert_eq!(foo().started_at.timestamp(), FOO_MINUTE);
        assert_eq!(vod_hash("foo_123456789_1614592800"), "d6da8c2a685b618e40b8");
        assert_eq!(vod_hash("foo_123456789_1614592801"), "f5f83c13d986673f29e6");
        assert_eq!(vod_hash("foo_123456789_1614592859"), "3db87aa719adabcff5e9");
        assert_eq!(
            candidate_path("foo", 123456789, FOO_MINUTE),
            "/d6da8c2a685b618e40b8_foo_123456789_1614592800/chunked/index-dvr.m3u8"
        );
    }

    /// Hash of `foo_123456789_{FOO_MINUTE + i}` for every second of the minute.
    const FOO_MINUTE_HASHES: [&str; 60] = [
        "d6da8c2a685b618e40b8",
        "f5f83c13d986673f29e6",
        "6da6824407a1aac402a8",
        "d1c800940549a313380e",
        "2c94c74daebd29d46b74",
        "7a2dc8b9b1e9863095fc",
        "03ce72cb5e2fede57f53",
        "596b2d94211eb298914f",
        "e924aececd2f4a46d261",
        "174c92f7f29c42babd0d",
        "58624d9fd374f9e217e7",
        "975debdad500c70d09f3",
        "685bb8050f54bf89e2d0",
        "b43084ddacdb0e711902",
        "2c65439d8070792ab047",
        "016f2bae7627079c2668",
        "af770597ec7bedea2e11",
        "e3baf22b37a4f78c2e8b",
        "303ee291f1064056ea27",
        "388e0882cbcd7ce37e29",
        "deca5a6c153f41bcc5d9",
        "b616482114606ac3e3ba",
        "029bb3c3725a543c23a9",
        "0d7590b56c88cdcc613e",
        "4695ee6e2633c4e13cbb",
        "312f85d3dfc056e1e79d",
        "16a9e72a0b228c06aa33",
        "ca5d9c378164c95de18c",
        "950158b9124add79df49",
        "daa60dea73014b89f6d4",
        "ae74bfab75fbfd73dd29",
        "a03073abee8c2140d63f",
        "e7de7d4a965ac0dcd26e",
        "43b5dfe415d902259102",
        "a56b0913d29c3d917fb0",
        "09715e145597b14e42ce",
        "29dd8f6490072c23e35b",
        "61bcc0a57aa7a6b7ec82",
        "b154f680cccaae88e712",
        "dd9533871d2553a0e389",
        "b2e00ed1dd7443948ed0",
        "aeec52e9c5e907d713db",
        "8c15837b279368f06ea6",
        "e5fb9e7cba0253b6ab03",
        "8c8d9a746883e18ad7c8",
        "08ef68bb14ad86ec3479",
        "7dd3b7eb7d1d2c8355c6",
        "60ede2200704e960f905",
        "5fd682aa36a678a22c5f",
        "c145f06aa844d4483737",
        "62e6d77cbdb530577a91",
        "0e163fc15f7a1be501f9",
        "f2d2b60b9b0e0c939252",
        "4edf5fa09cbd18765075",
        "dce9b28ad8900e996516",
        "79ead0f55c505e833f8f",
        "dc3844d919c777dd76b8",
        "538815e2de7a14ee2c3f",
        "f0aba9d9a574151c9ed3",
        "3db87aa719adabcff5e9",
    ];

    #[test]
    fn reference_hash_for_every_second() {
        let candidates: Vec<_> = foo().minute_candidates().collect();
        assert_eq!(candidates.len(), FOO_MINUTE_HASHES.len());
        for (ts, expected) in candidates.into_iter().zip(FOO_MINUTE_HASHES) {
            assert_eq!(
                foo().path_at(ts),
                format!("/{}_foo_123456789_{}/chunked/index-dvr.m3u8", expected, ts)
            );
        }
    }

    #[test]
    fn every_candidate_round_trips() {
        let candidates: Vec<_> = foo().minute_candidates().collect();
        assert_eq!(candidates.len(), 60);
        assert_eq!(candidates[0], FOO_MINUTE);
        assert_eq!(candidates[59], FOO_MINUTE + 59);

        for ts in candidates {
            let url = format!("https://a.example{}", foo().path_at(ts));
            assert!(hash_matches(&url), "{}", url);
        }
        assert!(!hash_matches(
            "https://a.example/00000000000000000000_foo_123456789_1614592800/chunked/index-dvr.m3u8"
        ));
    }

    #[test]
    fn minute_truncates_seconds() {
        let id = VodIdentity::new("Foo", 1, parse_timestamp("2021-03-01 10:00:42").unwrap());
        assert_eq!(id.channel, "foo");
        assert_eq!(id.minute_candidates().next(), Some(FOO_MINUTE));
    }

    #[test]
    fn bad_timestamp() {
        assert!(matches!(
            parse_timestamp("2021-03-01T10:00"),
            Err(ReconstructError::InvalidTimestamp(_))
        ));
    }

    #[test]
    fn mirror_list_parsing() {
        let text = "# mirrors\nhttps://a.example/\n\nhttps://b.example\nhttps://a.example\n";
        assert_eq!(parse_mirrors(text), vec!["https://a.example", "https://b.example"]);
    }

    #[tokio::test]
    async fn search_returns_all_mirrors_for_resolved_second() {
        let path = foo().path_at(FOO_MINUTE + 17);
        let live = vec![
            format!("https://a.example{}", path),
            format!("https://c.example{}", path),
        ];
        let prober = FakeProber::with(&live);
        let found = Reconstructor::new(&prober, mirrors()).search_minute(&foo()).await;

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].url, live[0]);
        assert_eq!(found[1].url, live[1]);
        assert!(found.iter().all(|v| v.unix_timestamp == FOO_MINUTE + 17));
        assert!(found.iter().all(|v| hash_matches(&v.url)));

        // Seconds after the hit are never probed.
        let probed = prober.probed.lock().unwrap();
        assert_eq!(probed.len(), 18 * 3);
    }

    #[tokio::test]
    async fn search_not_found_is_empty() {
        let prober = FakeProber::default();
        let r = Reconstructor::new(&prober, mirrors());
        assert!(r.search_minute(&foo()).await.is_empty());
        assert_eq!(prober.probed.lock().unwrap().len(), 60 * 3);
        assert!(r.find(&foo(), true).await.is_empty());
    }

    #[tokio::test]
    async fn qualities_under_verified_url() {
        let dir = directory_name("foo", 123456789, FOO_MINUTE);
        let core = format!("https://a.example/{}/", dir);
        let live = vec![
            format!("{}720p60/index-dvr.m3u8", core),
            format!("{}chunked/index-dvr.m3u8", core),
            format!("{}audio_only/index-dvr.m3u8", core),
        ];
        let prober = FakeProber::with(&live);
        let verified = VerifiedUrl {
            mirror: "https://a.example".into(),
            url: live[1].clone(),
            unix_timestamp: FOO_MINUTE,
        };

        let feeds = Reconstructor::new(&prober, mirrors())
            .enumerate_qualities(&verified)
            .await;

        assert_eq!(feeds.len(), 3);
        assert_eq!(feeds.source().map(|e| e.url.as_str()), Some(live[1].as_str()));
        assert_eq!(feeds.get(1).map(|e| e.url.as_str()), Some(live[0].as_str()));
        assert_eq!(prober.probed.lock().unwrap().len(), quality::CATALOG.len());
    }

    #[test]
    fn parse_verified_url() {
        let url = format!("https://b.example{}", foo().path_at(FOO_MINUTE + 5));
        let parsed = VerifiedUrl::parse(&url).unwrap();
        assert_eq!(parsed.mirror, "https://b.example");
        assert_eq!(parsed.unix_timestamp, FOO_MINUTE + 5);
        assert!(parsed.core_url().ends_with("_foo_123456789_1614592805/"));
        assert!(VerifiedUrl::parse("https://b.example/720p60/index-dvr.m3u8").is_none());
    }

    #[test]
    fn export_lists_urls() {
        let urls = vec![VerifiedUrl {
            mirror: "https://a.example".into(),
            url: "https://a.example/x/chunked/index-dvr.m3u8".into(),
            unix_timestamp: 0,
        }];
        let text = export_results(&urls);
        assert!(text.ends_with("https://a.example/x/chunked/index-dvr.m3u8"));
    }
}
