use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::quality::{self, Quality};

static RE_GROUP_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"GROUP-ID="([^"]*)""#).expect("valid regex"));
static RE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"NAME="([^"]*)""#).expect("valid regex"));
static RE_RESOLUTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"RESOLUTION=(\d+x\d+)").expect("valid regex"));
static RE_FRAME_RATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FRAME-RATE=(\d+(?:\.\d+)?)").expect("valid regex"));
static RE_TIER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)p(\d+)?").expect("valid regex"));

const SOURCE_DEFAULT_FPS: f64 = 60.0;
const HIGH_TIER_MIN_HEIGHT: u32 = 1080;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedEntry {
    pub url: String,
    /// `None` when the playlist metadata could not be classified.
    pub quality: Option<&'static Quality>,
    /// For the source feed: the catalog tier matching its actual resolution
    /// and frame rate.
    pub source_tier: Option<&'static Quality>,
}

impl FeedEntry {
    pub fn new(url: impl Into<String>, quality: Option<&'static Quality>) -> Self {
        Self {
            url: url.into(),
            quality,
            source_tier: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.quality.map(|q| q.label).unwrap_or("Unknown")
    }
}

/// Feeds of one VOD. Index 0 is reserved for the source feed when there is
/// one; everything else keeps insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedSet {
    entries: Vec<FeedEntry>,
}

impl FeedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FeedEntry) {
        self.entries.push(entry);
    }

    pub fn insert_source(&mut self, entry: FeedEntry) {
        self.entries.insert(0, entry);
    }

    pub fn get(&self, i: usize) -> Option<&FeedEntry> {
        self.entries.get(i)
    }

    pub fn source(&self) -> Option<&FeedEntry> {
        self.entries
            .first()
            .filter(|e| e.quality == Some(quality::source()))
    }

    pub fn by_quality(&self, video_token: &str) -> Option<&FeedEntry> {
        self.entries.iter().find(|e| {
            e.quality.map(|q| q.video_token) == Some(video_token)
                || e.source_tier.map(|q| q.video_token) == Some(video_token)
        })
    }

    pub fn quality_of(&self, url: &str) -> Option<&'static Quality> {
        self.entries.iter().find(|e| e.url == url)?.quality
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FeedEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Plain text listing, one `# Quality:` comment per feed.
    pub fn export(&self) -> String {
        let mut lines = vec![crate::EXPORT_HEADER.to_string()];
        for entry in &self.entries {
            lines.push(format!("# Quality: {}", entry.label()));
            lines.push(entry.url.clone());
        }
        lines.join("\n")
    }
}

impl<'a> IntoIterator for &'a FeedSet {
    type Item = &'a FeedEntry;
    type IntoIter = std::slice::Iter<'a, FeedEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line)?.get(1).map(|m| m.as_str())
}

/// Frame rate for a rendition, from the `FRAME-RATE` attribute or else from
/// the `720p60` style suffix of its name.
fn frame_rate(media: &str, stream_inf: &str) -> Option<f64> {
    if let Some(fps) = capture(&RE_FRAME_RATE, stream_inf).and_then(|f| f.parse().ok()) {
        return Some(fps);
    }
    let name = capture(&RE_NAME, media)?;
    RE_TIER_NAME
        .captures(name)?
        .get(2)
        .and_then(|m| m.as_str().parse().ok())
}

fn is_high_tier(group_id: &str) -> bool {
    RE_TIER_NAME
        .captures(group_id)
        .and_then(|c| c.get(1)?.as_str().parse::<u32>().ok())
        .map(|height| height >= HIGH_TIER_MIN_HEIGHT)
        .unwrap_or(false)
}

fn source_entry(url: &str, media: &str, stream_inf: &str) -> FeedEntry {
    let fps = frame_rate(media, stream_inf).unwrap_or(SOURCE_DEFAULT_FPS);
    let tier = capture(&RE_RESOLUTION, stream_inf)
        .and_then(|res| quality::by_resolution_and_fps(res, fps));

    FeedEntry {
        url: url.to_string(),
        quality: Some(quality::source()),
        source_tier: tier,
    }
}

fn classify(media: &str, stream_inf: &str) -> Option<&'static Quality> {
    if media.contains("audio") {
        return Some(quality::audio_only());
    }

    let group_id = capture(&RE_GROUP_ID, media)?;
    if is_high_tier(group_id) {
        let resolution = capture(&RE_RESOLUTION, stream_inf)?;
        return quality::by_resolution_and_fps(resolution, frame_rate(media, stream_inf)?);
    }

    quality::by_video_token(group_id)
}

/// Parses a master playlist into its feeds.
///
/// Each URI line is classified from the two metadata lines above it:
/// `#EXT-X-MEDIA` at offset -2 and `#EXT-X-STREAM-INF` at offset -1. Entries
/// whose metadata is missing or malformed are kept with an unknown quality.
/// The `chunked` group is the source feed and always ends up first.
pub fn parse_feeds(content: &str) -> FeedSet {
    let lines: Vec<&str> = content.lines().map(str::trim).collect();
    let mut feeds = FeedSet::new();
    let mut has_source = false;

    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (media, stream_inf) = match i {
            0 => ("", ""),
            1 => ("", lines[0]),
            _ => (lines[i - 2], lines[i - 1]),
        };

        if !media.contains("audio") && media.contains("chunked") && !has_source {
            feeds.insert_source(source_entry(line, media, stream_inf));
            has_source = true;
            continue;
        }

        let quality = classify(media, stream_inf);
        if quality.is_none() {
            debug!("Could not classify feed {}", line);
        }
        feeds.push(FeedEntry::new(*line, quality));
    }

    feeds
}
