use std::fmt;

use serde::Serialize;

/// Frame size of a quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Resolution {
    /// The untranscoded feed, whatever its real size is.
    Source,
    AudioOnly,
    Pixels { width: u32, height: u32 },
}

impl Resolution {
    /// Parses `1920x1080` style strings. `source` and `audio_only` map to the
    /// sentinels.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "source" => Some(Self::Source),
            "audio_only" | "audio-only" | "0x0" => Some(Self::AudioOnly),
            s => {
                let (w, h) = s.split_once(['x', 'X', '×'])?;
                Some(Self::Pixels {
                    width: w.parse().ok()?,
                    height: h.parse().ok()?,
                })
            }
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::AudioOnly => f.write_str("audio_only"),
            Self::Pixels { width, height } => write!(f, "{}x{}", width, height),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct Quality {
    pub label: &'static str,
    /// Path segment the platform uses for this rendition. Unique per entry.
    pub video_token: &'static str,
    pub resolution: Resolution,
    pub frame_rate: f64,
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label)
    }
}

const fn px(width: u32, height: u32) -> Resolution {
    Resolution::Pixels { width, height }
}

const fn q(label: &'static str, video_token: &'static str, resolution: Resolution, frame_rate: f64) -> Quality {
    Quality {
        label,
        video_token,
        resolution,
        frame_rate,
    }
}

/// Every rendition the platform is known to publish, best first.
pub static CATALOG: [Quality; 24] = [
    q("Source", "chunked", Resolution::Source, 0.0),
    q("4k60fps", "2160p60", px(3840, 2160), 60.0),
    q("4k30fps", "2160p30", px(3840, 2160), 30.0),
    q("2580p60fps", "2580p60", px(2580, 1080), 60.0),
    q("2580p30fps", "2580p30", px(2580, 1080), 30.0),
    q("1440p60fps", "1440p60", px(2560, 1440), 60.0),
    q("1440p30fps", "1440p30", px(2560, 1440), 30.0),
    q("1080p60fps", "1080p60", px(1920, 1080), 60.0),
    q("1080p30fps", "1080p30", px(1920, 1080), 30.0),
    q("936p60fps", "936p60", px(1664, 936), 60.0),
    q("936p30fps", "936p30", px(1664, 936), 30.0),
    q("900p60fps", "900p60", px(1600, 900), 60.0),
    q("900p30fps", "900p30", px(1600, 900), 30.0),
    q("720p60fps", "720p60", px(1280, 720), 60.0),
    q("720p30fps", "720p30", px(1280, 720), 30.0),
    q("480p60fps", "480p60", px(852, 480), 60.0),
    q("480p30fps", "480p30", px(852, 480), 30.0),
    q("360p60fps", "360p60", px(640, 360), 60.0),
    q("360p30fps", "360p30", px(640, 360), 30.0),
    q("160p60fps", "160p60", px(284, 160), 60.0),
    q("160p30fps", "160p30", px(284, 160), 30.0),
    q("144p60fps", "144p60", px(256, 144), 60.0),
    q("144p30fps", "144p30", px(256, 144), 30.0),
    q("Audio only", "audio_only", Resolution::AudioOnly, 0.0),
];

pub fn source() -> &'static Quality {
    &CATALOG[0]
}

pub fn audio_only() -> &'static Quality {
    &CATALOG[CATALOG.len() - 1]
}

pub fn by_video_token(token: &str) -> Option<&'static Quality> {
    CATALOG.iter().find(|q| q.video_token == token)
}

/// First catalog entry with the given resolution. Where several frame rates
/// share a resolution the higher one wins.
pub fn by_resolution(resolution: &str) -> Option<&'static Quality> {
    let resolution = Resolution::parse(resolution)?;
    CATALOG.iter().find(|q| q.resolution == resolution)
}

/// Frame rates are compared after rounding, so 59.94 matches a 60fps tier.
pub fn by_resolution_and_fps(resolution: &str, fps: f64) -> Option<&'static Quality> {
    let resolution = Resolution::parse(resolution)?;
    CATALOG
        .iter()
        .find(|q| q.resolution == resolution && q.frame_rate == fps.round())
}
