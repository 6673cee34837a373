use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::util::RetryPolicy;

pub const DEFAULT_MIRROR_LIST_URL: &str =
    "https://raw.githubusercontent.com/esseivan/TwitchRecoverCS/main/domains.txt";

pub const FALLBACK_MIRRORS: &[&str] = &[
    "https://vod-secure.twitch.tv",
    "https://vod-metro.twitch.tv",
    "https://d2e2de1etea730.cloudfront.net",
    "https://dqrpb9wgowsf5.cloudfront.net",
    "https://ds0h3roq6wcgc.cloudfront.net",
];

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Could not read config file {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Could not parse config file")]
    Parse(#[from] serde_json::Error),
}

/// Container formats the merged file can be labelled as. Segments are MPEG-TS
/// and are never remuxed, so anything but `Ts` only changes the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Ts,
    Mpeg,
    Mov,
    Avi,
    Mp4,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Ts => "ts",
            Self::Mpeg => "mpeg",
            Self::Mov => "mov",
            Self::Avi => "avi",
            Self::Mp4 => "mp4",
        }
    }

    /// Gives `path` this format's extension, replacing any existing one.
    pub fn apply(&self, path: &Path) -> PathBuf {
        path.with_extension(self.extension())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of chunks transferred at once.
    pub concurrency: usize,
    /// Attempts per chunk, the first one included.
    pub max_attempts: usize,
    /// Zero retries immediately, anything else backs off exponentially with
    /// jitter starting from this delay.
    pub retry_base_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub user_agent: String,
    pub mirror_list_url: Option<String>,
    pub fallback_mirrors: Vec<String>,
    /// Mirrors probed concurrently for one candidate path.
    pub probe_concurrency: usize,
    pub scratch_dir: Option<PathBuf>,
    pub output_format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_attempts: 5,
            retry_base_delay_ms: 0,
            connect_timeout_secs: 60,
            read_timeout_secs: 60,
            user_agent: concat!("vod-recover/", env!("CARGO_PKG_VERSION")).to_string(),
            mirror_list_url: Some(DEFAULT_MIRROR_LIST_URL.to_string()),
            fallback_mirrors: FALLBACK_MIRRORS.iter().map(|m| m.to_string()).collect(),
            probe_concurrency: 4,
            scratch_dir: None,
            output_format: OutputFormat::Ts,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_json(&text)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"concurrency": 3, "output_format": "mp4"}"#).unwrap();
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.output_format, OutputFormat::Mp4);
        assert_eq!(config.fallback_mirrors.len(), FALLBACK_MIRRORS.len());
    }

    #[test]
    fn malformed_json() {
        assert!(matches!(
            Config::from_json("{concurrency: 3"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn output_format_replaces_extension() {
        assert_eq!(
            OutputFormat::Mp4.apply(Path::new("/tmp/vod.ts")),
            PathBuf::from("/tmp/vod.mp4")
        );
        assert_eq!(
            OutputFormat::Ts.apply(Path::new("vod")),
            PathBuf::from("vod.ts")
        );
    }

    #[test]
    fn retry_policy_never_zero() {
        let config = Config {
            max_attempts: 0,
            ..Config::default()
        };
        assert_eq!(config.retry_policy().max_attempts, 1);
    }
}
