//! # vod-recover
//!
//! This crate recovers recorded livestream broadcasts (VODs), including ones
//! that are no longer listed, and downloads their segmented video into a
//! single file.
//!
//! ## Usage
//!
//! A delisted VOD is found from its channel, stream id and start time. The
//! start time only needs to be right to the minute: every second of that
//! minute is tried against every known mirror.
//!
//! ```rust,no_run
//! use std::{path::Path, sync::Arc};
//!
//! use tokio_util::sync::CancellationToken;
//! use vod_recover::{config::Config, reconstruct, util, vod::VodRecovery, worker};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let client = Arc::new(util::HttpClient::new(&config).unwrap());
//!     let vod = VodRecovery::new(client, config);
//!
//!     let started = reconstruct::parse_timestamp("2021-03-01 10:00:00").unwrap();
//!     let identity = reconstruct::VodIdentity::new("foo", 123456789, started);
//!
//!     let outcome = vod
//!         .download_vod(
//!             &identity,
//!             None,
//!             Path::new("vod.ts"),
//!             worker::ChunkRange::all(),
//!             &CancellationToken::new(),
//!             None,
//!         )
//!         .await
//!         .unwrap();
//!
//!     match outcome {
//!         Some(worker::DownloadOutcome::Complete(report)) => {
//!             println!("Saved to {}", report.output.display())
//!         }
//!         Some(worker::DownloadOutcome::Cancelled(_)) => println!("Cancelled"),
//!         Some(worker::DownloadOutcome::MergeFailed { error, .. }) => {
//!             println!("Merge failed: {}", error)
//!         }
//!         None => println!("VOD not found"),
//!     }
//! }
//! ```
//!
//! The pieces can also be used on their own: [`reconstruct`] finds URLs,
//! [`feeds`] parses master playlists, and [`worker`] downloads and merges
//! the chunks of one media playlist.

#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

pub mod config;
pub mod feeds;
pub mod hls;
pub mod quality;
pub mod reconstruct;
pub mod stats;
pub mod util;
pub mod vod;
pub mod worker;

/// Leading comment lines of exported URL and feed lists.
pub const EXPORT_HEADER: &str =
    "# Generated by vod-recover\n# Each URL is preceded by comments describing it";
