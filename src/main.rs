use std::{error::Error, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use vod_recover::{
    config::Config,
    feeds, hls,
    reconstruct::{self, VerifiedUrl, VodIdentity},
    stats::DownloadStatistics,
    util,
    vod::{self, VodRecovery},
    worker::{ChunkRange, DownloadOutcome, ProgressEvent},
};

#[derive(Parser, Debug)]
#[command(name = "vod-recover", version, about = "Recover and download livestream VODs")]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Chunks downloaded at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find the playlist URL of a VOD
    Recover {
        channel: String,
        stream_id: u64,
        /// Start time, YYYY-MM-DD HH:mm:ss (UTC)
        timestamp: String,
        /// Only try the given second instead of the whole minute
        #[arg(long)]
        exact: bool,
        /// Also write the results to this file
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// List the qualities available under a recovered URL
    Feeds {
        url: String,
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Parse a master playlist file
    Parse { file: PathBuf },
    /// Download a media playlist into one file
    Download {
        url: String,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        min: Option<u32>,
        #[arg(long)]
        max: Option<u32>,
        /// Merge what was downloaded if interrupted
        #[arg(long)]
        keep_partial: bool,
    },
    /// Rewrite a playlist so muted segments resolve
    Unmute {
        /// Playlist URL or local file
        input: String,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Recover a VOD and download it
    Vod {
        channel: String,
        stream_id: u64,
        timestamp: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Video token such as 720p60; the source feed by default
        #[arg(short, long)]
        quality: Option<String>,
        #[arg(long)]
        min: Option<u32>,
        #[arg(long)]
        max: Option<u32>,
        #[arg(long)]
        keep_partial: bool,
    },
}

fn progress() -> (mpsc::UnboundedSender<ProgressEvent>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        let mut stats = DownloadStatistics::new();
        while let Some(event) = events.next().await {
            stats.apply(&event);
            if !matches!(event, ProgressEvent::State(_)) {
                stats.print();
            }
        }
        println!();
    });
    (tx, handle)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nCancelling...");
            token.cancel();
        }
    });
    cancel
}

async fn finish(
    outcome: DownloadOutcome,
    output: PathBuf,
    keep_partial: bool,
) -> Result<(), Box<dyn Error>> {
    match outcome {
        DownloadOutcome::Complete(report) => {
            if !report.gaps.is_empty() {
                println!("Missing chunks: {:?}", report.gaps);
            }
            println!("Saved to {}", report.output.display());
        }
        DownloadOutcome::Cancelled(chunks) if keep_partial => {
            match chunks.merge(&output, &CancellationToken::new()).await? {
                Some(report) => println!(
                    "Saved {} chunks to {}",
                    report.chunks_written,
                    report.output.display()
                ),
                None => println!("Nothing was downloaded"),
            }
        }
        DownloadOutcome::Cancelled(chunks) => {
            println!("Cancelled, {} chunks discarded", chunks.succeeded());
        }
        DownloadOutcome::MergeFailed { error, .. } => return Err(error.into()),
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path).await?,
        None => Config::default(),
    };
    if let Some(n) = cli.concurrency {
        config.concurrency = n;
    }

    let client = Arc::new(util::HttpClient::new(&config)?);
    let recovery = VodRecovery::new(client.clone(), config);

    match cli.command {
        Command::Recover {
            channel,
            stream_id,
            timestamp,
            exact,
            export,
        } => {
            let identity =
                VodIdentity::new(channel, stream_id, reconstruct::parse_timestamp(&timestamp)?);
            let urls = recovery.recover(&identity, exact).await;
            if urls.is_empty() {
                println!("No VOD found");
            }
            for url in &urls {
                println!("{}", url.url);
            }
            if let Some(path) = export {
                tokio::fs::write(path, reconstruct::export_results(&urls)).await?;
            }
        }
        Command::Feeds { url, export } => {
            let verified = VerifiedUrl::parse(&url).ok_or("Not a VOD playlist URL")?;
            let feeds = recovery.feeds(&verified).await;
            for entry in &feeds {
                println!("{:<12} {}", entry.label(), entry.url);
            }
            if let Some(path) = export {
                tokio::fs::write(path, feeds.export()).await?;
            }
        }
        Command::Parse { file } => {
            let content = tokio::fs::read_to_string(file).await?;
            let feeds = feeds::parse_feeds(&content);
            println!("{}", serde_json::to_string_pretty(&feeds)?);
        }
        Command::Download {
            url,
            output,
            min,
            max,
            keep_partial,
        } => {
            let cancel = cancel_on_ctrl_c();
            let (tx, printer) = progress();
            let output = recovery.output_path(&output);
            let outcome = recovery
                .download_feed(&url, &output, ChunkRange::new(min, max), &cancel, Some(tx))
                .await;
            let _ = printer.await;
            finish(outcome?, output, keep_partial).await?;
        }
        Command::Unmute { input, output } => {
            let (content, base) = if input.starts_with("http://") || input.starts_with("https://") {
                (client.fetch_text(&input).await?, hls::base_url(&input).to_string())
            } else {
                (tokio::fs::read_to_string(&input).await?, String::new())
            };
            if !hls::has_muted(&content) {
                println!("Playlist has no muted segments");
            }
            tokio::fs::write(&output, hls::unmute(&content, &base)).await?;
            println!("Saved to {}", output.display());
        }
        Command::Vod {
            channel,
            stream_id,
            timestamp,
            output,
            quality,
            min,
            max,
            keep_partial,
        } => {
            let identity =
                VodIdentity::new(channel, stream_id, reconstruct::parse_timestamp(&timestamp)?);
            let output = recovery
                .output_path(&output.unwrap_or_else(|| vod::default_file_name(stream_id).into()));
            let cancel = cancel_on_ctrl_c();
            let (tx, printer) = progress();
            let outcome = recovery
                .download_vod(
                    &identity,
                    quality.as_deref(),
                    &output,
                    ChunkRange::new(min, max),
                    &cancel,
                    Some(tx),
                )
                .await;
            let _ = printer.await;
            match outcome? {
                Some(outcome) => finish(outcome, output, keep_partial).await?,
                None => println!("No VOD found"),
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        let mut source = e.source();
        while let Some(cause) = source {
            eprintln!("  caused by: {}", cause);
            source = cause.source();
        }
        std::process::exit(1);
    }
}
