//! RaceReplay Watch
//!
//! Plays a replay window in the terminal: one line per tick, or one JSON
//! snapshot per tick with `--json`.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use rr_adapters::{DemoConfig, DemoStore};
use rr_core::{
    generator::{FrameGenerator, GeneratorConfig},
    model::{ChannelSelection, EntityFilter, Timestamp},
};
use rr_playback::{
    FrameSource, HttpFrameSource, LocalFrameSource, PlaybackConfig, PlaybackSession,
    PlaybackSnapshot,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "rr-watch", version, about = "Play back a replay window from a frame server")]
struct Args {
    /// Frame server base URL
    #[arg(long, env = "RR_SERVER", default_value = "http://127.0.0.1:9100")]
    server: String,

    /// Session key on the server
    #[arg(long, default_value = "demo")]
    session: String,

    /// Read frames from the built-in demo field instead of a server
    #[arg(long, value_enum, default_value_t = Origin::Server)]
    source: Origin,

    /// Window start (RFC 3339); defaults to the demo session start
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Window end (RFC 3339); defaults to one minute after `from`
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    #[arg(long, default_value_t = 1.0)]
    speed: f64,

    /// Comma-separated entity ids to show
    #[arg(long)]
    drivers: Option<String>,

    /// Extra channels, e.g. "speed,gear"
    #[arg(long)]
    include: Option<String>,

    /// Playback tuning as TOML
    #[arg(short, long, env = "RR_PLAYBACK_CONFIG")]
    config: Option<PathBuf>,

    /// Print each snapshot as a JSON line
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Origin {
    Server,
    Demo,
}

fn load_config(args: &Args) -> Result<PlaybackConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        }
        None => PlaybackConfig::default(),
    };
    config.speed = args.speed;
    config.filter = match args.drivers.as_deref() {
        Some(drivers) => EntityFilter::parse(drivers)?,
        None => None,
    };
    config.channels = args
        .include
        .as_deref()
        .map(ChannelSelection::parse)
        .unwrap_or_default();
    Ok(config)
}

fn print_snapshot(snapshot: &PlaybackSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }
    let playhead = snapshot
        .playhead
        .map(|t: Timestamp| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "--:--:--.---".to_string());
    let leader = snapshot
        .positions
        .iter()
        .next()
        .map(|(id, c)| format!("#{} ({:.0}, {:.0})", id, c.x, c.y))
        .unwrap_or_default();
    println!(
        "{} x{:<4} buffered={:<3} cars={:<2}{} {}",
        playhead,
        snapshot.speed,
        snapshot.buffered,
        snapshot.positions.len(),
        if snapshot.stalled { " stalled" } else { "" },
        leader
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let demo = DemoConfig::default();
    let from = args.from.unwrap_or(demo.session_start);
    let to = args.to.unwrap_or(from + chrono::Duration::minutes(1));
    if to < from {
        bail!("--to must not be before --from");
    }

    let source: Arc<dyn FrameSource> = match args.source {
        Origin::Server => Arc::new(HttpFrameSource::new(&args.server, &args.session)?),
        Origin::Demo => Arc::new(LocalFrameSource::new(FrameGenerator::new(
            Arc::new(DemoStore::new(demo)),
            GeneratorConfig::default(),
        ))),
    };
    info!(
        "Watching {} from {} to {} via {}",
        args.session,
        from,
        to,
        source.name()
    );

    let handle = PlaybackSession::spawn(source, config);
    let mut updates = handle.subscribe();
    handle.load(from, to).await?;
    handle.play().await?;

    let mut last_tick = 0;
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    warn!("Playback stopped unexpectedly");
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                if snapshot.ticks != last_tick {
                    last_tick = snapshot.ticks;
                    print_snapshot(&snapshot, args.json)?;
                }
                if snapshot.finished {
                    info!("Reached end of window after {} frames", snapshot.ticks);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
