use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use livetv_core::{logging, Config};
use livetv_player::{
    build_client, default_adapters, Capabilities, EventReceiver, FileSink, MediaSink, MemorySink,
    PlayerEvent, SessionConfig, SessionHandle, StreamSource,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "livetv")]
#[command(about = "Play a live-TV channel, falling back across stream transports", long_about = None)]
struct Args {
    /// Channel stream endpoint (raw MPEG-TS or HLS, detected automatically)
    url: String,

    /// Channel identifier used in logs and snapshots
    #[arg(long, default_value = "live")]
    channel: String,

    /// Configuration file (YAML or TOML)
    #[arg(long, env = "LIVETV_CONFIG")]
    config: Option<String>,

    /// Record the demuxed stream to this file instead of discarding it
    #[arg(long)]
    record: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Allow the platform's native HLS player
    #[arg(long)]
    native_hls: bool,

    /// Disable in-process demuxing
    #[arg(long)]
    no_media_source: bool,
}

const HELP: &str =
    "commands: p play/pause, m mute, f/F fullscreen on/off, +N/-N seek, r retry, s status, q quit";

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, flags win over file and environment
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if args.native_hls {
        config.sink.native_hls = true;
    }
    if args.no_media_source {
        config.sink.media_source = false;
    }

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    // 3. Build the session
    let source = StreamSource::new(args.channel, &args.url)?;
    let capabilities = Capabilities::from(&config.sink);
    let recorder = match &args.record {
        Some(path) => {
            info!(path = %path.display(), "Recording stream");
            let sink = FileSink::create(path, capabilities)
                .await
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Some(Arc::new(sink))
        }
        None => None,
    };
    let sink: Arc<dyn MediaSink> = match &recorder {
        Some(recorder) => recorder.clone(),
        None => Arc::new(MemorySink::new(capabilities)),
    };
    let client = build_client(&config.http)?;
    let adapters = default_adapters(&config, client);

    info!(channel_id = %source.channel_id(), url = %source.url(), "Opening channel");
    let (handle, events) =
        SessionHandle::open(source, sink, adapters, SessionConfig::from(&config.player));
    tokio::spawn(print_events(events, args.json));

    if !args.json {
        eprintln!("{HELP}");
    }

    // 4. Drive the session from stdin until quit, EOF or Ctrl-C
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line.context("Failed to read stdin")? {
                Some(line) => {
                    if !run_command(&handle, line.trim(), args.json).await {
                        break;
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    handle.teardown().await;
    if let Some(recorder) = &recorder {
        recorder.flush().await;
        info!(path = %recorder.path().display(), bytes = recorder.bytes_written(), "Recording saved");
    }
    info!("Channel closed");
    Ok(())
}

/// Returns false when the user asked to quit.
async fn run_command(handle: &SessionHandle, input: &str, json: bool) -> bool {
    handle.user_activity();

    match input {
        "" => {}
        "q" => return false,
        "p" => handle.toggle_play_pause(),
        "m" => handle.toggle_mute(),
        "f" => handle.request_fullscreen(),
        "F" => handle.exit_fullscreen(),
        "r" => handle.retry(),
        "s" => {
            if let Some(snapshot) = handle.snapshot().await {
                let rendered = if json {
                    serde_json::to_string(&snapshot)
                } else {
                    serde_json::to_string_pretty(&snapshot)
                };
                match rendered {
                    Ok(text) => println!("{text}"),
                    Err(e) => warn!("Failed to render snapshot: {e}"),
                }
            }
        }
        seek if seek.starts_with(['+', '-']) => match seek.parse::<f64>() {
            Ok(delta) if delta.is_finite() => match handle.seek_relative(delta).await {
                Some(position) => println!("position {position:.1}s"),
                None => println!("not playing"),
            },
            _ => warn!("Invalid seek offset: {seek}"),
        },
        other => {
            warn!("Unknown command: {other}");
            eprintln!("{HELP}");
        }
    }
    true
}

async fn print_events(mut events: EventReceiver, json: bool) {
    loop {
        match events.recv().await {
            Ok(event) => print_event(&event, json),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event output fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn print_event(event: &PlayerEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("Failed to serialize event: {e}"),
        }
        return;
    }

    match event {
        PlayerEvent::Error { .. } => println!("{event} (type r to retry)"),
        _ => println!("{event}"),
    }
}
