use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How often the exit path checks for played-out audio
const DRAIN_POLL: Duration = Duration::from_millis(20);

use avsync::audio::SpectrumFrame;
use avsync::decoder::{DecoderBackend, SyntheticBackend};
use avsync::player::{EngineEvent, PlaybackEngine, RenderSink, ViewerSettings};
use avsync::utils::config::{Config, OutputKind};
use avsync::utils::format_duration;

/// avsync - play a media stream with audio-driven synchronization
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media file to play
    #[arg(value_name = "FILE")]
    file: Option<PathBuf>,

    /// Play a generated test stream instead of a file
    #[arg(long)]
    synthetic: bool,

    /// Decoder backend (auto, wav, synthetic, ffmpeg)
    #[arg(long, value_name = "NAME")]
    backend: Option<String>,

    /// Initial playback speed; negative plays backwards
    #[arg(short, long, default_value = "1.0", allow_hyphen_values = true)]
    speed: f32,

    /// Start position in milliseconds
    #[arg(long, value_name = "MS")]
    seek: Option<i64>,

    /// Log spectrum peaks while playing
    #[arg(long)]
    spectrum: bool,

    /// Discard audio instead of using the output device
    #[arg(long)]
    null_audio: bool,

    /// Audio chunk size in bytes
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<usize>,

    /// Set volume (0-100)
    #[arg(short, long, value_name = "VOLUME")]
    volume: Option<u8>,

    /// Configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(backend) = &args.backend {
        config.decoder.backend = backend.clone();
    }
    if let Some(chunk_size) = args.chunk_size {
        config.audio.chunk_size = chunk_size;
    }
    if args.null_audio {
        config.audio.output = OutputKind::Null;
    }
    if args.spectrum {
        config.spectrum.enabled = true;
    }

    let log_level = if args.debug { "debug".to_string() } else { config.general.log_level.clone() };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("Starting avsync v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match ViewerSettings::default_path() {
        Some(path) => ViewerSettings::load(&path)?,
        None => ViewerSettings::default(),
    };
    if let Some(volume) = args.volume {
        settings.volume = volume.min(100);
    }

    let source = match (&args.file, args.synthetic) {
        (_, true) => PathBuf::from("synthetic"),
        (Some(path), false) if path.exists() => path.clone(),
        (Some(path), false) => {
            error!("File not found: {:?}", path);
            bail!("File not found: {}", path.display());
        }
        (None, false) => bail!("No media file given (use --synthetic for a test stream)"),
    };

    // Queued audio plays out after end of stream, bounded by the horizon
    let drain_limit = Duration::from_millis(config.audio.buffer_horizon_ms) + Duration::from_secs(1);
    let status = Arc::new(StatusSink::default());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let mut builder = PlaybackEngine::builder(source)
        .with_config(config)
        .with_settings(settings)
        .with_render_sink(status.clone())
        .with_event_handler(Arc::new(move |event: &EngineEvent| {
            log_event(event);
            let _ = events_tx.send(event.clone());
        }))
        .with_spectrum_listener(Arc::new(|frame: &SpectrumFrame| log_spectrum(frame)));
    if args.synthetic {
        let backend: Arc<dyn DecoderBackend> = Arc::new(SyntheticBackend::default());
        builder = builder.with_backend(backend);
    }

    let engine = builder.build()?;
    engine.start()?;
    if let Some(position) = args.seek {
        engine.seek(position)?;
    }
    if args.speed != 1.0 {
        engine.adjust_speed(args.speed)?;
    }
    engine.play()?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut reached_end = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            event = events_rx.recv() => match event {
                Some(EngineEvent::EndOfStream) => {
                    reached_end = true;
                    break;
                }
                Some(EngineEvent::StreamClosed) | None => break,
                Some(_) => {}
            },
            _ = ticker.tick() => {
                let position = Duration::from_millis(status.position_ms.load(Ordering::Relaxed).max(0) as u64);
                let total = engine.media_info().map(|info| info.duration()).unwrap_or_default();
                info!(
                    "{} / {} ({} frames, {} ms audio queued)",
                    format_duration(position),
                    format_duration(total),
                    status.frames.load(Ordering::Relaxed),
                    engine.queued_audio_span().as_millis()
                );
            }
        }
    }

    if reached_end {
        let drained = tokio::time::timeout(drain_limit, async {
            while !engine.audio_drained() {
                tokio::time::sleep(DRAIN_POLL).await;
            }
        });
        tokio::select! {
            result = drained => {
                if result.is_err() {
                    warn!("Queued audio still playing after {:?}, closing anyway", drain_limit);
                }
            }
            _ = &mut ctrl_c => info!("Interrupted"),
        }
    }

    engine.close();
    info!("avsync shut down");
    Ok(())
}

/// Tracks what the console status line shows
#[derive(Default)]
struct StatusSink {
    frames: AtomicU64,
    position_ms: AtomicI64,
}

impl RenderSink for StatusSink {
    fn on_frame_ready(&self, _pixels: &[u8], _width: u32, _height: u32, _channels: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    fn on_position_changed(&self, time_ms: i64) {
        self.position_ms.store(time_ms, Ordering::Relaxed);
    }
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::MediaOpened { info, display_size } => info!(
            "Media opened: {} ({}x{}, shown at {}x{})",
            info.source, info.width, info.height, display_size.0, display_size.1
        ),
        EngineEvent::StateChanged(state) => debug!("State: {:?}", state),
        EngineEvent::SpeedChanged(speed) => info!("Playback speed: {:.2}x", speed),
        EngineEvent::Seeked(time_ms) => info!("Seeked to {} ms", time_ms),
        EngineEvent::EndOfStream => info!("End of stream reached"),
        EngineEvent::StreamClosed => info!("Stream closed"),
        EngineEvent::Error(message) => error!("Engine error: {}", message),
    }
}

fn log_spectrum(frame: &SpectrumFrame) {
    let peak = frame
        .levels_db
        .iter()
        .zip(&frame.frequencies)
        .max_by(|a, b| a.0.total_cmp(b.0));
    if let Some((level, frequency)) = peak {
        debug!("Spectrum @{} ms: peak {:.0} Hz at {:.1} dB", frame.timestamp_ms, frequency, level);
    }
}
