//! Integration test utilities for avsync
//!
//! Generated WAV media, an engine configuration that plays into a paced
//! null sink, and collectors for engine events and reported positions.

use anyhow::{anyhow, Result};
use avsync::player::{EngineEvent, EngineEventHandler, RenderSink};
use avsync::utils::config::{Config, OutputKind, SMALL_CHUNK_SIZE};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Sample rate of the generated media
pub const SAMPLE_RATE: u32 = 22050;

/// Chunk size used by the engine in these tests (4096 mono frames, ~186 ms)
pub const CHUNK_SIZE: usize = SMALL_CHUNK_SIZE;

/// Test fixture for integration tests
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub media_files: MediaFiles,
}

/// Collection of test media files
pub struct MediaFiles {
    /// 10 s mono 16-bit 440 Hz tone
    pub tone_10s: PathBuf,
    /// 0.5 s mono 16-bit tone
    pub tone_short: PathBuf,
}

impl TestFixture {
    /// Create a new test fixture with generated media files
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let media_files = MediaFiles {
            tone_10s: write_tone_wav(&temp_dir.path().join("tone_10s.wav"), 10.0, 440.0)?,
            tone_short: write_tone_wav(&temp_dir.path().join("tone_short.wav"), 0.5, 440.0)?,
        };
        Ok(Self { temp_dir, media_files })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }
}

/// Write a mono 16-bit sine tone
pub fn write_tone_wav(path: &Path, seconds: f64, tone_hz: f64) -> Result<PathBuf> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    let frames = (seconds * SAMPLE_RATE as f64) as u64;
    for n in 0..frames {
        let t = n as f64 / SAMPLE_RATE as f64;
        writer.write_sample(((2.0 * PI * tone_hz * t).sin() * 8000.0) as i16)?;
    }
    writer.finalize()?;
    Ok(path.to_path_buf())
}

/// Engine configuration playing into a real-time null sink
pub fn null_audio_config() -> Config {
    let mut config = Config::default();
    config.decoder.backend = "wav".to_string();
    config.audio.output = OutputKind::Null;
    config.audio.null_time_scale = 1.0;
    config.audio.chunk_size = CHUNK_SIZE;
    config
}

/// Collects engine events for async assertions
pub struct EventLog {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventLog {
    pub fn new() -> (Arc<dyn EngineEventHandler>, EventLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn EngineEventHandler> = Arc::new(move |event: &EngineEvent| {
            let _ = tx.send(event.clone());
        });
        (handler, EventLog { rx })
    }

    /// Wait for the first event matching `pred`, skipping the others
    pub async fn wait_for(
        &mut self,
        timeout: Duration,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> Result<EngineEvent> {
        tokio::time::timeout(timeout, async {
            while let Some(event) = self.rx.recv().await {
                if pred(&event) {
                    return Ok(event);
                }
            }
            Err(anyhow!("Engine event channel closed"))
        })
        .await
        .map_err(|_| anyhow!("Timed out waiting for engine event"))?
    }

    /// Events received so far without waiting
    pub fn drain(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Records reported positions and counts frames
#[derive(Default)]
pub struct PositionRecorder {
    positions: Mutex<Vec<i64>>,
    frames: Mutex<usize>,
}

impl PositionRecorder {
    pub fn positions(&self) -> Vec<i64> {
        self.positions.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<i64> {
        self.positions.lock().unwrap().last().copied()
    }

    pub fn frames(&self) -> usize {
        *self.frames.lock().unwrap()
    }

    pub fn clear(&self) {
        self.positions.lock().unwrap().clear();
    }

    /// Poll until a reported position satisfies `pred`
    pub async fn wait_for(&self, timeout: Duration, pred: impl Fn(i64) -> bool) -> Result<i64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(found) = self.positions().into_iter().find(|ms| pred(*ms)) {
                return Ok(found);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "No matching position; last reported {:?}",
                    self.last()
                ));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl RenderSink for PositionRecorder {
    fn on_frame_ready(&self, _pixels: &[u8], _width: u32, _height: u32, _channels: usize) {
        *self.frames.lock().unwrap() += 1;
    }

    fn on_position_changed(&self, time_ms: i64) {
        self.positions.lock().unwrap().push(time_ms);
    }
}
