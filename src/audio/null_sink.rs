//! Sink that discards audio, optionally paced against the wall clock
//!
//! Used headless and in tests. With a `time_scale` of 10 a second of audio
//! takes 100 ms to play; a scale of 0 disables pacing entirely.

use crate::audio::{pcm_duration_us, AudioSink, CancelToken, SinkFactory};
use crate::decoder::AudioFormat;
use crate::utils::error::{Result, StreamError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct NullSink {
    format: AudioFormat,
    time_scale: f64,
    paused: bool,
    /// When the audio written so far finishes playing
    deadline: Option<Instant>,
    bytes_written: Arc<AtomicU64>,
}

impl NullSink {
    pub fn new(format: AudioFormat, time_scale: f64) -> Self {
        Self {
            format,
            time_scale,
            paused: false,
            deadline: None,
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    fn with_counter(format: AudioFormat, time_scale: f64, bytes_written: Arc<AtomicU64>) -> Self {
        Self {
            bytes_written,
            ..Self::new(format, time_scale)
        }
    }
}

impl AudioSink for NullSink {
    fn write(&mut self, pcm: &[u8], cancel: &CancelToken) -> Result<()> {
        if self.time_scale > 0.0 && !self.paused {
            let scaled = pcm_duration_us(&self.format, pcm.len()) as f64 / self.time_scale;
            let now = Instant::now();
            // After an underrun pacing restarts from now
            let start = self.deadline.filter(|d| *d > now).unwrap_or(now);
            let deadline = start + Duration::from_micros(scaled.max(0.0) as u64);
            self.deadline = Some(deadline);

            if !cancel.sleep_until(deadline) {
                self.deadline = None;
                return Err(StreamError::Interrupted("Audio write cancelled".to_string()));
            }
        }
        self.bytes_written.fetch_add(pcm.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.paused = true;
        self.deadline = None;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.paused = false;
        Ok(())
    }

    fn flush(&mut self) {
        self.deadline = None;
    }

    fn set_volume(&mut self, _volume: f32) {}
}

/// Creates [`NullSink`]s sharing one byte counter
#[derive(Clone)]
pub struct NullSinkFactory {
    time_scale: f64,
    bytes_written: Arc<AtomicU64>,
}

impl NullSinkFactory {
    pub fn new(time_scale: f64) -> Self {
        Self {
            time_scale,
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes accepted by every sink this factory created
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl SinkFactory for NullSinkFactory {
    fn name(&self) -> &str {
        "null"
    }

    fn create(&self, format: &AudioFormat) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(NullSink::with_counter(
            *format,
            self.time_scale,
            Arc::clone(&self.bytes_written),
        )))
    }
}
