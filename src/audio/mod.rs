//! Audio output module for avsync
//!
//! Decoded audio units flow from the audio stream reader into a
//! duration-bounded queue drained by a dedicated output thread, which writes
//! them to an [`AudioSink`] and reports each played timestamp. A copy of
//! every unit can be handed to the spectrum processor on its own thread.

mod cpal_output;
mod null_sink;
mod output;
mod queue;
mod spectrum;

pub use cpal_output::{CpalSink, CpalSinkFactory};
pub use null_sink::{NullSink, NullSinkFactory};
pub use output::{AudioOutput, AudioOutputBuilder};
pub use queue::{BoundedAudioQueue, Popped, QueueStats};
pub use spectrum::{find_indices, SpectrumFrame, SpectrumListener, SpectrumProcessor};

use crate::decoder::{AudioEncoding, AudioFormat, Sleeper};
use crate::utils::config::{AudioConfig, OutputKind};
use crate::utils::error::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Destination of played PCM
///
/// A sink lives on the output thread for its whole life, so it need not be
/// `Send`. Writes may block for pacing but must return promptly once
/// `cancel` is set.
pub trait AudioSink {
    /// Play interleaved PCM in the stream's format
    fn write(&mut self, pcm: &[u8], cancel: &CancelToken) -> Result<()>;

    /// Suspend playback without dropping buffered audio
    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Drop audio written but not yet heard
    fn flush(&mut self);

    /// Set the output gain (0.0 to 1.0)
    fn set_volume(&mut self, volume: f32);
}

/// Creates the sink on the output thread
pub trait SinkFactory: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, format: &AudioFormat) -> Result<Box<dyn AudioSink>>;
}

/// Notified after every played unit with its timestamp in milliseconds
pub trait TimestampListener: Send + Sync {
    fn notify_time(&self, time_ms: i64);
}

impl<F> TimestampListener for F
where
    F: Fn(i64) + Send + Sync,
{
    fn notify_time(&self, time_ms: i64) {
        self(time_ms)
    }
}

/// Sink factory selected by the audio configuration
pub fn sink_factory_for(config: &AudioConfig) -> Arc<dyn SinkFactory> {
    match config.output {
        OutputKind::Device => Arc::new(CpalSinkFactory::new()),
        OutputKind::Null => Arc::new(NullSinkFactory::new(config.null_time_scale as f64)),
    }
}

/// Decode interleaved PCM into normalised `f32` samples, appending to `out`
pub(crate) fn pcm_to_f32(format: &AudioFormat, pcm: &[u8], out: &mut Vec<f32>) {
    match (format.encoding, format.bits_per_sample) {
        (AudioEncoding::PcmSigned, 16) => out.extend(
            pcm.chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0),
        ),
        (AudioEncoding::PcmUnsigned, 8) => {
            out.extend(pcm.iter().map(|&b| (b as f32 - 128.0) / 128.0))
        }
        (AudioEncoding::PcmFloat, 32) => out.extend(
            pcm.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        ),
        (AudioEncoding::PcmSigned, 8) => out.extend(pcm.iter().map(|&b| b as i8 as f32 / 128.0)),
        (AudioEncoding::PcmUnsigned, 16) => out.extend(
            pcm.chunks_exact(2)
                .map(|b| (u16::from_le_bytes([b[0], b[1]]) as f32 - 32768.0) / 32768.0),
        ),
        _ => {}
    }
}

/// Playback time of `bytes` of PCM in `format`
pub(crate) fn pcm_duration_us(format: &AudioFormat, bytes: usize) -> i64 {
    format.frames_to_micros(format.frames_in(bytes) as u64)
}

/// Cancel flag that also ends sleeps taken against it
///
/// Sink writes and the slow-motion unit delay sleep on the token; a
/// [`cancel`](CancelToken::cancel) wakes them at once instead of waiting for
/// the next poll.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    sleeper: Sleeper,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every sleeper
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.sleeper.wake();
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleep until `deadline`; false when cancelled first
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            let token = self.sleeper.token();
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            // A wake without a cancel (reset raced it) just re-checks
            self.sleeper.sleep(token, Some(deadline - now));
        }
    }

    pub fn sleep_for(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::AudioRequest;

    #[test]
    fn test_pcm_signed_conversion() {
        let format = AudioRequest::MONO_SIGNED.with_rate(22050);
        let mut pcm = Vec::new();
        pcm.extend_from_slice(&i16::MIN.to_le_bytes());
        pcm.extend_from_slice(&0i16.to_le_bytes());
        pcm.extend_from_slice(&16384i16.to_le_bytes());

        let mut out = Vec::new();
        pcm_to_f32(&format, &pcm, &mut out);
        assert_eq!(out, vec![-1.0, 0.0, 0.5]);
    }

    #[test]
    fn test_pcm_unsigned_conversion() {
        let format = AudioRequest::STEREO_UNSIGNED.with_rate(44100);
        let mut out = Vec::new();
        pcm_to_f32(&format, &[0, 128, 192, 128], &mut out);
        assert_eq!(out, vec![-1.0, 0.0, 0.5, 0.0]);
    }

    #[test]
    fn test_pcm_duration() {
        let format = AudioRequest::MONO_SIGNED.with_rate(22050);
        assert_eq!(pcm_duration_us(&format, 44100), 1_000_000);
    }

    #[test]
    fn test_closure_timestamp_listener() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<i64>::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn TimestampListener> = Arc::new(move |ms: i64| sink.lock().push(ms));
        listener.notify_time(42);
        assert_eq!(*seen.lock(), vec![42]);
    }

    #[test]
    fn test_cancelled_token_returns_at_once() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let started = Instant::now();
        assert!(!cancel.sleep_until(started + Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_cancel_wakes_sleeping_thread() {
        let cancel = Arc::new(CancelToken::new());
        let sleeper = Arc::clone(&cancel);
        let started = Instant::now();
        let handle = std::thread::spawn(move || sleeper.sleep_for(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        assert!(!handle.join().unwrap());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_reset_token_sleeps_to_deadline() {
        let cancel = CancelToken::new();
        cancel.cancel();
        cancel.reset();
        let started = Instant::now();
        assert!(cancel.sleep_for(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
