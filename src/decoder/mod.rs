//! Decoder module for avsync
//!
//! This module defines the decode boundary the playback core consumes: an
//! open session ([`MediaDecoder`]) that delivers video frames and audio
//! chunks into caller-supplied buffers and accepts transport requests, and
//! the injected [`DecoderBackend`] that opens sessions.
//!
//! Reads are issued by the stream reader threads while the engine thread
//! issues transport calls, so every implementation serialises access to its
//! own state internally.

mod pacing;
mod stream_info;
mod synthetic;
mod unit;
mod wav;

#[cfg(feature = "ffmpeg")]
mod ffmpeg;

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegBackend;
pub use pacing::{FramePacer, FramePresentation, PlaybackClock, Sleeper, Wakeup};
pub use stream_info::{
    validate_request, AudioEncoding, AudioFormat, AudioRequest, ColorSpace, MediaInfo, View,
};
pub use synthetic::{SyntheticBackend, SyntheticConfig, SyntheticDecoder};
pub use unit::{BufferPool, DecodedUnit, Track};
pub use wav::{WavBackend, WavDecoder};

use crate::utils::error::{Result, StreamError};
use std::path::Path;
use std::sync::Arc;

/// Slowest (reverse) playback speed
pub const MIN_SPEED: f32 = -4.0;

/// Fastest playback speed
pub const MAX_SPEED: f32 = 4.0;

/// Outcome of a single blocking read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The buffer holds `len` bytes stamped `timestamp_us`; `units` decoder
    /// units were consumed (more than one when frames were skipped to keep up)
    Data {
        units: usize,
        timestamp_us: i64,
        len: usize,
    },

    /// End of stream (forward) or start of stream (reverse)
    Boundary,

    /// A wake arrived before data became available
    Woken,
}

impl ReadStatus {
    /// Number of units delivered, 0 when nothing was read
    pub fn units(&self) -> usize {
        match self {
            ReadStatus::Data { units, .. } => *units,
            _ => 0,
        }
    }
}

/// An open decode session
pub trait MediaDecoder: Send + Sync {
    /// Stream metadata
    fn info(&self) -> &MediaInfo;

    /// Whether a video frame can be read now
    fn available_video(&self) -> bool;

    /// Whether an audio chunk can be read now
    fn available_audio(&self) -> bool;

    /// Read the next video frame into `buf`, blocking until it is due
    ///
    /// Only the current view is written; `buf` must hold a full frame.
    fn read_video_frame(&self, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Read the next audio chunk into `buf`
    fn read_audio_chunk(&self, buf: &mut [u8]) -> Result<ReadStatus>;

    /// Start the transport clock
    fn start(&self) -> Result<()>;

    /// Stop the transport clock
    fn stop(&self) -> Result<()>;

    /// Jump to `time_us`, which must lie inside the stream
    fn seek(&self, time_us: i64) -> Result<()>;

    /// Change playback speed; rejected speeds leave the previous one intact
    fn set_speed(&self, speed: f32) -> Result<()>;

    fn speed(&self) -> f32;

    /// Restrict delivered frames to a sub-rectangle
    fn set_view(&self, view: View) -> Result<()>;

    fn view(&self) -> View;

    /// Transport position in microseconds
    fn current_time_us(&self) -> i64;

    fn at_start(&self) -> bool;

    fn at_end(&self) -> bool;

    /// Enable or disable audio delivery
    fn set_play_sound(&self, enabled: bool);

    /// Rewind to the start time
    fn reset(&self) -> Result<()>;

    /// Unblock every read in progress
    fn wake(&self);

    /// Release the session; later calls are no-ops and reads fail with `Interrupted`
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens decode sessions
pub trait DecoderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open `path`, failing before any session exists if the request is unsupported
    fn open(
        &self,
        path: &Path,
        color_space: ColorSpace,
        audio: AudioRequest,
    ) -> Result<Arc<dyn MediaDecoder>>;
}

/// Reject a speed that is zero, not finite, or outside `[min, max]`
pub fn validate_speed(speed: f32, min: f32, max: f32) -> Result<()> {
    if !speed.is_finite() || speed.abs() < f32::EPSILON || speed < min || speed > max {
        return Err(StreamError::out_of_range(format!(
            "Speed {} outside [{}, {}] or zero",
            speed, min, max
        )));
    }
    Ok(())
}

/// Reject a seek target outside the stream
pub fn validate_seek(info: &MediaInfo, time_us: i64) -> Result<()> {
    if !info.contains(time_us) {
        return Err(StreamError::out_of_range(format!(
            "Seek to {} us outside [{}, {}]",
            time_us, info.start_time_us, info.end_time_us
        )));
    }
    Ok(())
}

/// Picks a backend from the file extension
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoBackend;

impl DecoderBackend for AutoBackend {
    fn name(&self) -> &'static str {
        "auto"
    }

    fn open(
        &self,
        path: &Path,
        color_space: ColorSpace,
        audio: AudioRequest,
    ) -> Result<Arc<dyn MediaDecoder>> {
        let is_wav = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("wav"))
            .unwrap_or(false);

        if is_wav {
            return WavBackend.open(path, color_space, audio);
        }

        #[cfg(feature = "ffmpeg")]
        {
            FfmpegBackend::default().open(path, color_space, audio)
        }

        #[cfg(not(feature = "ffmpeg"))]
        {
            validate_request(color_space, &audio)?;
            Err(StreamError::UnsupportedFormat(format!(
                "No backend for {}; build with the ffmpeg feature",
                path.display()
            )))
        }
    }
}

/// Create the backend named in the configuration
pub fn backend_from_name(name: &str) -> Result<Arc<dyn DecoderBackend>> {
    match name {
        "auto" => Ok(Arc::new(AutoBackend)),
        "wav" => Ok(Arc::new(WavBackend)),
        "synthetic" => Ok(Arc::new(SyntheticBackend::default())),
        #[cfg(feature = "ffmpeg")]
        "ffmpeg" => Ok(Arc::new(FfmpegBackend::default())),
        other => Err(StreamError::Config(format!("Decoder backend '{}' not available", other))),
    }
}
