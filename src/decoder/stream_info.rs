//! Stream metadata and open-request validation
//!
//! Every backend describes an open session with a [`MediaInfo`] and checks
//! the caller's requested colour space and audio layout through
//! [`validate_request`] before it allocates anything.

use crate::utils::error::{Result, StreamError};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Colour space of delivered video frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorSpace {
    /// Standard RGB, 8 bits per channel
    Srgb,

    /// Linear-light RGB
    LinearRgb,

    /// Single channel luminance
    Gray,

    /// Cyan/magenta/yellow/key
    Cmyk,
}

impl ColorSpace {
    /// Number of bytes per pixel in this colour space
    pub fn channels(&self) -> usize {
        match self {
            ColorSpace::Srgb | ColorSpace::LinearRgb => 3,
            ColorSpace::Gray => 1,
            ColorSpace::Cmyk => 4,
        }
    }
}

impl FromStr for ColorSpace {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "srgb" | "rgb" => Ok(ColorSpace::Srgb),
            "linear" | "linear_rgb" => Ok(ColorSpace::LinearRgb),
            "gray" | "grey" => Ok(ColorSpace::Gray),
            "cmyk" => Ok(ColorSpace::Cmyk),
            other => Err(StreamError::UnsupportedFormat(format!(
                "Unknown color space '{}'",
                other
            ))),
        }
    }
}

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioEncoding {
    /// Signed integer samples (16-bit little endian when delivered)
    PcmSigned,

    /// Unsigned integer samples (8-bit when delivered)
    PcmUnsigned,

    /// 32-bit float samples
    PcmFloat,
}

/// Requested output audio layout
///
/// Only the layout is chosen by the caller; sample rate, bit depth and frame
/// size are populated from the stream once it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRequest {
    /// Sample encoding
    pub encoding: AudioEncoding,

    /// Channel count
    pub channels: u16,
}

impl AudioRequest {
    /// Mono, signed 16-bit PCM
    pub const MONO_SIGNED: AudioRequest = AudioRequest {
        encoding: AudioEncoding::PcmSigned,
        channels: 1,
    };

    /// Stereo, unsigned 8-bit PCM
    pub const STEREO_UNSIGNED: AudioRequest = AudioRequest {
        encoding: AudioEncoding::PcmUnsigned,
        channels: 2,
    };

    /// Bits per delivered sample for this encoding
    pub fn bits_per_sample(&self) -> u16 {
        match self.encoding {
            AudioEncoding::PcmSigned => 16,
            AudioEncoding::PcmUnsigned => 8,
            AudioEncoding::PcmFloat => 32,
        }
    }

    /// Complete the request with the stream's sample rate
    pub fn with_rate(&self, sample_rate: u32) -> AudioFormat {
        let bits = self.bits_per_sample();
        AudioFormat {
            encoding: self.encoding,
            sample_rate,
            bits_per_sample: bits,
            channels: self.channels,
            frame_size: (bits as usize / 8) * self.channels as usize,
        }
    }
}

impl FromStr for AudioRequest {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mono_signed" => Ok(AudioRequest::MONO_SIGNED),
            "stereo_unsigned" => Ok(AudioRequest::STEREO_UNSIGNED),
            other => Err(StreamError::UnsupportedFormat(format!(
                "Unknown audio layout '{}'",
                other
            ))),
        }
    }
}

/// Complete description of delivered audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: AudioEncoding,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
    /// Bytes per frame (one sample for every channel)
    pub frame_size: usize,
}

impl AudioFormat {
    /// Whole frames contained in `bytes`
    pub fn frames_in(&self, bytes: usize) -> usize {
        bytes / self.frame_size.max(1)
    }

    /// Playback duration of `frames` frames in microseconds
    pub fn frames_to_micros(&self, frames: u64) -> i64 {
        (frames as i128 * 1_000_000 / self.sample_rate.max(1) as i128) as i64
    }

    /// Frame index at `time_us` (rounded down)
    pub fn micros_to_frames(&self, time_us: i64) -> u64 {
        (time_us.max(0) as i128 * self.sample_rate as i128 / 1_000_000) as u64
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} Hz, {}-bit, {} ch",
            self.encoding, self.sample_rate, self.bits_per_sample, self.channels
        )
    }
}

/// Visible sub-rectangle of the video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl View {
    /// View covering a whole `width` x `height` frame
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Check that the view is non-empty and lies inside the frame
    pub fn check_within(&self, width: u32, height: u32) -> Result<()> {
        let right = self.x as u64 + self.width as u64;
        let bottom = self.y as u64 + self.height as u64;
        if self.width == 0 || self.height == 0 || right > width as u64 || bottom > height as u64 {
            return Err(StreamError::out_of_range(format!(
                "View {}x{}+{}+{} exceeds {}x{} frame",
                self.width, self.height, self.x, self.y, width, height
            )));
        }
        Ok(())
    }
}

/// Metadata of an open decode session
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// File path or stream description
    pub source: String,

    /// Frame width in pixels (0 without video)
    pub width: u32,

    /// Frame height in pixels (0 without video)
    pub height: u32,

    /// Bytes per pixel of delivered frames
    pub color_channels: usize,

    /// Nominal frame rate (0 without video)
    pub frame_rate: f64,

    /// Delivered audio format, if the stream has audio
    pub audio: Option<AudioFormat>,

    /// First presentable time in microseconds
    pub start_time_us: i64,

    /// Last presentable time in microseconds
    pub end_time_us: i64,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Length of the stream in microseconds
    pub fn duration_us(&self) -> i64 {
        self.end_time_us - self.start_time_us
    }

    /// Length of the stream
    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.duration_us().max(0) as u64)
    }

    /// Interval between two frames in microseconds
    pub fn frame_interval_us(&self) -> i64 {
        if self.frame_rate > 0.0 {
            (1_000_000.0 / self.frame_rate).round() as i64
        } else {
            0
        }
    }

    /// Size of a buffer holding one full frame
    pub fn frame_buffer_size(&self) -> usize {
        self.width as usize * self.height as usize * self.color_channels
    }

    /// Whether `time_us` lies inside `[start, end]`
    pub fn contains(&self, time_us: i64) -> bool {
        (self.start_time_us..=self.end_time_us).contains(&time_us)
    }
}

/// Reject open requests the decode boundary does not support
///
/// Colour space must be sRGB. Audio must be mono signed PCM or stereo
/// unsigned PCM.
pub fn validate_request(color_space: ColorSpace, audio: &AudioRequest) -> Result<()> {
    if color_space != ColorSpace::Srgb {
        return Err(StreamError::UnsupportedFormat(format!(
            "Color space {:?} not supported, only sRGB",
            color_space
        )));
    }

    match (audio.channels, audio.encoding) {
        (1, AudioEncoding::PcmSigned) | (2, AudioEncoding::PcmUnsigned) => Ok(()),
        (channels, encoding) => Err(StreamError::UnsupportedFormat(format!(
            "Audio layout {} ch {:?} not supported",
            channels, encoding
        ))),
    }
}
