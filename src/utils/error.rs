//! Error types for avsync
//!
//! This module defines the error taxonomy shared by the decoder boundary,
//! the stream readers, the audio output and the playback engine.
//! We use thiserror for the library error type and anyhow only in the binary.

use thiserror::Error;

/// Main error type for avsync
#[derive(Error, Debug)]
pub enum StreamError {
    /// Media cannot be opened (missing file, unreadable)
    #[error("File error: {0}")]
    FileError(String),

    /// Requested color space or audio format is not supported
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Seek time, speed or view rectangle outside valid bounds
    #[error("Out of range: {0}")]
    OutOfRange(String),

    /// Fatal error in the decode pipeline; the session must be reopened
    #[error("Decode fault: {0}")]
    DecodeFault(String),

    /// A blocking operation was interrupted for shutdown
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Audio output device errors
    #[error("Audio error: {0}")]
    Audio(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not valid in the current engine state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Plain I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected situations
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<hound::Error> for StreamError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => StreamError::FileError(e.to_string()),
            hound::Error::Unsupported => {
                StreamError::UnsupportedFormat("WAV layout not supported".to_string())
            }
            other => StreamError::DecodeFault(format!("WAV error: {}", other)),
        }
    }
}

#[cfg(feature = "ffmpeg")]
impl From<ffmpeg_next::Error> for StreamError {
    fn from(err: ffmpeg_next::Error) -> Self {
        StreamError::DecodeFault(format!("FFmpeg error: {}", err))
    }
}

impl StreamError {
    /// Create a decode fault from string
    pub fn decode_fault<S: Into<String>>(msg: S) -> Self {
        StreamError::DecodeFault(msg.into())
    }

    /// Create an out-of-range error from string
    pub fn out_of_range<S: Into<String>>(msg: S) -> Self {
        StreamError::OutOfRange(msg.into())
    }

    /// Interruption is normal termination, not something to report to the user
    pub fn is_interruption(&self) -> bool {
        matches!(self, StreamError::Interrupted(_))
    }

    /// Whether the decode session is unusable after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::DecodeFault(_))
    }
}

/// Convenience type alias for Results in avsync
pub type Result<T> = std::result::Result<T, StreamError>;

/// Extension trait for converting other errors to StreamError
pub trait IntoStreamError<T> {
    /// Convert this error into a StreamError with the given context
    fn file_err(self, context: &str) -> Result<T>;
    fn decode_err(self, context: &str) -> Result<T>;
    fn audio_err(self, context: &str) -> Result<T>;
    fn config_err(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> IntoStreamError<T> for std::result::Result<T, E> {
    fn file_err(self, context: &str) -> Result<T> {
        self.map_err(|e| StreamError::FileError(format!("{}: {}", context, e)))
    }

    fn decode_err(self, context: &str) -> Result<T> {
        self.map_err(|e| StreamError::DecodeFault(format!("{}: {}", context, e)))
    }

    fn audio_err(self, context: &str) -> Result<T> {
        self.map_err(|e| StreamError::Audio(format!("{}: {}", context, e)))
    }

    fn config_err(self, context: &str) -> Result<T> {
        self.map_err(|e| StreamError::Config(format!("{}: {}", context, e)))
    }
}

/// Helper macro for creating internal errors with file and line information
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::utils::error::StreamError::Internal(
            format!("{} at {}:{}", $msg, file!(), line!())
        )
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::utils::error::StreamError::Internal(
            format!("{} at {}:{}", format!($fmt, $($arg)*), file!(), line!())
        )
    };
}
