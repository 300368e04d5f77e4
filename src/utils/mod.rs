//! Utility module for avsync
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Time unit conversions
//!
//! Microseconds in an `i64` are the canonical unit for every timestamp
//! inside the crate; milliseconds appear only at listener and command
//! boundaries.

pub mod config;
pub mod error;

pub use config::{AudioConfig, Config, DecoderConfig, EngineConfig, OutputKind, SpectrumConfig};
pub use error::{IntoStreamError, Result, StreamError};

/// Convert microseconds to milliseconds, truncating toward zero
pub fn micros_to_millis(us: i64) -> i64 {
    us / 1000
}

/// Convert milliseconds to microseconds
pub fn millis_to_micros(ms: i64) -> i64 {
    ms.saturating_mul(1000)
}

/// Convert seconds to microseconds, rounding to the nearest microsecond
pub fn secs_to_micros(secs: f64) -> i64 {
    (secs * 1_000_000.0).round() as i64
}

/// Format a duration for display
///
/// # Returns
///
/// Formatted string in the format "HH:MM:SS.mmm" or "MM:SS.mmm" for durations under an hour
pub fn format_duration(duration: std::time::Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}
