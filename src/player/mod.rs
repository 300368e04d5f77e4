//! Playback engine module for avsync
//!
//! A single command-loop thread owns the decode session and is the only
//! caller of transport operations (seek, speed, view, close). Callers talk to
//! it through [`PlaybackEngine`], which queues [`TransportCommand`]s and
//! reports progress as [`EngineEvent`]s.

mod command;
mod engine;
mod settings;

pub use command::{CommandQueue, TransportCommand};
pub use engine::{PlaybackEngine, PlaybackEngineBuilder};
pub use settings::ViewerSettings;

use crate::decoder::MediaInfo;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Opening the decoder and wiring readers and output
    Initializing,

    /// Repositioning the transport
    Seeking,

    /// Readers running and the clock advancing
    Playing,

    /// Winding playback down
    Stopping,

    /// Changing speed
    AdjustingSpeed,

    /// Nothing running
    Idle,
}

impl PlaybackState {
    /// Whether the engine settles in this state between commands
    pub fn is_resting(&self) -> bool {
        matches!(self, PlaybackState::Idle | PlaybackState::Playing)
    }
}

/// Engine event for external event handling
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Decoder opened
    MediaOpened {
        info: MediaInfo,
        /// Frame size scaled to the configured display height
        display_size: (u32, u32),
    },

    StateChanged(PlaybackState),

    SpeedChanged(f32),

    /// Transport moved to this time in milliseconds
    Seeked(i64),

    /// Playback ran into the end (or, in reverse, the start) of the stream
    EndOfStream,

    /// The decode session is gone and must be reopened
    StreamClosed,

    Error(String),
}

/// Receives engine events on the engine thread
pub trait EngineEventHandler: Send + Sync {
    fn handle_event(&self, event: &EngineEvent);
}

impl<F> EngineEventHandler for F
where
    F: Fn(&EngineEvent) + Send + Sync,
{
    fn handle_event(&self, event: &EngineEvent) {
        self(event)
    }
}

/// Consumer of decoded frames and playback position
pub trait RenderSink: Send + Sync {
    /// A frame of `width` x `height` pixels with `channels` bytes per pixel
    fn on_frame_ready(&self, pixels: &[u8], width: u32, height: u32, channels: usize);

    /// Playback reached `time_ms`
    fn on_position_changed(&self, time_ms: i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resting_states() {
        assert!(PlaybackState::Idle.is_resting());
        assert!(PlaybackState::Playing.is_resting());
        assert!(!PlaybackState::Seeking.is_resting());
        assert!(!PlaybackState::AdjustingSpeed.is_resting());
    }
}
