//! Stream reader module for avsync
//!
//! One reader thread per track pulls decoded units from the shared decoder
//! and publishes them to a fixed set of listeners registered before the
//! thread starts. The [`StreamProvider`] owns both readers.

mod provider;
mod reader;

pub use provider::{StreamProvider, StreamProviderBuilder};
pub use reader::StreamReader;

use crate::decoder::{DecodedUnit, MediaInfo, Track};

/// Receives units and lifecycle notifications from a stream reader
///
/// All callbacks run on the reader thread. `on_unit` may block briefly for
/// backpressure but must return once [`interrupt`](StreamListener::interrupt)
/// has been called.
pub trait StreamListener: Send + Sync {
    /// The stream was opened and listeners are wired
    fn stream_opened(&self, _info: &MediaInfo) {}

    /// The reader thread started
    fn stream_started(&self) {}

    /// A decoded unit; the listener now owns it
    fn on_unit(&self, unit: DecodedUnit);

    /// The reader hit the end (or, in reverse, the start) of the stream
    fn stream_ended(&self) {}

    /// The reader thread stopped on request
    fn stream_stopped(&self) {}

    /// The stream is gone: a fatal decode fault or the provider closed
    fn stream_closed(&self) {}

    /// Unblock an `on_unit` call in progress so the reader can stop
    fn interrupt(&self) {}
}

/// Reader events the engine cares about
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderNotice {
    /// A boundary was reached
    Ended(Track),

    /// The reader died on a decode fault
    Fault(Track, String),
}
