//! avsync: synchronized audio/video stream playback
//!
//! A decoder session delivers timestamped video frames and audio chunks to
//! reader threads, which hand them to listeners. Audio goes through a
//! bounded, time-ordered queue to an output sink whose progress drives the
//! reported playback position. A single command-loop thread serializes all
//! transport operations.

pub mod audio;
pub mod decoder;
pub mod player;
pub mod stream;
pub mod utils;
