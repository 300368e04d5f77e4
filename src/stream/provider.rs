//! Stream provider owning the audio and video readers of one session

use crate::decoder::{BufferPool, MediaDecoder, ReadStatus, Track};
use crate::stream::{ReaderNotice, StreamListener, StreamReader};
use crate::utils::config::DEFAULT_CHUNK_SIZE;
use crate::utils::error::{Result, StreamError};
use crossbeam_channel::Sender;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Builder wiring listeners before any reader thread exists
pub struct StreamProviderBuilder {
    audio_listeners: Vec<Arc<dyn StreamListener>>,
    video_listeners: Vec<Arc<dyn StreamListener>>,
    chunk_size: usize,
    idle_poll: Duration,
    notices: Option<Sender<ReaderNotice>>,
}

impl Default for StreamProviderBuilder {
    fn default() -> Self {
        Self {
            audio_listeners: Vec::new(),
            video_listeners: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            idle_poll: Duration::from_millis(20),
            notices: None,
        }
    }
}

impl StreamProviderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audio_listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.audio_listeners.push(listener);
        self
    }

    pub fn with_video_listener(mut self, listener: Arc<dyn StreamListener>) -> Self {
        self.video_listeners.push(listener);
        self
    }

    /// Bytes per audio chunk
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    /// Channel receiving boundary and fault notices
    pub fn with_notices(mut self, notices: Sender<ReaderNotice>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Create the readers for `decoder` and announce the stream to every listener
    pub fn build(self, decoder: Arc<dyn MediaDecoder>) -> Result<StreamProvider> {
        let info = decoder.info().clone();
        if self.chunk_size == 0 {
            return Err(StreamError::Config("Audio chunk size must be non-zero".to_string()));
        }

        for listener in self.audio_listeners.iter().chain(self.video_listeners.iter()) {
            listener.stream_opened(&info);
        }

        let audio = info.has_audio().then(|| {
            StreamReader::new(
                Track::Audio,
                Arc::clone(&decoder),
                self.audio_listeners,
                BufferPool::new(Track::Audio, self.chunk_size),
                self.idle_poll,
                self.notices.clone(),
            )
        });

        // Video buffers keep the full frame size; a narrower view fills less of them
        let video = info.has_video().then(|| {
            StreamReader::new(
                Track::Video,
                Arc::clone(&decoder),
                self.video_listeners,
                BufferPool::new(Track::Video, info.frame_buffer_size()),
                self.idle_poll,
                self.notices,
            )
        });

        info!(
            "Stream provider ready for {} (audio: {}, video: {})",
            info.source,
            audio.is_some(),
            video.is_some()
        );

        Ok(StreamProvider {
            decoder,
            audio,
            video,
            closed: false,
        })
    }
}

/// Owns the readers of one decode session
pub struct StreamProvider {
    decoder: Arc<dyn MediaDecoder>,
    audio: Option<StreamReader>,
    video: Option<StreamReader>,
    closed: bool,
}

impl StreamProvider {
    pub fn builder() -> StreamProviderBuilder {
        StreamProviderBuilder::new()
    }

    pub fn decoder(&self) -> &Arc<dyn MediaDecoder> {
        &self.decoder
    }

    pub fn start_audio(&mut self) -> Result<()> {
        match self.audio.as_mut() {
            Some(reader) => reader.start(),
            None => Ok(()),
        }
    }

    pub fn start_video(&mut self) -> Result<()> {
        match self.video.as_mut() {
            Some(reader) => reader.start(),
            None => Ok(()),
        }
    }

    /// Start both readers
    pub fn start(&mut self) -> Result<()> {
        self.start_audio()?;
        self.start_video()
    }

    pub fn stop_audio(&mut self) {
        if let Some(reader) = self.audio.as_mut() {
            reader.stop();
        }
    }

    pub fn stop_video(&mut self) {
        if let Some(reader) = self.video.as_mut() {
            reader.stop();
        }
    }

    /// Stop both readers, joining their threads
    pub fn stop(&mut self) {
        self.stop_audio();
        self.stop_video();
    }

    pub fn is_running(&self, track: Track) -> bool {
        let reader = match track {
            Track::Audio => self.audio.as_ref(),
            Track::Video => self.video.as_ref(),
        };
        reader.map(StreamReader::is_running).unwrap_or(false)
    }

    /// Read the next frame and publish it to the video listeners
    ///
    /// Only valid while the video reader is stopped. Returns false at a
    /// stream boundary.
    pub fn next_image_frame(&mut self) -> Result<bool> {
        self.step_frame(true)
    }

    /// Read the next frame and discard it
    pub fn drop_image_frame(&mut self) -> Result<bool> {
        self.step_frame(false)
    }

    fn step_frame(&mut self, publish: bool) -> Result<bool> {
        let reader = self
            .video
            .as_ref()
            .ok_or_else(|| StreamError::InvalidState("Stream has no video".to_string()))?;
        if reader.is_running() {
            return Err(StreamError::InvalidState("Video reader is running".to_string()));
        }

        let (status, unit) = StreamReader::read_unit(Track::Video, self.decoder.as_ref(), reader.pool())?;
        match status {
            ReadStatus::Data { timestamp_us, .. } => {
                debug!("Stepped to frame at {} us", timestamp_us);
                if publish {
                    StreamReader::publish(reader.listeners(), unit);
                } else {
                    unit.release();
                }
                Ok(true)
            }
            _ => {
                unit.release();
                Ok(false)
            }
        }
    }

    /// Stop the readers and tell every listener the stream is gone
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop();

        for reader in self.audio.iter().chain(self.video.iter()) {
            for listener in reader.listeners() {
                listener.stream_closed();
            }
        }
        info!("Stream provider closed");
    }
}

impl Drop for StreamProvider {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{AudioRequest, DecodedUnit, MediaInfo, SyntheticConfig, SyntheticDecoder};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Frames {
        opened: Mutex<Option<(u32, u32)>>,
        timestamps: Mutex<Vec<i64>>,
        closed: Mutex<usize>,
    }

    impl StreamListener for Frames {
        fn stream_opened(&self, info: &MediaInfo) {
            *self.opened.lock() = Some((info.width, info.height));
        }

        fn on_unit(&self, unit: DecodedUnit) {
            self.timestamps.lock().push(unit.timestamp_us());
        }

        fn stream_closed(&self) {
            *self.closed.lock() += 1;
        }
    }

    fn decoder() -> Arc<dyn MediaDecoder> {
        let config = SyntheticConfig {
            width: 16,
            height: 8,
            fps: 10.0,
            duration_us: 1_000_000,
            ..SyntheticConfig::default()
        };
        Arc::new(SyntheticDecoder::new("test".into(), config, AudioRequest::MONO_SIGNED).unwrap())
    }

    #[test]
    fn test_build_announces_stream() {
        let frames = Arc::new(Frames::default());
        let _provider = StreamProvider::builder()
            .with_video_listener(frames.clone())
            .build(decoder())
            .unwrap();
        assert_eq!(*frames.opened.lock(), Some((16, 8)));
    }

    #[test]
    fn test_step_and_drop_frames() {
        let frames = Arc::new(Frames::default());
        let mut provider = StreamProvider::builder()
            .with_video_listener(frames.clone())
            .build(decoder())
            .unwrap();

        assert!(provider.next_image_frame().unwrap());
        assert!(provider.drop_image_frame().unwrap());
        assert!(provider.next_image_frame().unwrap());
        assert_eq!(*frames.timestamps.lock(), vec![0, 200_000]);
    }

    #[test]
    fn test_step_rejected_while_running() {
        let mut provider = StreamProvider::builder().build(decoder()).unwrap();
        provider.decoder().start().unwrap();
        provider.start_video().unwrap();
        assert!(provider.is_running(Track::Video));
        assert!(matches!(
            provider.next_image_frame(),
            Err(StreamError::InvalidState(_))
        ));
        provider.stop();
        assert!(!provider.is_running(Track::Video));
    }

    #[test]
    fn test_close_notifies_once() {
        let frames = Arc::new(Frames::default());
        let mut provider = StreamProvider::builder()
            .with_audio_listener(frames.clone())
            .build(decoder())
            .unwrap();
        provider.close();
        provider.close();
        drop(provider);
        assert_eq!(*frames.closed.lock(), 1);
    }
}
