//! Synthetic decode backend
//!
//! Generates a moving test pattern and a sine tone instead of decoding a
//! file. Video frames are paced against the transport clock at the current
//! speed, including reverse playback and frame skipping, which makes the
//! backend a stand-in for a native decoder in tests and in `--synthetic` mode.

use super::pacing::{FramePacer, FramePresentation, PlaybackClock, Sleeper, Wakeup};
use super::stream_info::{validate_request, AudioEncoding, AudioFormat, AudioRequest, ColorSpace, MediaInfo, View};
use super::{validate_seek, validate_speed, DecoderBackend, MediaDecoder, ReadStatus, MAX_SPEED, MIN_SPEED};
use crate::utils::error::{Result, StreamError};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::f64::consts::PI;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Shape of the generated stream
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_us: i64,
    pub sample_rate: u32,
    pub tone_hz: f64,
    pub with_video: bool,
    pub with_audio: bool,

    /// Report a decode fault once this many video frames have been read
    pub fail_after_frames: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 25.0,
            duration_us: 10_000_000,
            sample_rate: 22050,
            tone_hz: 440.0,
            with_video: true,
            with_audio: true,
            fail_after_frames: None,
        }
    }
}

/// Opens synthetic sessions; the path only names the session
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    pub config: SyntheticConfig,
}

impl SyntheticBackend {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl DecoderBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(
        &self,
        path: &Path,
        color_space: ColorSpace,
        audio: AudioRequest,
    ) -> Result<Arc<dyn MediaDecoder>> {
        validate_request(color_space, &audio)?;
        Ok(Arc::new(SyntheticDecoder::new(
            path.display().to_string(),
            self.config.clone(),
            audio,
        )?))
    }
}

struct SynthState {
    clock: PlaybackClock,
    /// Index of the next video frame in the playback direction
    next_frame: i64,
    /// Next audio sample frame
    audio_cursor: u64,
    play_sound: bool,
    view: View,
    frames_read: u64,
}

/// Open synthetic session
pub struct SyntheticDecoder {
    info: MediaInfo,
    config: SyntheticConfig,
    format: Option<AudioFormat>,
    pacer: FramePacer,
    last_frame: i64,
    total_audio_frames: u64,
    state: Mutex<SynthState>,
    open: AtomicBool,
    sleeper: Sleeper,
}

impl SyntheticDecoder {
    pub fn new(source: String, config: SyntheticConfig, audio: AudioRequest) -> Result<Self> {
        if config.duration_us <= 0 || (config.with_video && (config.fps <= 0.0 || config.width == 0 || config.height == 0)) {
            return Err(StreamError::UnsupportedFormat("Empty synthetic stream".to_string()));
        }

        let format = config.with_audio.then(|| audio.with_rate(config.sample_rate));
        let (width, height) = if config.with_video {
            (config.width, config.height)
        } else {
            (0, 0)
        };

        let info = MediaInfo {
            source,
            width,
            height,
            color_channels: if config.with_video { ColorSpace::Srgb.channels() } else { 0 },
            frame_rate: if config.with_video { config.fps } else { 0.0 },
            audio: format,
            start_time_us: 0,
            end_time_us: config.duration_us,
        };

        let pacer = FramePacer::new(config.fps);
        let last_frame = config.duration_us / pacer.frame_duration_us();
        let total_audio_frames = format
            .map(|f| f.micros_to_frames(config.duration_us))
            .unwrap_or(0);

        info!(
            "Opened synthetic stream {}: {}x{} @ {} fps, {:.3} s",
            info.source,
            width,
            height,
            info.frame_rate,
            config.duration_us as f64 / 1e6
        );

        Ok(Self {
            state: Mutex::new(SynthState {
                clock: PlaybackClock::new(0, config.duration_us),
                next_frame: 0,
                audio_cursor: 0,
                play_sound: true,
                view: View::full(width, height),
                frames_read: 0,
            }),
            info,
            format,
            pacer,
            last_frame,
            total_audio_frames,
            config,
            open: AtomicBool::new(true),
            sleeper: Sleeper::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StreamError::Interrupted("decoder closed".to_string()))
        }
    }

    fn frame_time(&self, index: i64) -> i64 {
        index * self.pacer.frame_duration_us()
    }

    /// Frame nearest to the clock position
    fn frame_at(&self, time_us: i64) -> i64 {
        let d = self.pacer.frame_duration_us();
        ((time_us + d / 2) / d).clamp(0, self.last_frame)
    }

    /// Paint frame `index` into `buf`, honouring the view
    fn render(&self, index: i64, view: &View, buf: &mut [u8]) -> Result<usize> {
        let len = view.width as usize * view.height as usize * 3;
        if buf.len() < len {
            return Err(StreamError::Internal(format!(
                "Video buffer of {} bytes cannot hold {}",
                buf.len(),
                len
            )));
        }

        let shift = index as usize;
        for (row, line) in buf[..len].chunks_exact_mut(view.width as usize * 3).enumerate() {
            let y = view.y as usize + row;
            for (col, px) in line.chunks_exact_mut(3).enumerate() {
                let x = view.x as usize + col;
                px[0] = (x + shift) as u8;
                px[1] = (y + 2 * shift) as u8;
                px[2] = shift as u8;
            }
        }
        Ok(len)
    }

    fn deliver_frame(&self, state: &mut SynthState, index: i64, units: usize, buf: &mut [u8]) -> Result<ReadStatus> {
        let view = state.view;
        let len = self.render(index, &view, buf)?;
        let forward = state.clock.speed() > 0.0;
        state.next_frame = if forward { index + 1 } else { index - 1 };
        state.frames_read += 1;

        Ok(ReadStatus::Data {
            units,
            timestamp_us: self.frame_time(index),
            len,
        })
    }
}

impl MediaDecoder for SyntheticDecoder {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn available_video(&self) -> bool {
        self.open.load(Ordering::Acquire) && self.info.has_video()
    }

    fn available_audio(&self) -> bool {
        if !self.open.load(Ordering::Acquire) || !self.info.has_audio() {
            return false;
        }
        let state = self.state.lock();
        state.play_sound && state.clock.speed() > 0.0
    }

    fn read_video_frame(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        if !self.info.has_video() {
            return Err(StreamError::InvalidState("Synthetic stream has no video".to_string()));
        }

        let token = self.sleeper.token();
        loop {
            let wait = {
                self.ensure_open()?;
                let mut state = self.state.lock();

                if let Some(limit) = self.config.fail_after_frames {
                    if state.frames_read >= limit {
                        error!("Injected decode fault after {} frames", limit);
                        return Err(StreamError::decode_fault("injected fault"));
                    }
                }

                let next = state.next_frame;
                if next < 0 || next > self.last_frame {
                    return Ok(ReadStatus::Boundary);
                }

                // Unpaced while the clock is stopped: single stepping
                if !state.clock.is_running() {
                    let status = self.deliver_frame(&mut state, next, 1, buf)?;
                    state.clock.seek(self.frame_time(next));
                    return Ok(status);
                }

                let speed = state.clock.speed();
                match self.pacer.schedule(self.frame_time(next), state.clock.now_us(), speed) {
                    FramePresentation::Present => return self.deliver_frame(&mut state, next, 1, buf),
                    FramePresentation::Skip(n) => {
                        let step = if speed > 0.0 { n as i64 } else { -(n as i64) };
                        let target = (next + step).clamp(0, self.last_frame);
                        let units = (target - next).unsigned_abs() as usize + 1;
                        return self.deliver_frame(&mut state, target, units, buf);
                    }
                    FramePresentation::Wait(d) => d,
                }
            };

            if self.sleeper.sleep(token, Some(wait.min(Duration::from_millis(100)))) == Wakeup::Woken {
                return Ok(ReadStatus::Woken);
            }
        }
    }

    fn read_audio_chunk(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.ensure_open()?;
        let format = match self.format {
            Some(format) => format,
            None => return Err(StreamError::InvalidState("Synthetic stream has no audio".to_string())),
        };

        let mut state = self.state.lock();
        if !state.play_sound || state.clock.speed() <= 0.0 {
            return Ok(ReadStatus::Woken);
        }
        if state.audio_cursor >= self.total_audio_frames {
            return Ok(ReadStatus::Boundary);
        }

        let frames = (format.frames_in(buf.len()) as u64).min(self.total_audio_frames - state.audio_cursor);
        let start = state.audio_cursor;
        let step = 2.0 * PI * self.config.tone_hz / format.sample_rate as f64;

        for (i, dst) in buf[..frames as usize * format.frame_size]
            .chunks_exact_mut(format.frame_size)
            .enumerate()
        {
            let v = ((start + i as u64) as f64 * step).sin() * 0.25;
            match format.encoding {
                AudioEncoding::PcmSigned => {
                    let s = (v * i16::MAX as f64) as i16;
                    dst.copy_from_slice(&s.to_le_bytes());
                }
                AudioEncoding::PcmUnsigned => dst.fill((v * 127.0 + 128.0) as u8),
                AudioEncoding::PcmFloat => {
                    return Err(StreamError::UnsupportedFormat("float delivery".to_string()))
                }
            }
        }

        state.audio_cursor += frames;
        Ok(ReadStatus::Data {
            units: 1,
            timestamp_us: format.frames_to_micros(start),
            len: frames as usize * format.frame_size,
        })
    }

    fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().clock.start();
        self.sleeper.wake();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.state.lock().clock.stop();
        self.sleeper.wake();
        Ok(())
    }

    fn seek(&self, time_us: i64) -> Result<()> {
        self.ensure_open()?;
        validate_seek(&self.info, time_us)?;

        let mut state = self.state.lock();
        state.clock.seek(time_us);
        state.next_frame = self.frame_at(time_us);
        if let Some(format) = self.format {
            state.audio_cursor = format.micros_to_frames(time_us);
        }
        debug!("Synthetic seek to {} us (frame {})", time_us, state.next_frame);
        drop(state);

        self.sleeper.wake();
        Ok(())
    }

    fn set_speed(&self, speed: f32) -> Result<()> {
        self.ensure_open()?;
        validate_speed(speed, MIN_SPEED, MAX_SPEED)?;

        let mut state = self.state.lock();
        let reversing = (state.clock.speed() > 0.0) != (speed > 0.0);
        state.clock.set_speed(speed);
        if reversing {
            state.next_frame = self.frame_at(state.clock.now_us());
        }
        drop(state);

        self.sleeper.wake();
        Ok(())
    }

    fn speed(&self) -> f32 {
        self.state.lock().clock.speed()
    }

    fn set_view(&self, view: View) -> Result<()> {
        self.ensure_open()?;
        view.check_within(self.info.width, self.info.height)?;
        self.state.lock().view = view;
        Ok(())
    }

    fn view(&self) -> View {
        self.state.lock().view
    }

    fn current_time_us(&self) -> i64 {
        self.state.lock().clock.now_us()
    }

    fn at_start(&self) -> bool {
        self.state.lock().clock.at_start()
    }

    fn at_end(&self) -> bool {
        self.state.lock().clock.at_end()
    }

    fn set_play_sound(&self, enabled: bool) {
        let mut state = self.state.lock();
        if state.play_sound != enabled {
            state.play_sound = enabled;
            if let (true, Some(format)) = (enabled, self.format) {
                state.audio_cursor = format.micros_to_frames(state.clock.now_us());
            }
        }
    }

    fn reset(&self) -> Result<()> {
        self.seek(self.info.start_time_us)
    }

    fn wake(&self) {
        self.sleeper.wake();
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.sleeper.wake();
            info!("Closed synthetic stream {}", self.info.source);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn small() -> SyntheticConfig {
        SyntheticConfig {
            width: 8,
            height: 4,
            fps: 50.0,
            duration_us: 2_000_000,
            ..SyntheticConfig::default()
        }
    }

    fn open(config: SyntheticConfig) -> SyntheticDecoder {
        SyntheticDecoder::new("test".to_string(), config, AudioRequest::MONO_SIGNED).unwrap()
    }

    #[test]
    fn test_step_while_stopped() {
        let decoder = open(small());
        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];

        let first = decoder.read_video_frame(&mut buf).unwrap();
        assert_eq!(
            first,
            ReadStatus::Data {
                units: 1,
                timestamp_us: 0,
                len: 8 * 4 * 3
            }
        );
        let second = decoder.read_video_frame(&mut buf).unwrap();
        assert!(matches!(second, ReadStatus::Data { timestamp_us: 20_000, .. }));
        assert_eq!(decoder.current_time_us(), 20_000);
    }

    #[test]
    fn test_boundary_forward_and_reverse() {
        let decoder = open(small());
        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];

        decoder.seek(2_000_000).unwrap();
        assert!(decoder.at_end());
        assert!(!decoder.at_start());
        assert!(matches!(decoder.read_video_frame(&mut buf).unwrap(), ReadStatus::Data { .. }));
        assert_eq!(decoder.read_video_frame(&mut buf).unwrap(), ReadStatus::Boundary);

        decoder.set_speed(-1.0).unwrap();
        decoder.seek(0).unwrap();
        assert!(decoder.at_start());
        assert!(!decoder.at_end());
        assert!(matches!(decoder.read_video_frame(&mut buf).unwrap(), ReadStatus::Data { timestamp_us: 0, .. }));
        assert_eq!(decoder.read_video_frame(&mut buf).unwrap(), ReadStatus::Boundary);
    }

    #[test]
    fn test_paced_playback_skips_when_behind() {
        let decoder = open(small());
        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];

        decoder.set_speed(4.0).unwrap();
        decoder.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        match decoder.read_video_frame(&mut buf).unwrap() {
            ReadStatus::Data { units, .. } => assert!(units > 1, "expected skipped frames, got {}", units),
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_wake_interrupts_blocked_read() {
        let decoder = Arc::new(open(small()));
        decoder.seek(1_000_000).unwrap();
        decoder.set_speed(0.1).unwrap();
        decoder.start().unwrap();

        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];
        decoder.read_video_frame(&mut buf).unwrap();

        let waker = {
            let decoder = Arc::clone(&decoder);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                decoder.wake();
            })
        };

        let started = Instant::now();
        assert_eq!(decoder.read_video_frame(&mut buf).unwrap(), ReadStatus::Woken);
        assert!(started.elapsed() < Duration::from_millis(150));
        waker.join().unwrap();
    }

    #[test]
    fn test_view_limits_written_bytes() {
        let decoder = open(small());
        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];

        decoder.set_view(View { x: 2, y: 1, width: 4, height: 2 }).unwrap();
        assert!(decoder.set_view(View { x: 6, y: 0, width: 4, height: 2 }).is_err());

        match decoder.read_video_frame(&mut buf).unwrap() {
            ReadStatus::Data { len, .. } => assert_eq!(len, 4 * 2 * 3),
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_injected_fault() {
        let decoder = open(SyntheticConfig {
            fail_after_frames: Some(2),
            ..small()
        });
        let mut buf = vec![0u8; decoder.info().frame_buffer_size()];
        decoder.read_video_frame(&mut buf).unwrap();
        decoder.read_video_frame(&mut buf).unwrap();
        assert!(decoder.read_video_frame(&mut buf).unwrap_err().is_fatal());
    }

    #[test]
    fn test_audio_chunks_follow_cursor() {
        let decoder = open(small());
        let mut buf = vec![0u8; 8192];

        decoder.seek(1_000_000).unwrap();
        match decoder.read_audio_chunk(&mut buf).unwrap() {
            ReadStatus::Data { timestamp_us, len, .. } => {
                assert_eq!(timestamp_us, 1_000_000);
                assert_eq!(len, 8192);
            }
            other => panic!("Expected data, got {:?}", other),
        }

        decoder.set_speed(2.0).unwrap();
        decoder.set_play_sound(false);
        assert!(!decoder.available_audio());
        assert_eq!(decoder.read_audio_chunk(&mut buf).unwrap(), ReadStatus::Woken);
    }
}
