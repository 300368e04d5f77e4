//! WAV decode backend built on hound
//!
//! Audio-only sessions. Samples are converted to the requested PCM layout
//! while reading; the transport position comes from a [`PlaybackClock`]
//! while the decode cursor runs ahead of it by whatever the audio output
//! has buffered.

use super::pacing::{PlaybackClock, Sleeper};
use super::stream_info::{validate_request, AudioEncoding, AudioFormat, AudioRequest, ColorSpace, MediaInfo, View};
use super::{validate_seek, validate_speed, DecoderBackend, MediaDecoder, ReadStatus, MAX_SPEED, MIN_SPEED};
use crate::utils::error::{IntoStreamError, Result, StreamError};
use hound::{SampleFormat, WavReader, WavSpec};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Opens WAV files
#[derive(Debug, Default, Clone, Copy)]
pub struct WavBackend;

impl DecoderBackend for WavBackend {
    fn name(&self) -> &'static str {
        "wav"
    }

    fn open(
        &self,
        path: &Path,
        color_space: ColorSpace,
        audio: AudioRequest,
    ) -> Result<Arc<dyn MediaDecoder>> {
        validate_request(color_space, &audio)?;
        Ok(Arc::new(WavDecoder::open(path, audio)?))
    }
}

struct WavState {
    reader: Option<WavReader<BufReader<File>>>,
    /// Next frame to decode
    cursor: u64,
    clock: PlaybackClock,
    play_sound: bool,
}

/// Open WAV session
pub struct WavDecoder {
    info: MediaInfo,
    format: AudioFormat,
    source: WavSpec,
    total_frames: u64,
    state: Mutex<WavState>,
    open: AtomicBool,
    sleeper: Sleeper,
}

impl WavDecoder {
    /// Open `path` delivering audio in the requested layout
    pub fn open(path: &Path, audio: AudioRequest) -> Result<Self> {
        if !path.exists() {
            return Err(StreamError::FileError(format!("{} not found", path.display())));
        }

        let reader = WavReader::open(path)?;
        let source = reader.spec();
        if source.channels == 0 || source.sample_rate == 0 {
            return Err(StreamError::UnsupportedFormat("WAV without channels or rate".to_string()));
        }
        if source.sample_format == SampleFormat::Int && source.bits_per_sample > 32 {
            return Err(StreamError::UnsupportedFormat(format!(
                "{}-bit WAV samples",
                source.bits_per_sample
            )));
        }

        let total_frames = reader.duration() as u64;
        let format = audio.with_rate(source.sample_rate);
        let end_time_us = format.frames_to_micros(total_frames);

        let info = MediaInfo {
            source: path.display().to_string(),
            width: 0,
            height: 0,
            color_channels: 0,
            frame_rate: 0.0,
            audio: Some(format),
            start_time_us: 0,
            end_time_us,
        };

        info!(
            "Opened {}: {} source ({} ch, {}-bit), delivering {}, {:.3} s",
            info.source,
            source.sample_rate,
            source.channels,
            source.bits_per_sample,
            format,
            end_time_us as f64 / 1e6
        );

        Ok(Self {
            info,
            format,
            source,
            total_frames,
            state: Mutex::new(WavState {
                reader: Some(reader),
                cursor: 0,
                clock: PlaybackClock::new(0, end_time_us),
                play_sound: true,
            }),
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

    /// Move the decode cursor to the clock position
    fn sync_cursor(&self, state: &mut WavState) -> Result<()> {
        let frame = self.format.micros_to_frames(state.clock.now_us()).min(self.total_frames);
        if let Some(reader) = state.reader.as_mut() {
            reader.seek(frame as u32).decode_err("Seeking WAV")?;
        }
        state.cursor = frame;
        Ok(())
    }

    /// Decode `frames` source frames into `out` in the delivered layout
    fn convert(&self, reader: &mut WavReader<BufReader<File>>, frames: usize, out: &mut [u8]) -> Result<()> {
        let channels = self.source.channels as usize;
        let wanted = frames * channels;

        let samples: Vec<f32> = match self.source.sample_format {
            SampleFormat::Int => {
                let scale = (1u64 << (self.source.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .take(wanted)
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .decode_err("Reading WAV samples")?
            }
            SampleFormat::Float => reader
                .samples::<f32>()
                .take(wanted)
                .collect::<std::result::Result<_, _>>()
                .decode_err("Reading WAV samples")?,
        };

        let silence = vec![0f32; channels];
        for i in 0..frames {
            let frame = samples
                .get(i * channels..(i + 1) * channels)
                .unwrap_or(&silence[..]);
            let dst = &mut out[i * self.format.frame_size..(i + 1) * self.format.frame_size];

            match self.format.encoding {
                AudioEncoding::PcmSigned => {
                    let mono = frame.iter().sum::<f32>() / channels as f32;
                    let v = (mono.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    dst.copy_from_slice(&v.to_le_bytes());
                }
                AudioEncoding::PcmUnsigned => {
                    let left = frame[0];
                    let right = if channels > 1 { frame[1] } else { frame[0] };
                    dst[0] = (left.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8;
                    dst[1] = (right.clamp(-1.0, 1.0) * 127.0 + 128.0) as u8;
                }
                AudioEncoding::PcmFloat => {
                    return Err(StreamError::UnsupportedFormat("float delivery".to_string()));
                }
            }
        }

        Ok(())
    }
}

impl MediaDecoder for WavDecoder {
    fn info(&self) -> &MediaInfo {
        &self.info
    }

    fn available_video(&self) -> bool {
        false
    }

    fn available_audio(&self) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        let state = self.state.lock();
        state.play_sound && state.clock.speed() > 0.0
    }

    fn read_video_frame(&self, _buf: &mut [u8]) -> Result<ReadStatus> {
        self.ensure_open()?;
        Err(StreamError::InvalidState("WAV stream has no video".to_string()))
    }

    fn read_audio_chunk(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        if !state.play_sound || state.clock.speed() <= 0.0 {
            return Ok(ReadStatus::Woken);
        }
        if state.cursor >= self.total_frames {
            return Ok(ReadStatus::Boundary);
        }

        let wanted = self.format.frames_in(buf.len()) as u64;
        let frames = wanted.min(self.total_frames - state.cursor) as usize;
        if frames == 0 {
            return Err(StreamError::Internal("Audio buffer smaller than one frame".to_string()));
        }

        let timestamp_us = self.info.start_time_us + self.format.frames_to_micros(state.cursor);
        let reader = state
            .reader
            .as_mut()
            .ok_or_else(|| StreamError::Interrupted("decoder closed".to_string()))?;
        self.convert(reader, frames, buf)?;
        state.cursor += frames as u64;

        Ok(ReadStatus::Data {
            units: 1,
            timestamp_us,
            len: frames * self.format.frame_size,
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
        self.sync_cursor(&mut state)?;
        debug!("WAV seek to {} us (frame {})", time_us, state.cursor);
        drop(state);

        self.sleeper.wake();
        Ok(())
    }

    fn set_speed(&self, speed: f32) -> Result<()> {
        self.ensure_open()?;
        validate_speed(speed, MIN_SPEED, MAX_SPEED)?;
        self.state.lock().clock.set_speed(speed);
        Ok(())
    }

    fn speed(&self) -> f32 {
        self.state.lock().clock.speed()
    }

    fn set_view(&self, view: View) -> Result<()> {
        self.ensure_open()?;
        view.check_within(self.info.width, self.info.height)
    }

    fn view(&self) -> View {
        View::full(0, 0)
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
        if state.play_sound == enabled {
            return;
        }
        state.play_sound = enabled;
        if enabled {
            if let Err(e) = self.sync_cursor(&mut state) {
                warn!("Could not resume WAV audio: {}", e);
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
            self.state.lock().reader = None;
            self.sleeper.wake();
            info!("Closed {}", self.info.source);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tone(path: &Path, channels: u16, sample_rate: u32, seconds: f32) {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (sample_rate as f32 * seconds) as u32;
        for n in 0..frames {
            let v = ((n as f32 * 440.0 * 2.0 * std::f32::consts::PI / sample_rate as f32).sin()
                * 8000.0) as i16;
            for _ in 0..channels {
                writer.write_sample(v).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_open_and_read_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 1, 22050, 1.0);

        let decoder = WavDecoder::open(&path, AudioRequest::MONO_SIGNED).unwrap();
        assert_eq!(decoder.info().end_time_us, 1_000_000);
        assert!(!decoder.info().has_video());
        assert!(decoder.available_audio());

        let mut buf = vec![0u8; 8192];
        let first = decoder.read_audio_chunk(&mut buf).unwrap();
        assert_eq!(
            first,
            ReadStatus::Data {
                units: 1,
                timestamp_us: 0,
                len: 8192
            }
        );

        match decoder.read_audio_chunk(&mut buf).unwrap() {
            ReadStatus::Data { timestamp_us, .. } => assert_eq!(timestamp_us, 185_759),
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_reads_until_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        write_tone(&path, 2, 8000, 0.5);

        let decoder = WavDecoder::open(&path, AudioRequest::STEREO_UNSIGNED).unwrap();
        let mut buf = vec![0u8; 4096];
        let mut bytes = 0;
        loop {
            match decoder.read_audio_chunk(&mut buf).unwrap() {
                ReadStatus::Data { len, .. } => bytes += len,
                ReadStatus::Boundary => break,
                ReadStatus::Woken => panic!("unexpected wake"),
            }
        }
        assert_eq!(bytes, 4000 * 2);
    }

    #[test]
    fn test_seek_and_speed_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 1, 22050, 2.0);

        let decoder = WavDecoder::open(&path, AudioRequest::MONO_SIGNED).unwrap();
        decoder.seek(1_500_000).unwrap();
        assert_eq!(decoder.current_time_us(), 1_500_000);
        assert!(matches!(decoder.seek(3_000_000), Err(StreamError::OutOfRange(_))));
        assert_eq!(decoder.current_time_us(), 1_500_000);

        decoder.set_speed(2.0).unwrap();
        assert!(decoder.set_speed(0.0).is_err());
        assert!(decoder.set_speed(5.0).is_err());
        assert_eq!(decoder.speed(), 2.0);

        assert!(decoder.set_view(View::full(10, 10)).is_err());
    }

    #[test]
    fn test_sound_off_and_reverse_disable_audio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 1, 8000, 0.5);

        let decoder = WavDecoder::open(&path, AudioRequest::MONO_SIGNED).unwrap();
        decoder.set_play_sound(false);
        assert!(!decoder.available_audio());
        decoder.set_play_sound(true);
        decoder.set_speed(-1.0).unwrap();
        assert!(!decoder.available_audio());
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        write_tone(&path, 1, 8000, 0.2);

        let decoder = WavDecoder::open(&path, AudioRequest::MONO_SIGNED).unwrap();
        decoder.close();
        decoder.close();
        assert!(!decoder.is_open());

        let mut buf = vec![0u8; 64];
        let err = decoder.read_audio_chunk(&mut buf).unwrap_err();
        assert!(err.is_interruption());
    }

    #[test]
    fn test_missing_file() {
        let err = WavBackend
            .open(Path::new("/nonexistent/a.wav"), ColorSpace::Srgb, AudioRequest::MONO_SIGNED)
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::FileError(_)));
    }
}
