//! FFmpeg decode backend
//!
//! Decodes any container FFmpeg understands. Video is scaled to packed
//! RGB24 and paced against the transport clock; audio is resampled to the
//! requested PCM layout. Both tracks share one demuxer, so packets for the
//! track that is not being read are decoded into a small pending queue.

use super::pacing::{FramePacer, FramePresentation, PlaybackClock, Sleeper, Wakeup};
use super::stream_info::{validate_request, AudioEncoding, AudioFormat, AudioRequest, ColorSpace, MediaInfo, View};
use super::{validate_seek, validate_speed, DecoderBackend, MediaDecoder, ReadStatus, MAX_SPEED, MIN_SPEED};
use crate::utils::error::{Result, StreamError};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{format, media};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

/// Pending decoded units kept per track while the other track is read
const MAX_PENDING: usize = 64;

static INIT: Once = Once::new();

/// Opens files through FFmpeg
#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl DecoderBackend for FfmpegBackend {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(
        &self,
        path: &Path,
        color_space: ColorSpace,
        audio: AudioRequest,
    ) -> Result<Arc<dyn MediaDecoder>> {
        validate_request(color_space, &audio)?;

        let mut init_result = Ok(());
        INIT.call_once(|| {
            init_result = ffmpeg::init();
            ffmpeg::log::set_level(ffmpeg::log::Level::Warning);
        });
        init_result.map_err(|e| StreamError::Internal(format!("FFmpeg init failed: {}", e)))?;

        Ok(Arc::new(FfmpegDecoder::open(path, audio)?))
    }
}

struct VideoTrack {
    decoder: ffmpeg::codec::decoder::Video,
    index: usize,
    time_base: ffmpeg::Rational,
    scaler: Option<ffmpeg::software::scaling::Context>,
}

struct AudioTrack {
    decoder: ffmpeg::codec::decoder::Audio,
    index: usize,
    time_base: ffmpeg::Rational,
    resampler: Option<ffmpeg::software::resampling::Context>,
    target: AudioFormat,
}

/// Demuxer plus decoders; only ever touched under the session mutex
struct Session {
    input: format::context::Input,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    pending_video: VecDeque<(i64, Vec<u8>)>,
    pending_audio: VecDeque<(i64, Vec<u8>)>,
    drained: bool,
}

// The FFmpeg contexts hold raw pointers; all access is serialised by the
// decoder's mutex.
unsafe impl Send for Session {}

fn to_micros(ts: i64, time_base: ffmpeg::Rational) -> i64 {
    (ts as i128 * time_base.numerator() as i128 * 1_000_000 / time_base.denominator().max(1) as i128) as i64
}

impl Session {
    /// Demux and decode one packet; false once the input is exhausted
    fn pump(&mut self, keep_audio: bool) -> Result<bool> {
        if self.drained {
            return Ok(false);
        }

        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => {
                if let Some(video) = self.video.as_mut() {
                    video.decoder.send_eof()?;
                }
                if let Some(audio) = self.audio.as_mut() {
                    audio.decoder.send_eof()?;
                }
                self.receive(keep_audio)?;
                self.drained = true;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        let stream = packet.stream();
        if let Some(video) = self.video.as_mut() {
            if video.index == stream {
                video.decoder.send_packet(&packet)?;
            }
        }
        if let Some(audio) = self.audio.as_mut() {
            if audio.index == stream && keep_audio {
                audio.decoder.send_packet(&packet)?;
            }
        }

        self.receive(keep_audio)?;
        Ok(true)
    }

    fn receive(&mut self, keep_audio: bool) -> Result<()> {
        if let Some(video) = self.video.as_mut() {
            let mut frame = ffmpeg::frame::Video::empty();
            while video.decoder.receive_frame(&mut frame).is_ok() {
                let ts = to_micros(frame.timestamp().unwrap_or(0), video.time_base);
                let rgb = convert_video_frame(video, &frame)?;
                if self.pending_video.len() >= MAX_PENDING {
                    self.pending_video.pop_front();
                }
                self.pending_video.push_back((ts, rgb));
            }
        }

        if let Some(audio) = self.audio.as_mut() {
            let mut frame = ffmpeg::frame::Audio::empty();
            while audio.decoder.receive_frame(&mut frame).is_ok() {
                if !keep_audio {
                    continue;
                }
                let ts = to_micros(frame.timestamp().unwrap_or(0), audio.time_base);
                let pcm = convert_audio_frame(audio, &frame)?;
                if self.pending_audio.len() >= MAX_PENDING {
                    self.pending_audio.pop_front();
                }
                self.pending_audio.push_back((ts, pcm));
            }
        }

        Ok(())
    }

    fn seek(&mut self, time_us: i64) -> Result<()> {
        self.input.seek(time_us, ..time_us)?;
        if let Some(video) = self.video.as_mut() {
            video.decoder.flush();
        }
        if let Some(audio) = self.audio.as_mut() {
            audio.decoder.flush();
        }
        self.pending_video.clear();
        self.pending_audio.clear();
        self.drained = false;
        Ok(())
    }

    /// Decode until a video frame at or after `time_us` is pending
    fn decode_video_to(&mut self, time_us: i64, keep_audio: bool) -> Result<Option<(i64, Vec<u8>)>> {
        loop {
            while let Some((ts, _)) = self.pending_video.front() {
                if *ts >= time_us {
                    return Ok(self.pending_video.pop_front());
                }
                self.pending_video.pop_front();
            }
            if !self.pump(keep_audio)? {
                return Ok(None);
            }
        }
    }
}

/// Scale a decoded frame to tightly packed RGB24
fn convert_video_frame(video: &mut VideoTrack, frame: &ffmpeg::frame::Video) -> Result<Vec<u8>> {
    let rebuild = match video.scaler.as_ref() {
        Some(scaler) => scaler.input().width != frame.width() || scaler.input().height != frame.height(),
        None => true,
    };
    if rebuild {
        video.scaler = Some(ffmpeg::software::scaling::Context::get(
            frame.format(),
            frame.width(),
            frame.height(),
            ffmpeg::format::Pixel::RGB24,
            frame.width(),
            frame.height(),
            ffmpeg::software::scaling::Flags::BILINEAR,
        )?);
    }

    let mut rgb = ffmpeg::frame::Video::empty();
    if let Some(scaler) = video.scaler.as_mut() {
        scaler.run(frame, &mut rgb)?;
    }

    let row = rgb.width() as usize * 3;
    let stride = rgb.stride(0);
    let data = rgb.data(0);
    let mut out = Vec::with_capacity(row * rgb.height() as usize);
    for y in 0..rgb.height() as usize {
        out.extend_from_slice(&data[y * stride..y * stride + row]);
    }
    Ok(out)
}

/// Resample a decoded frame to the delivered PCM layout
fn convert_audio_frame(audio: &mut AudioTrack, frame: &ffmpeg::frame::Audio) -> Result<Vec<u8>> {
    let (sample, layout) = match audio.target.encoding {
        AudioEncoding::PcmSigned => (
            ffmpeg::format::Sample::I16(ffmpeg::format::sample::Type::Packed),
            ffmpeg::channel_layout::ChannelLayout::MONO,
        ),
        _ => (
            ffmpeg::format::Sample::U8(ffmpeg::format::sample::Type::Packed),
            ffmpeg::channel_layout::ChannelLayout::STEREO,
        ),
    };

    if audio.resampler.is_none() {
        audio.resampler = Some(ffmpeg::software::resampling::Context::get(
            frame.format(),
            frame.channel_layout(),
            frame.rate(),
            sample,
            layout,
            audio.target.sample_rate,
        )?);
    }

    let mut resampled = ffmpeg::frame::Audio::empty();
    if let Some(resampler) = audio.resampler.as_mut() {
        resampler.run(frame, &mut resampled)?;
    }

    let len = resampled.samples() * audio.target.frame_size;
    Ok(resampled.data(0)[..len].to_vec())
}

struct Transport {
    clock: PlaybackClock,
    last_video_us: Option<i64>,
    play_sound: bool,
    view: View,
}

/// Open FFmpeg session
pub struct FfmpegDecoder {
    info: MediaInfo,
    pacer: FramePacer,
    session: Mutex<Option<Session>>,
    transport: Mutex<Transport>,
    open: AtomicBool,
    sleeper: Sleeper,
}

impl FfmpegDecoder {
    pub fn open(path: &Path, audio_request: AudioRequest) -> Result<Self> {
        if !path.exists() {
            return Err(StreamError::FileError(format!("{} not found", path.display())));
        }

        let input = format::input(&path)
            .map_err(|e| StreamError::FileError(format!("{}: {}", path.display(), e)))?;

        let video = match input.streams().best(media::Type::Video) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
                Some((
                    VideoTrack {
                        decoder: context.decoder().video()?,
                        index: stream.index(),
                        time_base: stream.time_base(),
                        scaler: None,
                    },
                    f64::from(stream.avg_frame_rate()),
                ))
            }
            None => None,
        };

        let audio = match input.streams().best(media::Type::Audio) {
            Some(stream) => {
                let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())?;
                let decoder = context.decoder().audio()?;
                let target = audio_request.with_rate(decoder.rate());
                Some(AudioTrack {
                    decoder,
                    index: stream.index(),
                    time_base: stream.time_base(),
                    resampler: None,
                    target,
                })
            }
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(StreamError::UnsupportedFormat(format!(
                "{} has no audio or video stream",
                path.display()
            )));
        }

        let (width, height, frame_rate) = match &video {
            Some((track, fps)) => (track.decoder.width(), track.decoder.height(), *fps),
            None => (0, 0, 0.0),
        };
        let end_time_us = input.duration().max(0);

        let info = MediaInfo {
            source: path.display().to_string(),
            width,
            height,
            color_channels: if width > 0 { ColorSpace::Srgb.channels() } else { 0 },
            frame_rate,
            audio: audio.as_ref().map(|a| a.target),
            start_time_us: 0,
            end_time_us,
        };

        info!(
            "Opened {} with FFmpeg: {}x{} @ {:.2} fps, audio {:?}, {:.3} s",
            info.source,
            width,
            height,
            frame_rate,
            info.audio.map(|a| a.to_string()),
            end_time_us as f64 / 1e6
        );

        Ok(Self {
            pacer: FramePacer::new(frame_rate),
            session: Mutex::new(Some(Session {
                input,
                video: video.map(|(track, _)| track),
                audio,
                pending_video: VecDeque::new(),
                pending_audio: VecDeque::new(),
                drained: false,
            })),
            transport: Mutex::new(Transport {
                clock: PlaybackClock::new(0, end_time_us),
                last_video_us: None,
                play_sound: true,
                view: View::full(width, height),
            }),
            info,
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

    fn copy_view(&self, frame: &[u8], view: &View, buf: &mut [u8]) -> Result<usize> {
        let row = view.width as usize * 3;
        let len = row * view.height as usize;
        if buf.len() < len {
            return Err(StreamError::Internal("Video buffer too small for view".to_string()));
        }
        let full_row = self.info.width as usize * 3;
        for y in 0..view.height as usize {
            let src = (view.y as usize + y) * full_row + view.x as usize * 3;
            if let Some(line) = frame.get(src..src + row) {
                buf[y * row..(y + 1) * row].copy_from_slice(line);
            }
        }
        Ok(len)
    }
}

impl MediaDecoder for FfmpegDecoder {
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
        let transport = self.transport.lock();
        transport.play_sound && transport.clock.speed() > 0.0
    }

    fn read_video_frame(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        if !self.info.has_video() {
            return Err(StreamError::InvalidState("Stream has no video".to_string()));
        }

        let interval = self.pacer.frame_duration_us();
        let token = self.sleeper.token();
        loop {
            self.ensure_open()?;
            let (now, speed, running, last, view, keep_audio) = {
                let t = self.transport.lock();
                (
                    t.clock.now_us(),
                    t.clock.speed(),
                    t.clock.is_running(),
                    t.last_video_us,
                    t.view,
                    t.play_sound && t.clock.speed() > 0.0,
                )
            };

            let next_us = match (last, speed > 0.0) {
                (None, _) => now,
                (Some(last), true) => last + interval,
                (Some(last), false) => last - interval,
            };
            if next_us < self.info.start_time_us || next_us > self.info.end_time_us {
                return Ok(ReadStatus::Boundary);
            }

            let (target, units) = if !running {
                (next_us, 1)
            } else {
                match self.pacer.schedule(next_us, now, speed) {
                    FramePresentation::Present => (next_us, 1),
                    FramePresentation::Skip(n) => {
                        let step = if speed > 0.0 { n as i64 } else { -(n as i64) };
                        (next_us + step * interval, n + 1)
                    }
                    FramePresentation::Wait(d) => {
                        if self.sleeper.sleep(token, Some(d.min(Duration::from_millis(100)))) == Wakeup::Woken {
                            return Ok(ReadStatus::Woken);
                        }
                        continue;
                    }
                }
            };
            let target = target.clamp(self.info.start_time_us, self.info.end_time_us);

            let mut guard = self.session.lock();
            let session = guard
                .as_mut()
                .ok_or_else(|| StreamError::Interrupted("decoder closed".to_string()))?;
            if speed < 0.0 {
                session.seek(target)?;
            }
            let frame = session.decode_video_to(target - interval / 2, keep_audio)?;
            drop(guard);

            let (ts, rgb) = match frame {
                Some(frame) => frame,
                None => return Ok(ReadStatus::Boundary),
            };
            let len = self.copy_view(&rgb, &view, buf)?;

            let mut t = self.transport.lock();
            t.last_video_us = Some(ts);
            if !running {
                t.clock.seek(ts);
            }

            return Ok(ReadStatus::Data {
                units,
                timestamp_us: ts,
                len,
            });
        }
    }

    fn read_audio_chunk(&self, buf: &mut [u8]) -> Result<ReadStatus> {
        self.ensure_open()?;
        if !self.available_audio() {
            return Ok(ReadStatus::Woken);
        }

        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| StreamError::Interrupted("decoder closed".to_string()))?;

        while session.pending_audio.is_empty() {
            if !session.pump(true)? && session.pending_audio.is_empty() {
                return Ok(ReadStatus::Boundary);
            }
        }

        let (ts, mut pcm) = match session.pending_audio.pop_front() {
            Some(chunk) => chunk,
            None => return Ok(ReadStatus::Boundary),
        };

        let frame_size = self.info.audio.map(|a| a.frame_size).unwrap_or(1);
        let fits = (buf.len() / frame_size) * frame_size;
        if pcm.len() > fits {
            let rest = pcm.split_off(fits);
            let rest_ts = ts + self
                .info
                .audio
                .map(|a| a.frames_to_micros((fits / frame_size) as u64))
                .unwrap_or(0);
            session.pending_audio.push_front((rest_ts, rest));
        }

        buf[..pcm.len()].copy_from_slice(&pcm);
        Ok(ReadStatus::Data {
            units: 1,
            timestamp_us: ts,
            len: pcm.len(),
        })
    }

    fn start(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.lock().clock.start();
        self.sleeper.wake();
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        self.transport.lock().clock.stop();
        self.sleeper.wake();
        Ok(())
    }

    fn seek(&self, time_us: i64) -> Result<()> {
        self.ensure_open()?;
        validate_seek(&self.info, time_us)?;

        if let Some(session) = self.session.lock().as_mut() {
            session.seek(time_us)?;
        }
        let mut t = self.transport.lock();
        t.clock.seek(time_us);
        t.last_video_us = None;
        drop(t);

        debug!("FFmpeg seek to {} us", time_us);
        self.sleeper.wake();
        Ok(())
    }

    fn set_speed(&self, speed: f32) -> Result<()> {
        self.ensure_open()?;
        validate_speed(speed, MIN_SPEED, MAX_SPEED)?;
        self.transport.lock().clock.set_speed(speed);
        self.sleeper.wake();
        Ok(())
    }

    fn speed(&self) -> f32 {
        self.transport.lock().clock.speed()
    }

    fn set_view(&self, view: View) -> Result<()> {
        self.ensure_open()?;
        view.check_within(self.info.width, self.info.height)?;
        self.transport.lock().view = view;
        Ok(())
    }

    fn view(&self) -> View {
        self.transport.lock().view
    }

    fn current_time_us(&self) -> i64 {
        self.transport.lock().clock.now_us()
    }

    fn at_start(&self) -> bool {
        self.transport.lock().clock.at_start()
    }

    fn at_end(&self) -> bool {
        self.transport.lock().clock.at_end()
    }

    fn set_play_sound(&self, enabled: bool) {
        let mut t = self.transport.lock();
        if t.play_sound == enabled {
            return;
        }
        t.play_sound = enabled;
        let now = t.clock.now_us();
        drop(t);

        if enabled {
            // Audio decoded while muted was discarded; realign the demuxer
            if let Some(session) = self.session.lock().as_mut() {
                if let Err(e) = session.seek(now) {
                    warn!("Could not resume FFmpeg audio: {}", e);
                }
            }
            self.transport.lock().last_video_us = None;
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
            self.session.lock().take();
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

    #[test]
    fn test_missing_file_is_file_error() {
        let err = FfmpegBackend
            .open(Path::new("/nonexistent/movie.mp4"), ColorSpace::Srgb, AudioRequest::MONO_SIGNED)
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::FileError(_)));
    }

    #[test]
    fn test_unsupported_request_rejected_first() {
        let err = FfmpegBackend
            .open(Path::new("/nonexistent/movie.mp4"), ColorSpace::Cmyk, AudioRequest::MONO_SIGNED)
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_time_base_conversion() {
        assert_eq!(to_micros(90_000, ffmpeg::Rational::new(1, 90_000)), 1_000_000);
        assert_eq!(to_micros(441, ffmpeg::Rational::new(1, 44_100)), 10_000);
    }
}
