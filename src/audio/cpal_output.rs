//! CPAL audio sink
//!
//! Plays PCM on the default output device. The output thread converts each
//! unit to `f32`, maps it onto the device's channel count and rate and pushes
//! it into a ring buffer drained by the cpal callback.

use crate::audio::{pcm_to_f32, AudioSink, CancelToken, SinkFactory};
use crate::decoder::AudioFormat;
use crate::utils::error::{IntoStreamError, Result, StreamError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use log::{error, info};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Volume ramp duration for smooth transitions (in samples)
const VOLUME_RAMP_SAMPLES: usize = 512;

/// Ring buffer length as a fraction of one second of device audio
const RING_FRACTION: usize = 4;

/// Back-off while the ring buffer is full
const FULL_RING_BACKOFF: Duration = Duration::from_millis(2);

/// Volume control with smooth transitions
struct VolumeControl {
    current: f32,
    target: f32,
    ramp_samples: usize,
}

impl VolumeControl {
    fn new(volume: f32) -> Self {
        Self {
            current: volume,
            target: volume,
            ramp_samples: 0,
        }
    }

    /// Process volume for a sample with smooth ramping
    fn process(&mut self, sample: f32) -> f32 {
        if self.ramp_samples > 0 {
            let step = (self.target - self.current) / self.ramp_samples as f32;
            self.current += step;
            self.ramp_samples -= 1;

            if self.ramp_samples == 0 {
                self.current = self.target;
            }
        }

        sample * self.current
    }

    fn set_target(&mut self, volume: f32) {
        self.target = volume.clamp(0.0, 1.0);
        self.ramp_samples = VOLUME_RAMP_SAMPLES;
    }
}

/// State shared with the device callback
struct CallbackState {
    volume: Mutex<VolumeControl>,
    flush: AtomicBool,
    underruns: AtomicU64,
}

/// Sink on the default cpal output device
pub struct CpalSink {
    format: AudioFormat,
    stream: cpal::Stream,
    producer: HeapProd<f32>,
    shared: Arc<CallbackState>,
    device_channels: usize,
    /// Source frames advanced per device frame
    step: f64,
    /// Fractional source position carried between writes
    position: f64,
    decoded: Vec<f32>,
    mapped: Vec<f32>,
}

impl CpalSink {
    /// Open the default output device for `format`
    pub fn open(format: &AudioFormat) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| StreamError::Audio("No default output device found".to_string()))?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_string());

        let supported = device
            .default_output_config()
            .audio_err("Failed to get default output config")?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();
        let device_rate = config.sample_rate.0;
        let device_channels = config.channels as usize;

        let ring = HeapRb::<f32>::new((device_rate as usize * device_channels / RING_FRACTION).max(1024));
        let (producer, consumer) = ring.split();

        let shared = Arc::new(CallbackState {
            volume: Mutex::new(VolumeControl::new(1.0)),
            flush: AtomicBool::new(false),
            underruns: AtomicU64::new(0),
        });

        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, Arc::clone(&shared))?,
            SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, Arc::clone(&shared))?,
            SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, Arc::clone(&shared))?,
            other => {
                return Err(StreamError::Audio(format!(
                    "Unsupported device sample format: {}",
                    other
                )))
            }
        };
        stream.play().audio_err("Failed to start audio stream")?;

        info!(
            "Audio device '{}' opened at {} Hz, {} ch for {}",
            name, device_rate, device_channels, format
        );

        Ok(Self {
            format: *format,
            stream,
            producer,
            shared,
            device_channels,
            step: format.sample_rate as f64 / device_rate.max(1) as f64,
            position: 0.0,
            decoded: Vec::new(),
            mapped: Vec::new(),
        })
    }

    /// Callbacks that ran out of audio mid-buffer
    pub fn underruns(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn write(&mut self, pcm: &[u8], cancel: &CancelToken) -> Result<()> {
        self.decoded.clear();
        pcm_to_f32(&self.format, pcm, &mut self.decoded);

        self.mapped.clear();
        map_frames(
            &self.decoded,
            self.format.channels as usize,
            self.device_channels,
            self.step,
            &mut self.position,
            &mut self.mapped,
        );

        let mut offset = 0;
        while offset < self.mapped.len() {
            if cancel.is_cancelled() {
                return Err(StreamError::Interrupted("Audio write cancelled".to_string()));
            }
            let pushed = self.producer.push_slice(&self.mapped[offset..]);
            offset += pushed;
            if pushed == 0 && !cancel.sleep_for(FULL_RING_BACKOFF) {
                return Err(StreamError::Interrupted("Audio write cancelled".to_string()));
            }
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.stream.pause().audio_err("Failed to pause audio stream")
    }

    fn resume(&mut self) -> Result<()> {
        self.stream.play().audio_err("Failed to resume audio stream")
    }

    fn flush(&mut self) {
        self.position = 0.0;
        self.shared.flush.store(true, Ordering::Release);
    }

    fn set_volume(&mut self, volume: f32) {
        self.shared.volume.lock().set_target(volume);
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: HeapCons<f32>,
    shared: Arc<CallbackState>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if shared.flush.swap(false, Ordering::AcqRel) {
                    while consumer.try_pop().is_some() {}
                }

                let mut volume = shared.volume.lock();
                let mut missing = 0;
                for sample in data.iter_mut() {
                    let value = match consumer.try_pop() {
                        Some(s) => volume.process(s),
                        None => {
                            missing += 1;
                            0.0
                        }
                    };
                    *sample = T::from_sample(value);
                }
                if missing > 0 && missing < data.len() {
                    shared.underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            |err| error!("Audio stream error: {}", err),
            None,
        )
        .audio_err("Failed to build output stream")
}

/// Nearest-neighbour rate conversion and channel mapping
///
/// `position` is the fractional source frame where the next output frame
/// starts; it carries over between calls so chunk edges stay seamless.
fn map_frames(
    input: &[f32],
    source_channels: usize,
    device_channels: usize,
    step: f64,
    position: &mut f64,
    out: &mut Vec<f32>,
) {
    let source_channels = source_channels.max(1);
    let frames = input.len() / source_channels;
    if frames == 0 || step <= 0.0 {
        return;
    }

    while (*position as usize) < frames {
        let frame = &input[*position as usize * source_channels..][..source_channels];
        for ch in 0..device_channels {
            let sample = if source_channels == 1 {
                frame[0]
            } else if ch < source_channels {
                frame[ch]
            } else {
                0.0
            };
            out.push(sample);
        }
        *position += step;
    }
    *position -= frames as f64;
}

/// Opens a [`CpalSink`] on the default device
#[derive(Debug, Clone, Default)]
pub struct CpalSinkFactory;

impl CpalSinkFactory {
    pub fn new() -> Self {
        Self
    }
}

impl SinkFactory for CpalSinkFactory {
    fn name(&self) -> &str {
        "cpal"
    }

    fn create(&self, format: &AudioFormat) -> Result<Box<dyn AudioSink>> {
        Ok(Box::new(CpalSink::open(format)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_control() {
        let mut vol = VolumeControl::new(1.0);
        assert_eq!(vol.process(0.5), 0.5);

        vol.set_target(0.5);
        assert_eq!(vol.ramp_samples, VOLUME_RAMP_SAMPLES);

        let _ = vol.process(1.0);
        assert!(vol.current < 1.0);
        assert!(vol.current > 0.5);

        for _ in 0..VOLUME_RAMP_SAMPLES {
            vol.process(1.0);
        }
        assert_eq!(vol.current, 0.5);
    }

    #[test]
    fn test_map_mono_to_stereo() {
        let mut position = 0.0;
        let mut out = Vec::new();
        map_frames(&[0.1, 0.2, 0.3], 1, 2, 1.0, &mut position, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
        assert_eq!(position, 0.0);
    }

    #[test]
    fn test_map_upsamples_across_chunks() {
        // 22050 Hz into a 44100 Hz device
        let mut position = 0.0;
        let mut out = Vec::new();
        map_frames(&[0.1, 0.2], 1, 1, 0.5, &mut position, &mut out);
        map_frames(&[0.3], 1, 1, 0.5, &mut position, &mut out);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);
    }

    #[test]
    fn test_map_stereo_downsample() {
        let mut position = 0.0;
        let mut out = Vec::new();
        let input = [1.0, -1.0, 2.0, -2.0, 3.0, -3.0, 4.0, -4.0];
        map_frames(&input, 2, 2, 2.0, &mut position, &mut out);
        assert_eq!(out, vec![1.0, -1.0, 3.0, -3.0]);
    }
}
