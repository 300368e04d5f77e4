//! Spectrum analysis of played audio
//!
//! Receives a copy of every unit the output thread plays and turns the first
//! channel into log-spaced power levels relative to the loudest level seen so
//! far. Analysis runs on its own thread behind an unbounded channel so a slow
//! FFT never holds up playback.

use crate::audio::pcm_to_f32;
use crate::decoder::{AudioFormat, DecodedUnit};
use crate::utils::error::{Result, StreamError};
use crossbeam_channel::{unbounded, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Gain applied to the FFT input, divided by the transform length
const INPUT_SCALE: f32 = 17.127;

/// Floor for power values before taking the logarithm
const MIN_POWER: f32 = 1e-20;

/// One analysed audio unit
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    /// Playback time of the analysed unit
    pub timestamp_ms: i64,

    /// Centre frequency of each band in Hz
    pub frequencies: Vec<f32>,

    /// Band power in dB relative to the running peak (never positive)
    pub levels_db: Vec<f32>,
}

/// Receives spectrum frames on the analysis thread
pub trait SpectrumListener: Send + Sync {
    fn on_spectrum(&self, frame: &SpectrumFrame);
}

impl<F> SpectrumListener for F
where
    F: Fn(&SpectrumFrame) + Send + Sync,
{
    fn on_spectrum(&self, frame: &SpectrumFrame) {
        self(frame)
    }
}

/// Pick `num_indices` log-spaced FFT bin indices between `min_freq` and `max_freq`
///
/// `max_freq` maps onto bin `num_samples / 2`. Indices are strictly
/// increasing: a collision is bumped to one past the previous index, and the
/// tail is pulled back so the last index never exceeds `num_samples / 2`.
pub fn find_indices(
    min_freq: f64,
    max_freq: f64,
    num_samples: usize,
    num_indices: usize,
) -> Result<Vec<usize>> {
    if num_indices <= 1 {
        return Err(StreamError::out_of_range(format!(
            "Need at least two bands, got {}",
            num_indices
        )));
    }
    if !min_freq.is_finite() || !max_freq.is_finite() || min_freq <= 0.0 || min_freq >= max_freq {
        return Err(StreamError::out_of_range(format!(
            "Invalid frequency range {} to {} Hz",
            min_freq, max_freq
        )));
    }
    let top = num_samples / 2;
    if num_indices > top + 1 {
        return Err(StreamError::out_of_range(format!(
            "{} bands do not fit in {} bins",
            num_indices,
            top + 1
        )));
    }

    let growth = (max_freq / min_freq).powf(1.0 / (num_indices - 1) as f64);
    let bin_width = max_freq / top as f64;

    let mut indices: Vec<usize> = Vec::with_capacity(num_indices);
    for i in 0..num_indices {
        let freq = min_freq * growth.powi(i as i32);
        let mut index = (freq / bin_width).round() as usize;
        if let Some(&prev) = indices.last() {
            if index <= prev {
                index = prev + 1;
            }
        }
        indices.push(index);
    }

    let mut limit = top;
    for index in indices.iter_mut().rev() {
        *index = (*index).min(limit);
        limit = index.saturating_sub(1);
    }

    Ok(indices)
}

/// FFT state for one transform length
struct Plan {
    len: usize,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    indices: Vec<usize>,
    frequencies: Vec<f32>,
}

/// Turns PCM into spectrum frames
struct Analyzer {
    format: AudioFormat,
    bands: usize,
    planner: FftPlanner<f32>,
    plan: Option<Plan>,
    peak_db: f32,
    samples: Vec<f32>,
    buffer: Vec<Complex<f32>>,
}

impl Analyzer {
    fn new(format: AudioFormat, bands: usize) -> Self {
        Self {
            format,
            bands,
            planner: FftPlanner::new(),
            plan: None,
            peak_db: f32::NEG_INFINITY,
            samples: Vec::new(),
            buffer: Vec::new(),
        }
    }

    fn plan_for(&mut self, len: usize) -> Result<&Plan> {
        if self.plan.as_ref().map(|p| p.len) != Some(len) {
            let step = self.format.sample_rate as f64 / len as f64;
            let bands = self.bands.min(len / 2 + 1);
            let indices = find_indices(step, self.format.sample_rate as f64 / 2.0, len, bands)?;
            let frequencies = indices.iter().map(|&i| ((i + 1) as f64 * step) as f32).collect();

            // Hann window
            let window = (0..len)
                .map(|i| {
                    0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (len - 1) as f32).cos())
                })
                .collect();

            debug!("Spectrum plan: {}-point FFT, {} bands, {:.1} Hz/bin", len, bands, step);
            self.plan = Some(Plan {
                len,
                fft: self.planner.plan_fft_forward(len),
                window,
                indices,
                frequencies,
            });
        }
        self.plan
            .as_ref()
            .ok_or_else(|| crate::internal_error!("Spectrum plan missing"))
    }

    /// Analyse one unit; `None` when it is too short to transform
    fn analyze(&mut self, pcm: &[u8], timestamp_ms: i64) -> Result<Option<SpectrumFrame>> {
        let channels = self.format.channels.max(1) as usize;
        let mut decoded = std::mem::take(&mut self.samples);
        decoded.clear();
        pcm_to_f32(&self.format, pcm, &mut decoded);

        // First channel only, in 16-bit sample units
        let first: Vec<f32> = decoded.iter().step_by(channels).map(|s| s * 32768.0).collect();
        self.samples = decoded;
        if first.len() < 4 {
            return Ok(None);
        }

        let len = first.len().next_power_of_two();
        let scaler = INPUT_SCALE / len as f32;
        let mut buffer = std::mem::take(&mut self.buffer);
        let (fft, indices, frequencies) = {
            let plan = self.plan_for(len)?;
            buffer.clear();
            buffer.extend((0..len).map(|i| {
                let sample = first.get(i).copied().unwrap_or(0.0);
                Complex::new(sample * scaler * plan.window[i], 0.0)
            }));
            (Arc::clone(&plan.fft), plan.indices.clone(), plan.frequencies.clone())
        };
        fft.process(&mut buffer);

        let power_db: Vec<f32> = buffer[..=len / 2]
            .iter()
            .map(|c| 10.0 * c.norm_sqr().max(MIN_POWER).log10())
            .collect();
        self.buffer = buffer;

        let loudest = power_db.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        self.peak_db = self.peak_db.max(loudest);

        let levels_db = indices
            .iter()
            .map(|&i| (power_db[i] - self.peak_db).min(0.0))
            .collect();

        Ok(Some(SpectrumFrame {
            timestamp_ms,
            frequencies,
            levels_db,
        }))
    }
}

/// Background spectrum analysis fed with copies of played units
pub struct SpectrumProcessor {
    tx: Mutex<Option<Sender<DecodedUnit>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SpectrumProcessor {
    /// Spawn the analysis thread
    pub fn start(
        format: AudioFormat,
        bands: usize,
        listeners: Vec<Arc<dyn SpectrumListener>>,
    ) -> Result<Self> {
        if bands < 2 {
            return Err(StreamError::Config(format!(
                "Spectrum needs at least two bands, got {}",
                bands
            )));
        }

        let (tx, rx) = unbounded::<DecodedUnit>();
        let handle = thread::Builder::new()
            .name("avsync-spectrum".to_string())
            .spawn(move || {
                let mut analyzer = Analyzer::new(format, bands);
                for unit in rx.iter() {
                    match analyzer.analyze(unit.data(), unit.timestamp_ms()) {
                        Ok(Some(frame)) => {
                            for listener in &listeners {
                                listener.on_spectrum(&frame);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => debug!("Skipping spectrum for unit at {} ms: {}", unit.timestamp_ms(), e),
                    }
                    unit.release();
                }
                debug!("Spectrum thread exiting");
            })
            .map_err(|e| StreamError::Internal(format!("Failed to spawn spectrum thread: {}", e)))?;

        info!("Spectrum processor started with {} bands", bands);
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a unit for analysis; dropped once the processor is closed
    pub fn submit(&self, unit: DecodedUnit) {
        let rejected = match self.tx.lock().as_ref() {
            Some(tx) => tx.send(unit).err().map(|e| e.into_inner()),
            None => Some(unit),
        };
        if let Some(unit) = rejected {
            unit.release();
        }
    }

    /// Stop accepting units, finish the backlog and join the thread
    pub fn close(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("Spectrum thread panicked");
            }
        }
    }
}

impl Drop for SpectrumProcessor {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{AudioRequest, BufferPool, Track};
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_find_indices_audio_range() {
        let indices = find_indices(20.0, 20000.0, 1024, 30).unwrap();
        assert_eq!(indices.len(), 30);
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
        assert!(*indices.last().unwrap() <= 512);
        assert_eq!(indices[0], 1);
        assert_eq!(*indices.last().unwrap(), 512);
    }

    #[test]
    fn test_find_indices_rejects_bad_input() {
        assert!(find_indices(20.0, 20000.0, 1024, 1).is_err());
        assert!(find_indices(20000.0, 20.0, 1024, 30).is_err());
        assert!(find_indices(0.0, 20000.0, 1024, 30).is_err());
        assert!(find_indices(20.0, 20000.0, 16, 30).is_err());
    }

    #[test]
    fn test_find_indices_dense_request() {
        // Every bin requested
        let indices = find_indices(10.0, 1000.0, 16, 9).unwrap();
        assert_eq!(indices, (0..=8).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn prop_find_indices_strictly_increasing(
            min_freq in 1.0f64..1000.0,
            ratio in 1.5f64..1000.0,
            exp in 4u32..13,
            wanted in 2usize..64,
        ) {
            let num_samples = 1usize << exp;
            let num_indices = wanted.min(num_samples / 2 + 1);
            let indices = find_indices(min_freq, min_freq * ratio, num_samples, num_indices).unwrap();
            prop_assert_eq!(indices.len(), num_indices);
            prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
            prop_assert!(*indices.last().unwrap() <= num_samples / 2);
        }
    }

    fn tone(format: &AudioFormat, freq: f32, frames: usize) -> Vec<u8> {
        (0..frames)
            .flat_map(|i| {
                let t = i as f32 / format.sample_rate as f32;
                let v = (2.0 * std::f32::consts::PI * freq * t).sin() * 16000.0;
                (v as i16).to_le_bytes()
            })
            .collect()
    }

    #[test]
    fn test_tone_peaks_near_its_band() {
        let format = AudioRequest::MONO_SIGNED.with_rate(22050);
        let mut analyzer = Analyzer::new(format, 30);
        let frame = analyzer
            .analyze(&tone(&format, 1000.0, 4096), 250)
            .unwrap()
            .unwrap();

        assert_eq!(frame.timestamp_ms, 250);
        assert_eq!(frame.levels_db.len(), 30);
        assert!(frame.levels_db.iter().all(|&l| l <= 0.0));

        let loudest = frame
            .levels_db
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| frame.frequencies[i])
            .unwrap();
        assert!((600.0..1600.0).contains(&loudest), "peak at {} Hz", loudest);
    }

    #[test]
    fn test_processor_delivers_frames() {
        let format = AudioRequest::MONO_SIGNED.with_rate(22050);
        let (tx, rx) = crossbeam_channel::unbounded();
        let listener: Arc<dyn SpectrumListener> = Arc::new(move |frame: &SpectrumFrame| {
            let _ = tx.send(frame.timestamp_ms);
        });
        let processor = SpectrumProcessor::start(format, 16, vec![listener]).unwrap();

        let pool = BufferPool::new(Track::Audio, 8192);
        let mut unit = pool.acquire();
        let pcm = tone(&format, 440.0, 4096);
        unit.buffer_mut()[..pcm.len()].copy_from_slice(&pcm);
        unit.set_filled(pcm.len(), 1_500_000, 4096);
        processor.submit(unit);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1500);
        processor.close();
        processor.submit(pool.acquire());
        assert_eq!(pool.outstanding(), 0);
    }
}
