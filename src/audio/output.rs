//! Audio output thread
//!
//! The audio stream reader offers units through [`AudioOutput::give_sample`],
//! which blocks while the queue already holds more than the buffering
//! horizon. A consumer thread dequeues units in order, writes them to the
//! sink, notifies the timestamp listeners and releases each unit.

use crate::audio::{
    pcm_duration_us, AudioSink, BoundedAudioQueue, CancelToken, NullSink, Popped, SinkFactory,
    SpectrumProcessor, TimestampListener,
};
use crate::decoder::{AudioFormat, DecodedUnit};
use crate::stream::StreamListener;
use crate::utils::config::DEFAULT_BUFFER_HORIZON_MS;
use crate::utils::error::{Result, StreamError};
use crate::utils::millis_to_micros;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Builder for [`AudioOutput`]
pub struct AudioOutputBuilder {
    horizon_us: i64,
    sink_factory: Arc<dyn SinkFactory>,
    listeners: Vec<Arc<dyn TimestampListener>>,
    spectrum: Option<SpectrumProcessor>,
    volume: f32,
    start_paused: bool,
}

impl AudioOutputBuilder {
    pub fn new(sink_factory: Arc<dyn SinkFactory>) -> Self {
        Self {
            horizon_us: millis_to_micros(DEFAULT_BUFFER_HORIZON_MS as i64),
            sink_factory,
            listeners: Vec::new(),
            spectrum: None,
            volume: 1.0,
            start_paused: true,
        }
    }

    /// Most audio the queue may hold ahead of the unit being played
    pub fn with_horizon_us(mut self, horizon_us: i64) -> Self {
        self.horizon_us = horizon_us;
        self
    }

    pub fn with_timestamp_listener(mut self, listener: Arc<dyn TimestampListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_spectrum(mut self, spectrum: SpectrumProcessor) -> Self {
        self.spectrum = Some(spectrum);
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume.clamp(0.0, 1.0);
        self
    }

    /// Play as soon as units arrive instead of waiting for `start_output`
    pub fn playing(mut self) -> Self {
        self.start_paused = false;
        self
    }

    /// Spawn the output thread for audio in `format`
    pub fn build(self, format: AudioFormat) -> Result<AudioOutput> {
        if self.horizon_us <= 0 {
            return Err(StreamError::Config(format!(
                "Audio buffer horizon must be positive, got {} us",
                self.horizon_us
            )));
        }

        let shared = Arc::new(Shared {
            queue: BoundedAudioQueue::new(self.horizon_us),
            control: Mutex::new(Control {
                paused: self.start_paused,
                flush: false,
                stopping: false,
            }),
            control_cv: Condvar::new(),
            cancel: CancelToken::new(),
            speed: AtomicU32::new(1.0f32.to_bits()),
            volume: AtomicU32::new(self.volume.to_bits()),
            format,
            listeners: self.listeners,
            spectrum: self.spectrum,
        });

        let handle = {
            let shared = Arc::clone(&shared);
            let factory = self.sink_factory;
            thread::Builder::new()
                .name("avsync-audio-output".to_string())
                .spawn(move || output_loop(shared, factory))
                .map_err(|e| StreamError::Internal(format!("Failed to spawn audio output: {}", e)))?
        };

        info!(
            "Audio output started for {} with {} ms horizon",
            format,
            self.horizon_us / 1000
        );
        Ok(AudioOutput {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }
}

struct Control {
    paused: bool,
    flush: bool,
    stopping: bool,
}

struct Shared {
    queue: BoundedAudioQueue,
    control: Mutex<Control>,
    control_cv: Condvar,
    /// Cuts short a sink write or unit delay in progress
    cancel: CancelToken,
    speed: AtomicU32,
    volume: AtomicU32,
    format: AudioFormat,
    listeners: Vec<Arc<dyn TimestampListener>>,
    spectrum: Option<SpectrumProcessor>,
}

impl Shared {
    fn speed(&self) -> f32 {
        f32::from_bits(self.speed.load(Ordering::Acquire))
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Acquire))
    }
}

/// Extra time each unit is held back at slow forward speeds
///
/// Below 1x a unit is followed by `floor(1 / speed) - 1` unit lengths of
/// silence, so audio keeps pace with slowed video.
pub fn unit_delay_us(speed: f32, unit_us: i64) -> i64 {
    if speed > 0.0 && speed < 1.0 {
        let factor = (1.0 / speed).floor() as i64 - 1;
        factor.max(0) * unit_us
    } else {
        0
    }
}

/// Duration-bounded audio playback on its own thread
pub struct AudioOutput {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioOutput {
    pub fn builder(sink_factory: Arc<dyn SinkFactory>) -> AudioOutputBuilder {
        AudioOutputBuilder::new(sink_factory)
    }

    pub fn format(&self) -> &AudioFormat {
        &self.shared.format
    }

    /// Queue a unit for playback, blocking while the queue is beyond its horizon
    ///
    /// Returns false when the unit was turned away (output closed or the
    /// producing reader is stopping); the unit is released either way.
    pub fn give_sample(&self, unit: DecodedUnit) -> bool {
        match self.shared.queue.push(unit) {
            Ok(()) => true,
            Err(unit) => {
                debug!("Audio unit at {} us turned away", unit.timestamp_us());
                unit.release();
                false
            }
        }
    }

    /// Resume playing queued audio
    pub fn start_output(&self) {
        let mut control = self.shared.control.lock();
        if control.paused {
            control.paused = false;
            debug!("Audio output resumed");
        }
        self.shared.control_cv.notify_all();
    }

    /// Pause after the unit in progress; queued audio is kept
    pub fn stop_output(&self) {
        let mut control = self.shared.control.lock();
        if !control.paused {
            control.paused = true;
            debug!("Audio output paused");
        }
        drop(control);
        self.shared.queue.interrupt_consumer();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.control.lock().paused
    }

    /// Drop every queued unit
    pub fn clear_input_buffer(&self) -> usize {
        let dropped = self.shared.queue.clear();
        debug!("Cleared {} queued audio units", dropped);
        dropped
    }

    /// Drop queued units stamped before `min_us`
    pub fn clear_input_buffer_before(&self, min_us: i64) -> usize {
        self.shared.queue.clear_before(min_us)
    }

    /// Keep queued audio from `min_us` on and join re-decoded audio to its end
    pub fn retain_from(&self, min_us: i64) -> usize {
        self.shared.queue.retain_from(min_us, &self.shared.format)
    }

    /// Discard audio already handed to the sink, including a write in progress
    pub fn clear_audio_buffer(&self) {
        let mut control = self.shared.control.lock();
        control.flush = true;
        self.shared.cancel.cancel();
        self.shared.control_cv.notify_all();
        drop(control);
        self.shared.queue.interrupt_consumer();
    }

    /// Speed used for the slow-motion unit delay
    pub fn set_playback_speed(&self, speed: f32) {
        self.shared.speed.store(speed.to_bits(), Ordering::Release);
    }

    pub fn playback_speed(&self) -> f32 {
        self.shared.speed()
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Every accepted unit has been played or dropped
    pub fn is_drained(&self) -> bool {
        self.shared.queue.is_drained()
    }

    /// Time between the oldest and newest queued unit
    pub fn queued_span_us(&self) -> i64 {
        self.shared.queue.span_us()
    }

    pub fn queue(&self) -> &BoundedAudioQueue {
        &self.shared.queue
    }

    /// Stop the output thread, drop unplayed audio and join
    ///
    /// Safe to call from any thread and more than once.
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return;
        };

        {
            let mut control = self.shared.control.lock();
            control.stopping = true;
            self.shared.cancel.cancel();
            self.shared.control_cv.notify_all();
        }
        self.shared.queue.close();

        if handle.join().is_err() {
            error!("Audio output thread panicked");
        }
        if let Some(spectrum) = &self.shared.spectrum {
            spectrum.close();
        }
        info!("Audio output closed");
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.close();
    }
}

impl StreamListener for AudioOutput {
    fn stream_started(&self) {
        self.shared.queue.resume_producers();
    }

    fn on_unit(&self, unit: DecodedUnit) {
        self.give_sample(unit);
    }

    fn interrupt(&self) {
        self.shared.queue.cancel_producers();
    }
}

fn open_sink(factory: &dyn SinkFactory, format: &AudioFormat) -> Box<dyn AudioSink> {
    match factory.create(format) {
        Ok(sink) => {
            debug!("Opened {} audio sink", factory.name());
            sink
        }
        Err(e) => {
            error!(
                "Failed to open {} audio sink, discarding audio instead: {}",
                factory.name(),
                e
            );
            Box::new(NullSink::new(*format, 1.0))
        }
    }
}

/// Wait out pause requests and apply flushes; false once stopping
fn await_control(shared: &Shared, sink: &mut dyn AudioSink, sink_paused: &mut bool) -> bool {
    let mut control = shared.control.lock();
    loop {
        if control.stopping {
            return false;
        }
        if control.flush {
            control.flush = false;
            shared.cancel.reset();
            sink.flush();
        }
        if !control.paused {
            break;
        }
        if !*sink_paused {
            if let Err(e) = sink.pause() {
                warn!("Failed to pause audio sink: {}", e);
            }
            *sink_paused = true;
        }
        shared.control_cv.wait(&mut control);
    }
    drop(control);

    if *sink_paused {
        if let Err(e) = sink.resume() {
            warn!("Failed to resume audio sink: {}", e);
        }
        *sink_paused = false;
    }
    true
}

fn play_unit(shared: &Shared, sink: &mut dyn AudioSink, unit: DecodedUnit) {
    if let Some(spectrum) = &shared.spectrum {
        spectrum.submit(unit.duplicate());
    }

    let unit_us = pcm_duration_us(&shared.format, unit.data().len());
    let delay_us = unit_delay_us(shared.speed(), unit_us);
    if delay_us > 0 {
        let deadline = Instant::now() + Duration::from_micros(delay_us as u64);
        if !shared.cancel.sleep_until(deadline) {
            unit.release();
            return;
        }
    }

    match sink.write(unit.data(), &shared.cancel) {
        Ok(()) => {
            let time_ms = unit.timestamp_ms();
            for listener in &shared.listeners {
                listener.notify_time(time_ms);
            }
        }
        Err(e) if e.is_interruption() => {
            debug!("Audio write at {} us cut short", unit.timestamp_us());
        }
        Err(e) => warn!("Audio write failed: {}", e),
    }
    unit.release();
}

fn output_loop(shared: Arc<Shared>, factory: Arc<dyn SinkFactory>) {
    let mut sink = open_sink(factory.as_ref(), &shared.format);
    let mut sink_paused = false;
    let mut applied_volume = f32::NAN;

    while await_control(&shared, sink.as_mut(), &mut sink_paused) {
        let volume = shared.volume();
        if volume != applied_volume {
            sink.set_volume(volume);
            applied_volume = volume;
        }

        match shared.queue.pop() {
            Popped::Unit(unit) => {
                play_unit(&shared, sink.as_mut(), unit);
                shared.queue.finish_unit();
            }
            Popped::Interrupted => continue,
            Popped::Closed => break,
        }
    }

    sink.flush();
    debug!("Audio output thread exiting");
}
