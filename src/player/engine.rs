//! Playback engine
//!
//! The engine thread takes one command at a time off the command queue and
//! is the only caller of transport operations on the decoder. Reader
//! notices (boundaries, decode faults) and a periodic tick are multiplexed
//! with the commands so end of stream is detected without a second thread.
//!
//! Resting states are `Idle` and `Playing`. Every command starts from one of
//! them, may pass through a transient state, and settles again; a failed
//! transport call always settles in `Idle` with the readers stopped.

use crate::audio::{
    sink_factory_for, AudioOutput, SinkFactory, SpectrumListener, SpectrumProcessor,
    TimestampListener,
};
use crate::decoder::{
    backend_from_name, validate_seek, validate_speed, AudioFormat, AudioRequest, ColorSpace,
    DecodedUnit, DecoderBackend, MediaDecoder, MediaInfo, View,
};
use crate::player::{
    CommandQueue, EngineEvent, EngineEventHandler, PlaybackState, RenderSink, TransportCommand,
    ViewerSettings,
};
use crate::stream::{ReaderNotice, StreamListener, StreamProvider};
use crate::utils::config::Config;
use crate::utils::error::{Result, StreamError};
use crate::utils::{micros_to_millis, millis_to_micros};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tick while nothing is playing
const IDLE_TICK: Duration = Duration::from_millis(250);

/// Audio is delivered only for forward speeds up to 1x
fn sound_enabled(speed: f32) -> bool {
    speed > 0.0 && speed <= 1.0
}

/// Hands video frames and their times to the render sinks
struct FrameForwarder {
    sinks: Vec<Arc<dyn RenderSink>>,
    channels: usize,
    view: Mutex<View>,
    offset_ms: i64,
}

impl StreamListener for FrameForwarder {
    fn on_unit(&self, unit: DecodedUnit) {
        let view = *self.view.lock();
        let time_ms = unit.timestamp_ms() + self.offset_ms;
        for sink in &self.sinks {
            sink.on_frame_ready(unit.data(), view.width, view.height, self.channels);
            sink.on_position_changed(time_ms);
        }
        unit.release();
    }
}

/// Reports played audio times to the render sinks
struct PositionForwarder {
    sinks: Vec<Arc<dyn RenderSink>>,
    offset_ms: i64,
}

impl TimestampListener for PositionForwarder {
    fn notify_time(&self, time_ms: i64) {
        for sink in &self.sinks {
            sink.on_position_changed(time_ms + self.offset_ms);
        }
    }
}

/// Everything belonging to one open decoder
struct Session {
    decoder: Arc<dyn MediaDecoder>,
    provider: StreamProvider,
    audio: Option<Arc<AudioOutput>>,
    frames: Option<Arc<FrameForwarder>>,
    info: MediaInfo,
    /// A reader died on a decode fault; only a fresh `Init` recovers
    faulted: bool,
}

impl Session {
    fn close(mut self) {
        self.provider.close();
        if let Some(audio) = &self.audio {
            audio.close();
        }
        self.decoder.close();
    }
}

/// State readable from the engine handle
struct EngineShared {
    state: Mutex<PlaybackState>,
    speed: Mutex<f32>,
    info: Mutex<Option<MediaInfo>>,
    decoder: Mutex<Option<Arc<dyn MediaDecoder>>>,
    audio: Mutex<Option<Arc<AudioOutput>>>,
    min_speed: f32,
    max_speed: f32,
    offset_ms: i64,
}

/// Builder for [`PlaybackEngine`]
pub struct PlaybackEngineBuilder {
    source: PathBuf,
    backend: Option<Arc<dyn DecoderBackend>>,
    config: Config,
    settings: ViewerSettings,
    sink_factory: Option<Arc<dyn SinkFactory>>,
    render_sinks: Vec<Arc<dyn RenderSink>>,
    spectrum_listeners: Vec<Arc<dyn SpectrumListener>>,
    handlers: Vec<Arc<dyn EngineEventHandler>>,
}

impl PlaybackEngineBuilder {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            backend: None,
            config: Config::default(),
            settings: ViewerSettings::default(),
            sink_factory: None,
            render_sinks: Vec::new(),
            spectrum_listeners: Vec::new(),
            handlers: Vec::new(),
        }
    }

    /// Decoder backend; defaults to the one named in the configuration
    pub fn with_backend(mut self, backend: Arc<dyn DecoderBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_settings(mut self, settings: ViewerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Audio sink factory; defaults to the configured output
    pub fn with_sink_factory(mut self, factory: Arc<dyn SinkFactory>) -> Self {
        self.sink_factory = Some(factory);
        self
    }

    pub fn with_render_sink(mut self, sink: Arc<dyn RenderSink>) -> Self {
        self.render_sinks.push(sink);
        self
    }

    pub fn with_spectrum_listener(mut self, listener: Arc<dyn SpectrumListener>) -> Self {
        self.spectrum_listeners.push(listener);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EngineEventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Create the engine with `Init` already queued; call
    /// [`PlaybackEngine::start`] to run it
    pub fn build(self) -> Result<PlaybackEngine> {
        self.config.validate()?;
        let backend = match self.backend {
            Some(backend) => backend,
            None => backend_from_name(&self.config.decoder.backend)?,
        };
        let color_space: ColorSpace = self.config.decoder.color_space.parse()?;
        let audio_request: AudioRequest = self.config.decoder.audio.parse()?;
        let sink_factory = self
            .sink_factory
            .unwrap_or_else(|| sink_factory_for(&self.config.audio));

        let shared = Arc::new(EngineShared {
            state: Mutex::new(PlaybackState::Initializing),
            speed: Mutex::new(1.0),
            info: Mutex::new(None),
            decoder: Mutex::new(None),
            audio: Mutex::new(None),
            min_speed: self.config.engine.min_speed,
            max_speed: self.config.engine.max_speed,
            offset_ms: self.settings.offset_ms,
        });

        let (commands_tx, commands) = CommandQueue::channel();
        commands_tx
            .send(TransportCommand::Init)
            .map_err(|_| crate::internal_error!("Command queue closed"))?;
        let (notices_tx, notices_rx) = unbounded();

        let worker = EngineWorker {
            source: self.source,
            backend,
            color_space,
            audio_request,
            config: self.config,
            settings: self.settings,
            sink_factory,
            render_sinks: self.render_sinks,
            spectrum_listeners: self.spectrum_listeners,
            handlers: self.handlers,
            shared: Arc::clone(&shared),
            commands,
            notices_tx,
            notices_rx,
            session: None,
            state: PlaybackState::Initializing,
            speed: 1.0,
        };

        Ok(PlaybackEngine {
            commands: commands_tx,
            shared,
            worker: Mutex::new(Some(worker)),
            handle: Mutex::new(None),
        })
    }
}

/// Handle to the engine thread
pub struct PlaybackEngine {
    commands: Sender<TransportCommand>,
    shared: Arc<EngineShared>,
    worker: Mutex<Option<EngineWorker>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn builder(source: impl Into<PathBuf>) -> PlaybackEngineBuilder {
        PlaybackEngineBuilder::new(source)
    }

    /// Spawn the engine thread; later calls do nothing
    pub fn start(&self) -> Result<()> {
        let Some(worker) = self.worker.lock().take() else {
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name("avsync-engine".to_string())
            .spawn(move || worker.run())
            .map_err(|e| StreamError::Internal(format!("Failed to spawn engine thread: {}", e)))?;
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn send(&self, command: TransportCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| StreamError::InvalidState("Playback engine is closed".to_string()))
    }

    /// Open the decoder again, e.g. after a decode fault
    pub fn init(&self) -> Result<()> {
        self.send(TransportCommand::Init)
    }

    pub fn play(&self) -> Result<()> {
        self.send(TransportCommand::Play)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(TransportCommand::Stop)
    }

    /// Seek to `time_ms`; rejected up front once the stream bounds are known
    pub fn seek(&self, time_ms: i64) -> Result<()> {
        if let Some(info) = self.shared.info.lock().as_ref() {
            validate_seek(info, millis_to_micros(time_ms - self.shared.offset_ms))?;
        }
        self.send(TransportCommand::Seek(time_ms))
    }

    /// Change playback speed; zero and speeds beyond the bounds are rejected
    pub fn adjust_speed(&self, rate: f32) -> Result<()> {
        validate_speed(rate, self.shared.min_speed, self.shared.max_speed)?;
        self.send(TransportCommand::AdjustSpeed(rate))
    }

    pub fn step(&self) -> Result<()> {
        self.send(TransportCommand::Step)
    }

    pub fn set_view(&self, view: View) -> Result<()> {
        if let Some(info) = self.shared.info.lock().as_ref() {
            view.check_within(info.width, info.height)?;
        }
        self.send(TransportCommand::SetView(view))
    }

    pub fn reset(&self) -> Result<()> {
        self.send(TransportCommand::Reset)
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.lock()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn speed(&self) -> f32 {
        *self.shared.speed.lock()
    }

    /// Transport position including the viewer offset
    pub fn current_time_ms(&self) -> i64 {
        let media_ms = self
            .shared
            .decoder
            .lock()
            .as_ref()
            .map(|decoder| micros_to_millis(decoder.current_time_us()))
            .unwrap_or(0);
        media_ms + self.shared.offset_ms
    }

    pub fn media_info(&self) -> Option<MediaInfo> {
        self.shared.info.lock().clone()
    }

    /// Audio queued ahead of the unit being played
    /// Every audio unit handed to the output has been played
    ///
    /// True when the session has no audio output.
    pub fn audio_drained(&self) -> bool {
        self.shared
            .audio
            .lock()
            .as_ref()
            .map_or(true, |audio| audio.is_drained())
    }

    pub fn queued_audio_span(&self) -> Duration {
        let span_us = self
            .shared
            .audio
            .lock()
            .as_ref()
            .map(|audio| audio.queued_span_us())
            .unwrap_or(0);
        Duration::from_micros(span_us.max(0) as u64)
    }

    /// Shut the engine down, closing the session and joining every thread
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => {
                let _ = self.send(TransportCommand::Shutdown);
                if handle.join().is_err() {
                    error!("Engine thread panicked");
                }
            }
            None => {
                // Never started: nothing was opened
                self.worker.lock().take();
            }
        }
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Engine-thread side of the engine
struct EngineWorker {
    source: PathBuf,
    backend: Arc<dyn DecoderBackend>,
    color_space: ColorSpace,
    audio_request: AudioRequest,
    config: Config,
    settings: ViewerSettings,
    sink_factory: Arc<dyn SinkFactory>,
    render_sinks: Vec<Arc<dyn RenderSink>>,
    spectrum_listeners: Vec<Arc<dyn SpectrumListener>>,
    handlers: Vec<Arc<dyn EngineEventHandler>>,
    shared: Arc<EngineShared>,
    commands: CommandQueue,
    notices_tx: Sender<ReaderNotice>,
    notices_rx: Receiver<ReaderNotice>,
    session: Option<Session>,
    state: PlaybackState,
    speed: f32,
}

impl EngineWorker {
    fn run(mut self) {
        info!("Playback engine started for {}", self.source.display());
        loop {
            let command = match self.commands.take_stashed() {
                Some(command) => Some(command),
                None => self.wait_for_command(),
            };
            if let Some(command) = command {
                let command = self.commands.coalesce(command);
                if !self.execute(command) {
                    break;
                }
            }
        }
        info!("Playback engine stopped");
    }

    fn wait_for_command(&mut self) -> Option<TransportCommand> {
        let tick = if self.state == PlaybackState::Playing {
            self.config.engine.idle_poll()
        } else {
            IDLE_TICK
        };
        let commands = self.commands.receiver().clone();
        let notices = self.notices_rx.clone();

        select! {
            recv(commands) -> command => Some(command.unwrap_or(TransportCommand::Shutdown)),
            recv(notices) -> notice => {
                if let Ok(notice) = notice {
                    self.on_notice(notice);
                }
                None
            }
            default(tick) => {
                self.check_end();
                None
            }
        }
    }

    /// Run one command; false once the loop should end
    fn execute(&mut self, command: TransportCommand) -> bool {
        debug!("Executing {:?} while {:?}", command, self.state);
        let result = match &command {
            TransportCommand::Init => self.initialize(),
            TransportCommand::Play => self.play(),
            TransportCommand::Stop => self.stop(),
            TransportCommand::Seek(time_ms) => self.seek(*time_ms),
            TransportCommand::AdjustSpeed(rate) => self.adjust_speed(*rate),
            TransportCommand::Step => self.step(),
            TransportCommand::SetView(view) => self.set_view(*view),
            TransportCommand::Reset => self.reset(),
            TransportCommand::Shutdown => {
                self.shutdown();
                return false;
            }
        };

        if let Err(e) = result {
            self.fail(&command, e);
        }
        true
    }

    fn fail(&mut self, command: &TransportCommand, e: StreamError) {
        if e.is_interruption() {
            debug!("{:?} interrupted: {}", command, e);
        } else {
            error!("{:?} failed: {}", command, e);
            self.emit(EngineEvent::Error(e.to_string()));
        }

        // Rejected requests leave the engine where it was
        let rejected = matches!(e, StreamError::OutOfRange(_) | StreamError::InvalidState(_));
        if rejected && self.state.is_resting() {
            return;
        }
        self.recover();
    }

    /// Stop everything and settle in `Idle`
    fn recover(&mut self) {
        if let Err(e) = self.halt_playback() {
            warn!("Failed to stop transport while recovering: {}", e);
        }
        self.set_state(PlaybackState::Idle);
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        debug!("Engine state {:?} -> {:?}", self.state, state);
        self.state = state;
        *self.shared.state.lock() = state;
        self.emit(EngineEvent::StateChanged(state));
    }

    fn emit(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle_event(&event);
        }
    }

    fn session(&mut self) -> Result<&mut Session> {
        match self.session.as_mut() {
            Some(session) if session.faulted => Err(StreamError::InvalidState(
                "Decode session faulted; reinitialize".to_string(),
            )),
            Some(session) => Ok(session),
            None => Err(StreamError::InvalidState("Engine not initialized".to_string())),
        }
    }

    fn initialize(&mut self) -> Result<()> {
        match self.session.as_ref().map(|session| session.faulted) {
            Some(false) => {
                debug!("Engine already initialized");
                return Ok(());
            }
            Some(true) => self.close_session(),
            None => {}
        }

        self.set_state(PlaybackState::Initializing);
        let decoder = self
            .backend
            .open(&self.source, self.color_space, self.audio_request)?;
        let session = match self.wire_session(Arc::clone(&decoder)) {
            Ok(session) => session,
            Err(e) => {
                decoder.close();
                return Err(e);
            }
        };

        let info = session.info.clone();
        let display_size = self.settings.display_size(info.width, info.height);
        *self.shared.info.lock() = Some(info.clone());
        *self.shared.decoder.lock() = Some(Arc::clone(&session.decoder));
        *self.shared.audio.lock() = session.audio.clone();
        self.session = Some(session);

        info!(
            "Opened {} ({}x{}, {:.2} s, audio: {})",
            info.source,
            info.width,
            info.height,
            info.duration().as_secs_f64(),
            info.audio
                .map(|format| format.to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        self.emit(EngineEvent::MediaOpened { info, display_size });
        self.set_state(PlaybackState::Idle);
        Ok(())
    }

    /// Build the readers and audio output around a freshly opened decoder
    fn wire_session(&self, decoder: Arc<dyn MediaDecoder>) -> Result<Session> {
        let info = decoder.info().clone();
        decoder.set_speed(self.speed)?;
        decoder.set_play_sound(sound_enabled(self.speed));

        let audio = match info.audio {
            Some(format) => Some(Arc::new(self.build_audio(format)?)),
            None => None,
        };
        let frames = (info.has_video() && !self.render_sinks.is_empty()).then(|| {
            Arc::new(FrameForwarder {
                sinks: self.render_sinks.clone(),
                channels: info.color_channels,
                view: Mutex::new(decoder.view()),
                offset_ms: self.settings.offset_ms,
            })
        });

        let mut builder = StreamProvider::builder()
            .with_chunk_size(self.config.audio.chunk_size)
            .with_idle_poll(self.config.engine.idle_poll())
            .with_notices(self.notices_tx.clone());
        if let Some(audio) = &audio {
            builder = builder.with_audio_listener(Arc::clone(audio) as Arc<dyn StreamListener>);
        }
        if let Some(frames) = &frames {
            builder = builder.with_video_listener(Arc::clone(frames) as Arc<dyn StreamListener>);
        }
        let provider = builder.build(Arc::clone(&decoder))?;

        Ok(Session {
            decoder,
            provider,
            audio,
            frames,
            info,
            faulted: false,
        })
    }

    fn build_audio(&self, format: AudioFormat) -> Result<AudioOutput> {
        let mut builder = AudioOutput::builder(Arc::clone(&self.sink_factory))
            .with_horizon_us(self.config.audio.buffer_horizon_us())
            .with_volume(self.config.audio.volume * self.settings.gain());

        if !self.render_sinks.is_empty() {
            builder = builder.with_timestamp_listener(Arc::new(PositionForwarder {
                sinks: self.render_sinks.clone(),
                offset_ms: self.settings.offset_ms,
            }));
        }
        if self.config.spectrum.enabled {
            let spectrum = SpectrumProcessor::start(
                format,
                self.config.spectrum.bands,
                self.spectrum_listeners.clone(),
            )?;
            builder = builder.with_spectrum(spectrum);
        }
        builder.build(format)
    }

    /// Start the clock, the output and the readers
    fn start_playback(&mut self) -> Result<()> {
        let speed = self.speed;
        let visible = self.settings.visible;
        let session = self.session()?;

        session.decoder.set_play_sound(sound_enabled(speed));
        if let Some(audio) = &session.audio {
            audio.set_playback_speed(speed);
            audio.start_output();
        }
        session.decoder.start()?;
        session.provider.start_audio()?;
        if visible {
            session.provider.start_video()?;
        }
        Ok(())
    }

    /// Stop the readers, then the clock, then the output
    fn halt_playback(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.provider.stop();
        session.decoder.stop()?;
        if let Some(audio) = &session.audio {
            audio.stop_output();
        }
        Ok(())
    }

    /// Whether the transport sits at the edge it is moving towards
    fn at_boundary(&self) -> bool {
        match &self.session {
            Some(session) if self.speed > 0.0 => session.decoder.at_end(),
            Some(session) => session.decoder.at_start(),
            None => false,
        }
    }

    fn play(&mut self) -> Result<()> {
        self.session()?;
        if self.state == PlaybackState::Playing {
            return Ok(());
        }
        if self.at_boundary() {
            info!("Nothing left to play in this direction");
            self.emit(EngineEvent::EndOfStream);
            return Ok(());
        }

        self.start_playback()?;
        self.set_state(PlaybackState::Playing);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.session()?;
        if self.state != PlaybackState::Playing {
            return Ok(());
        }
        self.set_state(PlaybackState::Stopping);
        self.halt_playback()?;
        self.set_state(PlaybackState::Idle);
        Ok(())
    }

    fn seek(&mut self, time_ms: i64) -> Result<()> {
        let target_us = millis_to_micros(time_ms - self.settings.offset_ms);
        validate_seek(&self.session()?.info, target_us)?;

        let was_playing = self.state == PlaybackState::Playing;
        let forward_play = self.speed > 0.0;
        self.set_state(PlaybackState::Seeking);

        let session = self.session()?;
        let current_us = session.decoder.current_time_us();
        session.provider.stop();
        session.decoder.seek(target_us)?;

        if let Some(audio) = &session.audio {
            if target_us >= current_us && forward_play {
                let dropped = audio.retain_from(target_us);
                debug!("Forward seek kept queued audio, dropped {} units", dropped);
            } else {
                audio.clear_input_buffer();
                audio.clear_audio_buffer();
            }
        }

        debug!("Seeked from {} us to {} us", current_us, target_us);
        self.emit(EngineEvent::Seeked(time_ms));
        self.resume_or_idle(was_playing)
    }

    fn resume_or_idle(&mut self, was_playing: bool) -> Result<()> {
        if was_playing {
            self.start_playback()?;
            self.set_state(PlaybackState::Playing);
        } else {
            self.set_state(PlaybackState::Idle);
        }
        Ok(())
    }

    fn adjust_speed(&mut self, rate: f32) -> Result<()> {
        validate_speed(rate, self.config.engine.min_speed, self.config.engine.max_speed)?;

        if self.session.is_none() {
            // Applied when the decoder opens
            self.speed = rate;
            *self.shared.speed.lock() = rate;
            self.emit(EngineEvent::SpeedChanged(rate));
            return Ok(());
        }

        let was_playing = self.state == PlaybackState::Playing;
        self.set_state(PlaybackState::AdjustingSpeed);

        let session = self.session()?;
        let position_us = session.decoder.current_time_us();
        if was_playing {
            session.provider.stop();
        }
        session.decoder.set_speed(rate)?;
        session.decoder.set_play_sound(sound_enabled(rate));
        if let Some(audio) = &session.audio {
            audio.set_playback_speed(rate);
        }

        self.speed = rate;
        *self.shared.speed.lock() = rate;
        info!("Playback speed set to {}x", rate);
        self.emit(EngineEvent::SpeedChanged(rate));

        if was_playing {
            // Seek in place so the new rate takes effect without a stall
            let session = self.session()?;
            session.decoder.seek(position_us)?;
            if let Some(audio) = &session.audio {
                audio.clear_input_buffer();
                audio.clear_audio_buffer();
            }
        }
        self.resume_or_idle(was_playing)
    }

    fn step(&mut self) -> Result<()> {
        if self.state == PlaybackState::Playing {
            return Err(StreamError::InvalidState(
                "Cannot step while playing".to_string(),
            ));
        }
        let stepped = self.session()?.provider.next_image_frame()?;
        if !stepped {
            self.emit(EngineEvent::EndOfStream);
        }
        Ok(())
    }

    fn set_view(&mut self, view: View) -> Result<()> {
        let info = &self.session()?.info;
        view.check_within(info.width, info.height)?;

        // The decoder must not be reading while its view changes
        let was_playing = self.state == PlaybackState::Playing;
        if was_playing {
            self.halt_playback()?;
        }

        let session = self.session()?;
        session.decoder.set_view(view)?;
        if let Some(frames) = &session.frames {
            *frames.view.lock() = view;
        }
        debug!("View set to {:?}", view);

        if was_playing {
            self.start_playback()?;
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.session()?;
        let was_playing = self.state == PlaybackState::Playing;
        self.set_state(PlaybackState::Seeking);

        let session = self.session()?;
        session.provider.stop();
        session.decoder.reset()?;
        if let Some(audio) = &session.audio {
            audio.clear_input_buffer();
            audio.clear_audio_buffer();
        }
        let start_ms = micros_to_millis(session.info.start_time_us) + self.settings.offset_ms;

        self.emit(EngineEvent::Seeked(start_ms));
        self.resume_or_idle(was_playing)
    }

    fn on_notice(&mut self, notice: ReaderNotice) {
        match notice {
            ReaderNotice::Ended(track) => {
                debug!("{} reader reached a boundary", track);
                self.check_end();
            }
            ReaderNotice::Fault(track, message) => {
                error!("{} reader failed: {}", track, message);
                if let Some(session) = self.session.as_mut() {
                    session.faulted = true;
                }
                self.emit(EngineEvent::Error(format!("{} decode fault: {}", track, message)));
                self.recover();
                self.emit(EngineEvent::StreamClosed);
            }
        }
    }

    /// Settle in `Idle` once the transport reaches the edge it is heading for
    ///
    /// Queued audio is left to play out.
    fn check_end(&mut self) {
        if self.state != PlaybackState::Playing || !self.at_boundary() {
            return;
        }
        info!("End of stream reached");
        if let Some(session) = self.session.as_mut() {
            session.provider.stop();
            if let Err(e) = session.decoder.stop() {
                warn!("Failed to stop transport at end of stream: {}", e);
            }
        }
        self.set_state(PlaybackState::Idle);
        self.emit(EngineEvent::EndOfStream);
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            *self.shared.decoder.lock() = None;
            *self.shared.audio.lock() = None;
            session.close();
            self.emit(EngineEvent::StreamClosed);
        }
    }

    fn shutdown(&mut self) {
        if self.state == PlaybackState::Playing {
            self.set_state(PlaybackState::Stopping);
        }
        self.close_session();
        self.set_state(PlaybackState::Idle);
    }
}
