//! Per-track reader thread
//!
//! The reader polls the decoder for its track, reads into a pooled buffer
//! and hands the unit to every listener. When no data is available it waits
//! on its stop channel for the idle poll interval instead of spinning, so a
//! stop request is observed immediately.

use crate::decoder::{BufferPool, DecodedUnit, MediaDecoder, ReadStatus, Track};
use crate::stream::{ReaderNotice, StreamListener};
use crate::utils::error::{Result, StreamError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Reader thread for one track
pub struct StreamReader {
    track: Track,
    decoder: Arc<dyn MediaDecoder>,
    listeners: Arc<[Arc<dyn StreamListener>]>,
    pool: BufferPool,
    idle_poll: Duration,
    notices: Option<Sender<ReaderNotice>>,
    running: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamReader {
    pub fn new(
        track: Track,
        decoder: Arc<dyn MediaDecoder>,
        listeners: Vec<Arc<dyn StreamListener>>,
        pool: BufferPool,
        idle_poll: Duration,
        notices: Option<Sender<ReaderNotice>>,
    ) -> Self {
        Self {
            track,
            decoder,
            listeners: listeners.into(),
            pool,
            idle_poll,
            notices,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx: None,
            handle: None,
        }
    }

    pub fn track(&self) -> Track {
        self.track
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    pub fn listeners(&self) -> &[Arc<dyn StreamListener>] {
        &self.listeners
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Spawn the reader thread; no-op while it is already running
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        self.join();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        self.running.store(true, Ordering::SeqCst);

        let track = self.track;
        let decoder = Arc::clone(&self.decoder);
        let listeners = Arc::clone(&self.listeners);
        let pool = self.pool.clone();
        let idle_poll = self.idle_poll;
        let notices = self.notices.clone();
        let running = Arc::clone(&self.running);

        let handle = thread::Builder::new()
            .name(format!("avsync-reader-{}", track))
            .spawn(move || {
                Self::read_loop(track, decoder, listeners, pool, idle_poll, notices, running, stop_rx);
            })
            .map_err(|e| StreamError::Internal(format!("Failed to spawn {} reader: {}", track, e)))?;

        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the reader thread and wait for it to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Disconnecting the channel ends any idle wait
        self.stop_tx.take();
        self.decoder.wake();
        for listener in self.listeners.iter() {
            listener.interrupt();
        }
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{} reader thread panicked", self.track);
            }
        }
    }

    /// Hand a unit to every listener; the last one receives the original
    pub fn publish(listeners: &[Arc<dyn StreamListener>], unit: DecodedUnit) {
        match listeners.split_last() {
            Some((last, rest)) => {
                for listener in rest {
                    listener.on_unit(unit.duplicate());
                }
                last.on_unit(unit);
            }
            None => unit.release(),
        }
    }

    /// Read one unit for `track` into a pooled buffer
    pub fn read_unit(
        track: Track,
        decoder: &dyn MediaDecoder,
        pool: &BufferPool,
    ) -> Result<(ReadStatus, DecodedUnit)> {
        let mut unit = pool.acquire();
        let status = match track {
            Track::Audio => decoder.read_audio_chunk(unit.buffer_mut())?,
            Track::Video => decoder.read_video_frame(unit.buffer_mut())?,
        };
        if let ReadStatus::Data {
            units,
            timestamp_us,
            len,
        } = status
        {
            unit.set_filled(len, timestamp_us, units);
        }
        Ok((status, unit))
    }

    #[allow(clippy::too_many_arguments)]
    fn read_loop(
        track: Track,
        decoder: Arc<dyn MediaDecoder>,
        listeners: Arc<[Arc<dyn StreamListener>]>,
        pool: BufferPool,
        idle_poll: Duration,
        notices: Option<Sender<ReaderNotice>>,
        running: Arc<AtomicBool>,
        stop_rx: Receiver<()>,
    ) {
        info!("{} reader started", track);
        for listener in listeners.iter() {
            listener.stream_started();
        }

        let idle = |stop_rx: &Receiver<()>| -> bool {
            !matches!(stop_rx.recv_timeout(idle_poll), Err(RecvTimeoutError::Timeout))
        };

        let mut at_boundary = false;
        let mut faulted = false;

        while running.load(Ordering::SeqCst) {
            let available = match track {
                Track::Audio => decoder.available_audio(),
                Track::Video => decoder.available_video(),
            };
            if !available {
                if idle(&stop_rx) {
                    break;
                }
                continue;
            }

            match Self::read_unit(track, decoder.as_ref(), &pool) {
                Ok((ReadStatus::Data { .. }, unit)) => {
                    at_boundary = false;
                    if !running.load(Ordering::SeqCst) {
                        unit.release();
                        break;
                    }
                    Self::publish(&listeners, unit);
                }
                Ok((ReadStatus::Boundary, unit)) => {
                    unit.release();
                    if !at_boundary {
                        at_boundary = true;
                        debug!("{} reader reached a stream boundary", track);
                        for listener in listeners.iter() {
                            listener.stream_ended();
                        }
                        if let Some(tx) = &notices {
                            let _ = tx.send(ReaderNotice::Ended(track));
                        }
                    }
                    if idle(&stop_rx) {
                        break;
                    }
                }
                Ok((ReadStatus::Woken, unit)) => unit.release(),
                Err(e) if e.is_interruption() => break,
                Err(e) => {
                    error!("{} reader stopping on decode fault: {}", track, e);
                    faulted = true;
                    running.store(false, Ordering::SeqCst);
                    for listener in listeners.iter() {
                        listener.stream_closed();
                    }
                    if let Some(tx) = &notices {
                        let _ = tx.send(ReaderNotice::Fault(track, e.to_string()));
                    }
                    break;
                }
            }
        }

        if !faulted {
            for listener in listeners.iter() {
                listener.stream_stopped();
            }
        }
        info!("{} reader stopped", track);
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.stop();
    }
}
