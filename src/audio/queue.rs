//! Bounded audio queue
//!
//! FIFO of decoded audio units bounded by buffered duration rather than by
//! count. A producer blocks while the unit it offers is more than the
//! horizon ahead of the queue head; the consumer blocks while the queue is
//! empty.

use crate::decoder::{AudioFormat, DecodedUnit};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Queue statistics for monitoring
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// Total units accepted
    pub units_added: u64,

    /// Units discarded by clears, seeks or duplicate suppression
    pub units_dropped: u64,

    /// Units handed to the consumer
    pub units_consumed: u64,

    /// Largest span observed, in microseconds
    pub max_span_us: i64,
}

/// Result of waiting for the next unit
#[derive(Debug)]
pub enum Popped {
    Unit(DecodedUnit),

    /// The consumer was asked to re-check its control state
    Interrupted,

    Closed,
}

struct Inner {
    units: VecDeque<DecodedUnit>,
    closed: bool,
    /// Producers are turned away until the next reader run
    producers_cancelled: bool,
    consumer_interrupt: bool,
    /// The consumer holds a popped unit it has not finished playing
    in_hand: bool,
    /// Re-decoded audio before this point is already queued
    skip: Option<SkipWindow>,
    stats: QueueStats,
}

/// Audio already queued ahead of a forward seek
#[derive(Debug, Clone, Copy)]
struct SkipWindow {
    until_us: i64,
    format: AudioFormat,
}

/// Time just past the last sample of `unit`
fn unit_end_us(unit: &DecodedUnit, format: &AudioFormat) -> i64 {
    unit.timestamp_us() + format.frames_to_micros(format.frames_in(unit.data().len()) as u64)
}

/// Drop the frames of `unit` that play before `from_us`
fn trim_front(unit: &mut DecodedUnit, from_us: i64, format: &AudioFormat) {
    let len = unit.data().len();
    let frames = format.frames_in(len);
    let offset_us = (from_us - unit.timestamp_us()).max(0) as i128;
    let skip = ((offset_us * format.sample_rate as i128 + 500_000) / 1_000_000) as usize;
    let skip = skip.min(frames);
    if skip == 0 {
        return;
    }

    let skip_bytes = skip * format.frame_size;
    unit.buffer_mut().copy_within(skip_bytes..len, 0);
    let timestamp_us = unit.timestamp_us() + format.frames_to_micros(skip as u64);
    unit.set_filled(len - skip_bytes, timestamp_us, frames - skip);
}

impl Inner {
    fn span_us(&self) -> i64 {
        match (self.units.front(), self.units.back()) {
            (Some(head), Some(tail)) => tail.timestamp_us() - head.timestamp_us(),
            _ => 0,
        }
    }
}

/// Duration-bounded FIFO shared by the stream reader and the output thread
pub struct BoundedAudioQueue {
    inner: Mutex<Inner>,
    not_full: Condvar,
    not_empty: Condvar,
    horizon_us: i64,
}

impl BoundedAudioQueue {
    /// Create a queue holding at most `horizon_us` of audio between head and tail
    pub fn new(horizon_us: i64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                units: VecDeque::new(),
                closed: false,
                producers_cancelled: false,
                consumer_interrupt: false,
                in_hand: false,
                skip: None,
                stats: QueueStats::default(),
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            horizon_us,
        }
    }

    pub fn horizon_us(&self) -> i64 {
        self.horizon_us
    }

    /// Queue `unit`, blocking while it lies beyond the horizon
    ///
    /// The unit comes back as `Err` if the queue closed or producers were
    /// cancelled.
    pub fn push(&self, mut unit: DecodedUnit) -> Result<(), DecodedUnit> {
        let mut inner = self.inner.lock();

        if let Some(skip) = inner.skip {
            if unit_end_us(&unit, &skip.format) <= skip.until_us {
                inner.stats.units_dropped += 1;
                drop(inner);
                unit.release();
                return Ok(());
            }
            trim_front(&mut unit, skip.until_us, &skip.format);
            inner.skip = None;
        }

        while !inner.closed && !inner.producers_cancelled {
            let beyond = match inner.units.front() {
                Some(head) => unit.timestamp_us() - head.timestamp_us() > self.horizon_us,
                None => false,
            };
            if !beyond {
                break;
            }
            self.not_full.wait(&mut inner);
        }

        if inner.closed || inner.producers_cancelled {
            return Err(unit);
        }

        inner.units.push_back(unit);
        inner.stats.units_added += 1;
        inner.stats.max_span_us = inner.stats.max_span_us.max(inner.span_us());
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest unit, blocking while the queue is empty
    ///
    /// A returned unit counts as in hand until [`finish_unit`](Self::finish_unit)
    /// or the next `pop`.
    pub fn pop(&self) -> Popped {
        let mut inner = self.inner.lock();
        inner.in_hand = false;
        loop {
            if inner.closed {
                return Popped::Closed;
            }
            if inner.consumer_interrupt {
                inner.consumer_interrupt = false;
                return Popped::Interrupted;
            }
            if let Some(unit) = inner.units.pop_front() {
                inner.stats.units_consumed += 1;
                inner.in_hand = true;
                self.not_full.notify_all();
                return Popped::Unit(unit);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<DecodedUnit> {
        let mut inner = self.inner.lock();
        if inner.units.is_empty() && !inner.closed {
            let _ = self.not_empty.wait_for(&mut inner, timeout);
        }
        let unit = inner.units.pop_front();
        if unit.is_some() {
            inner.stats.units_consumed += 1;
            self.not_full.notify_all();
        }
        unit
    }

    /// Make a blocked or the next [`pop`](Self::pop) return `Interrupted`
    pub fn interrupt_consumer(&self) {
        self.inner.lock().consumer_interrupt = true;
        self.not_empty.notify_all();
    }

    /// Turn away waiting and future producers until [`resume_producers`](Self::resume_producers)
    pub fn cancel_producers(&self) {
        self.inner.lock().producers_cancelled = true;
        self.not_full.notify_all();
    }

    pub fn resume_producers(&self) {
        self.inner.lock().producers_cancelled = false;
    }

    /// Release every queued unit; returns how many were dropped
    pub fn clear(&self) -> usize {
        let drained: Vec<DecodedUnit> = {
            let mut inner = self.inner.lock();
            inner.skip = None;
            let drained: Vec<_> = inner.units.drain(..).collect();
            inner.stats.units_dropped += drained.len() as u64;
            drained
        };
        self.not_full.notify_all();

        let count = drained.len();
        drained.into_iter().for_each(DecodedUnit::release);
        count
    }

    /// Release queued units stamped before `min_us`
    pub fn clear_before(&self, min_us: i64) -> usize {
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock();
            while inner.units.front().map(|u| u.timestamp_us() < min_us).unwrap_or(false) {
                if let Some(unit) = inner.units.pop_front() {
                    dropped.push(unit);
                }
            }
            inner.stats.units_dropped += dropped.len() as u64;
        }
        self.not_full.notify_all();

        let count = dropped.len();
        dropped.into_iter().for_each(DecodedUnit::release);
        count
    }

    /// Keep queued audio from `min_us` on, for a forward seek to `min_us`
    ///
    /// Units that end by `min_us` are released and the one playing across it
    /// is cut to start there. The reader re-decodes from `min_us` on its own
    /// chunk grid, so offered audio is dropped or cut until it reaches the end
    /// of the queued tail. Returns how many units were released.
    pub fn retain_from(&self, min_us: i64, format: &AudioFormat) -> usize {
        let mut dropped = Vec::new();
        {
            let mut inner = self.inner.lock();
            while inner
                .units
                .front()
                .map(|u| unit_end_us(u, format) <= min_us)
                .unwrap_or(false)
            {
                if let Some(unit) = inner.units.pop_front() {
                    dropped.push(unit);
                }
            }
            if let Some(head) = inner.units.front_mut() {
                trim_front(head, min_us, format);
            }
            inner.stats.units_dropped += dropped.len() as u64;
            inner.skip = inner.units.back().map(|tail| SkipWindow {
                until_us: unit_end_us(tail, format),
                format: *format,
            });
        }
        self.not_full.notify_all();

        let count = dropped.len();
        dropped.into_iter().for_each(DecodedUnit::release);
        count
    }

    /// Time between the oldest and newest queued unit
    pub fn span_us(&self) -> i64 {
        self.inner.lock().span_us()
    }

    /// Timestamp of the newest queued unit
    pub fn newest_us(&self) -> Option<i64> {
        self.inner.lock().units.back().map(DecodedUnit::timestamp_us)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().units.is_empty()
    }

    /// The consumer is done with the unit from its last `pop`
    pub fn finish_unit(&self) {
        self.inner.lock().in_hand = false;
    }

    /// Nothing queued and nothing being played
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.units.is_empty() && !inner.in_hand
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().stats.clone()
    }

    /// Close the queue, release everything and wake both sides
    pub fn close(&self) {
        let drained: Vec<DecodedUnit> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.units.drain(..).collect()
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        drained.into_iter().for_each(DecodedUnit::release);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}
