//! Playback clock, frame pacing and interruptible sleeping for decoders
//!
//! Backends that deliver frames against the wall clock use a
//! [`PlaybackClock`] for the transport position, a [`FramePacer`] to decide
//! whether the next frame is due, and a [`Sleeper`] to block until it is.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Transport clock running at a signed playback speed
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    start_us: i64,
    end_us: i64,
    anchor_us: i64,
    anchor: Option<Instant>,
    speed: f32,
}

impl PlaybackClock {
    /// Create a stopped clock at `start_us`
    pub fn new(start_us: i64, end_us: i64) -> Self {
        Self {
            start_us,
            end_us,
            anchor_us: start_us,
            anchor: None,
            speed: 1.0,
        }
    }

    /// Current stream time, clamped to the stream bounds
    pub fn now_us(&self) -> i64 {
        let t = match self.anchor {
            Some(at) => {
                let elapsed = at.elapsed().as_micros() as f64;
                self.anchor_us + (elapsed * self.speed as f64) as i64
            }
            None => self.anchor_us,
        };
        t.clamp(self.start_us, self.end_us)
    }

    /// Start advancing from the current position
    pub fn start(&mut self) {
        if self.anchor.is_none() {
            self.anchor = Some(Instant::now());
        }
    }

    /// Freeze at the current position
    pub fn stop(&mut self) {
        self.anchor_us = self.now_us();
        self.anchor = None;
    }

    pub fn is_running(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Change speed without jumping
    pub fn set_speed(&mut self, speed: f32) {
        self.rebase(self.now_us());
        self.speed = speed;
    }

    /// Jump to `time_us`
    pub fn seek(&mut self, time_us: i64) {
        self.rebase(time_us.clamp(self.start_us, self.end_us));
    }

    pub fn at_start(&self) -> bool {
        self.now_us() <= self.start_us
    }

    pub fn at_end(&self) -> bool {
        self.now_us() >= self.end_us
    }

    fn rebase(&mut self, time_us: i64) {
        self.anchor_us = time_us;
        if self.anchor.is_some() {
            self.anchor = Some(Instant::now());
        }
    }
}

/// Frame presentation decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FramePresentation {
    /// The frame is due now
    Present,

    /// The frame is due after this much wall-clock time
    Wait(Duration),

    /// The clock is this many frames past the frame; skip them and present the next
    Skip(usize),
}

/// Decides when frames are due at a given playback speed
#[derive(Debug, Clone, Copy)]
pub struct FramePacer {
    frame_duration_us: i64,
}

impl FramePacer {
    /// Create a pacer for the given frame rate
    pub fn new(fps: f64) -> Self {
        let frame_duration_us = if fps > 0.0 {
            (1_000_000.0 / fps).round() as i64
        } else {
            0
        };
        Self {
            frame_duration_us: frame_duration_us.max(1),
        }
    }

    pub fn frame_duration_us(&self) -> i64 {
        self.frame_duration_us
    }

    /// Decide what to do with the frame stamped `frame_us` when the clock reads `now_us`
    ///
    /// For reverse speeds a frame is due once the clock has fallen to its
    /// timestamp.
    pub fn schedule(&self, frame_us: i64, now_us: i64, speed: f32) -> FramePresentation {
        let ahead = if speed >= 0.0 {
            frame_us - now_us
        } else {
            now_us - frame_us
        };

        if ahead > 0 {
            let rate = speed.abs().max(f32::EPSILON) as f64;
            return FramePresentation::Wait(Duration::from_micros((ahead as f64 / rate) as u64));
        }

        let behind = (-ahead / self.frame_duration_us) as usize;
        if behind == 0 {
            FramePresentation::Present
        } else {
            FramePresentation::Skip(behind)
        }
    }
}

/// Why a sleep ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    TimedOut,
    Woken,
}

/// Interruptible sleep shared by all reads of one decoder
///
/// A reader takes a [`token`](Sleeper::token) before it inspects decoder
/// state; any [`wake`](Sleeper::wake) after that point ends its sleep, so a
/// wake issued between the check and the sleep is never lost.
#[derive(Debug, Default)]
pub struct Sleeper {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl Sleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> u64 {
        *self.generation.lock()
    }

    /// Sleep until `timeout` elapses (forever when `None`) or a wake arrives
    pub fn sleep(&self, token: u64, timeout: Option<Duration>) -> Wakeup {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut generation = self.generation.lock();

        while *generation == token {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut generation, deadline).timed_out() {
                        return if *generation == token {
                            Wakeup::TimedOut
                        } else {
                            Wakeup::Woken
                        };
                    }
                }
                None => self.cond.wait(&mut generation),
            }
        }

        Wakeup::Woken
    }

    /// End every sleep in progress
    pub fn wake(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_clock_stopped_and_seek() {
        let mut clock = PlaybackClock::new(0, 10_000_000);
        assert!(clock.at_start());
        assert!(!clock.at_end());

        clock.seek(2_500_000);
        assert_eq!(clock.now_us(), 2_500_000);

        clock.seek(20_000_000);
        assert!(clock.at_end());
        assert!(!clock.at_start());
    }

    #[test]
    fn test_clock_runs_at_speed() {
        let mut clock = PlaybackClock::new(0, 10_000_000);
        clock.seek(5_000_000);
        clock.set_speed(-2.0);
        clock.start();
        thread::sleep(Duration::from_millis(50));
        clock.stop();

        let t = clock.now_us();
        assert!(t <= 4_900_000, "clock at {}", t);
        assert!(t >= 3_000_000, "clock at {}", t);
    }

    #[test]
    fn test_pacer_forward() {
        let pacer = FramePacer::new(25.0);
        assert_eq!(pacer.frame_duration_us(), 40_000);

        match pacer.schedule(100_000, 80_000, 2.0) {
            FramePresentation::Wait(d) => assert_eq!(d, Duration::from_micros(10_000)),
            other => panic!("Expected Wait, got {:?}", other),
        }
        assert_eq!(pacer.schedule(100_000, 110_000, 1.0), FramePresentation::Present);
        assert_eq!(pacer.schedule(100_000, 190_000, 1.0), FramePresentation::Skip(2));
    }

    #[test]
    fn test_pacer_reverse() {
        let pacer = FramePacer::new(25.0);
        assert!(matches!(
            pacer.schedule(100_000, 140_000, -1.0),
            FramePresentation::Wait(_)
        ));
        assert_eq!(pacer.schedule(100_000, 90_000, -1.0), FramePresentation::Present);
        assert_eq!(pacer.schedule(100_000, 10_000, -1.0), FramePresentation::Skip(2));
    }

    #[test]
    fn test_sleeper_timeout() {
        let sleeper = Sleeper::new();
        let token = sleeper.token();
        assert_eq!(
            sleeper.sleep(token, Some(Duration::from_millis(5))),
            Wakeup::TimedOut
        );
    }

    #[test]
    fn test_sleeper_wake_before_sleep() {
        let sleeper = Sleeper::new();
        let token = sleeper.token();
        sleeper.wake();
        assert_eq!(sleeper.sleep(token, None), Wakeup::Woken);
    }

    #[test]
    fn test_sleeper_wake_from_other_thread() {
        let sleeper = Arc::new(Sleeper::new());
        let token = sleeper.token();

        let waker = {
            let sleeper = Arc::clone(&sleeper);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sleeper.wake();
            })
        };

        assert_eq!(sleeper.sleep(token, None), Wakeup::Woken);
        waker.join().unwrap();
    }
}
