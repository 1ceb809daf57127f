//! Playback Scheduler
//!
//! Received frames are laid end to end on the output device's clock. A single
//! cursor tracks where the next frame starts; a frame that arrives late starts
//! "now" instead, so playback self-heals after falling behind.
//!
//! "Assistant talking" is `cursor > now`. It is re-evaluated on the session's
//! scheduler tick, which makes it a best-effort signal tied to buffer timing
//! rather than a server-confirmed turn boundary.

use crate::{
    audio_utils::{PLAYBACK_SAMPLE_RATE, frame_duration},
    device::AudioOutput,
};
use std::sync::Arc;
use tracing::debug;

/// Where a frame landed on the device timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledFrame {
    pub start: f64,
    pub duration: f64,
}

impl ScheduledFrame {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// The gapless-scheduling cursor, independent of any device.
#[derive(Debug, Clone)]
pub struct PlaybackScheduler {
    next_start: f64,
    sample_rate: u32,
}

impl PlaybackScheduler {
    /// Starts the cursor at the device's current time.
    pub fn new(sample_rate: u32, now: f64) -> Self {
        Self {
            next_start: now,
            sample_rate,
        }
    }

    /// Places a frame of `samples` samples at `max(now, cursor)` and advances
    /// the cursor past it.
    pub fn enqueue(&mut self, samples: usize, now: f64) -> ScheduledFrame {
        let start = now.max(self.next_start);
        let frame = ScheduledFrame {
            start,
            duration: frame_duration(samples, self.sample_rate),
        };
        self.next_start = frame.end();
        frame
    }

    /// Whether scheduled audio remains unplayed at `now`.
    pub fn is_talking(&self, now: f64) -> bool {
        self.next_start > now
    }

    /// Snaps the cursor back to `now`, abandoning everything scheduled later.
    pub fn interrupt(&mut self, now: f64) {
        self.next_start = now;
    }

    /// Zeroes the cursor when the session closes.
    pub fn reset(&mut self) {
        self.next_start = 0.0;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }
}

/// A scheduler bound to the output device it schedules onto.
pub struct Playback {
    scheduler: PlaybackScheduler,
    output: Arc<dyn AudioOutput>,
}

impl Playback {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let scheduler = PlaybackScheduler::new(PLAYBACK_SAMPLE_RATE, output.now());
        Self { scheduler, output }
    }

    /// Schedules decoded 24 kHz samples; returns the talking flag afterwards.
    pub fn enqueue(&mut self, samples: Vec<f32>) -> bool {
        if samples.is_empty() {
            return self.refresh();
        }
        let now = self.output.now();
        let frame = self.scheduler.enqueue(samples.len(), now);
        debug!(start = frame.start, duration = frame.duration, now, "Scheduled playback frame");
        self.output.schedule(samples, frame.start);
        self.scheduler.is_talking(now)
    }

    /// Flushes pending output and resynchronises the cursor to the clock.
    pub fn interrupt(&mut self) {
        self.output.cancel_pending();
        self.scheduler.interrupt(self.output.now());
    }

    /// Re-checks whether any scheduled audio is still unplayed.
    pub fn refresh(&self) -> bool {
        self.scheduler.is_talking(self.output.now())
    }

    pub fn next_start(&self) -> f64 {
        self.scheduler.next_start()
    }

    /// Cancels unplayed audio, zeroes the cursor and releases the device.
    pub fn close(mut self) {
        self.output.cancel_pending();
        self.scheduler.reset();
    }
}
