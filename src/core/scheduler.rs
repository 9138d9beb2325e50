// Frame pacing for the tracking loop and the session stopwatch

use crate::models::graph::Timestamp;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::time::{Interval, MissedTickBehavior};

/// Suspends the tracking loop until the host has finished rendering a frame
#[async_trait]
pub trait FrameScheduler: Send {
    async fn wait_for_end_of_frame(&mut self);
}

/// Ticks at a fixed rate; late ticks are skipped rather than bunched up.
///
/// The timer is created on the first wait, inside the runtime driving the session.
pub struct IntervalScheduler {
    period: Duration,
    interval: Option<Interval>,
}

impl IntervalScheduler {
    pub fn new(fps: u32) -> Self {
        Self {
            period: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            interval: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

#[async_trait]
impl FrameScheduler for IntervalScheduler {
    async fn wait_for_end_of_frame(&mut self) {
        let period = self.period;
        let interval = self.interval.get_or_insert_with(|| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        interval.tick().await;
    }
}

/// Yields to the runtime once per frame, for headless runs
#[derive(Debug, Default)]
pub struct YieldScheduler;

#[async_trait]
impl FrameScheduler for YieldScheduler {
    async fn wait_for_end_of_frame(&mut self) {
        tokio::task::yield_now().await;
    }
}

/// Microsecond clock for packet timestamps, strictly increasing per session
#[derive(Debug)]
pub(crate) struct Stopwatch {
    started: Instant,
    last: Option<Timestamp>,
}

impl Stopwatch {
    pub(crate) fn start() -> Self {
        Self {
            started: Instant::now(),
            last: None,
        }
    }

    /// Elapsed time, bumped past the previous value if the clock has not advanced
    pub(crate) fn next_timestamp(&mut self) -> Timestamp {
        let elapsed = self.started.elapsed().as_micros().min(i64::MAX as u128) as i64;
        let micros = match self.last {
            Some(last) if elapsed <= last.micros() => last.micros() + 1,
            _ => elapsed,
        };
        let timestamp = Timestamp::from_micros(micros);
        self.last = Some(timestamp);
        timestamp
    }
}
