//! Wall-clock pacing.
//!
//! All waiting in a run (sampling cadence, warm-up polls, cool-down polls,
//! settle delays) is expressed in ticks and goes through a [`Pacer`], so
//! the simulator can advance its model instead of sleeping.

use std::time::{Duration, Instant};

pub trait Pacer {
    /// Block for `ticks` ticks.
    fn pause(&self, ticks: u32);

    /// Whole ticks since the pacer was created. Differences of two readings
    /// measure phases that also wait outside the pacer.
    fn elapsed_ticks(&self) -> u64;
}

/// Sleeps `tick` per tick. A zero tick never blocks.
#[derive(Debug, Clone, Copy)]
pub struct SleepPacer {
    pub tick: Duration,
    origin: Instant,
}

impl SleepPacer {
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            origin: Instant::now(),
        }
    }
}

impl Default for SleepPacer {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl Pacer for SleepPacer {
    fn pause(&self, ticks: u32) {
        if ticks == 0 || self.tick.is_zero() {
            return;
        }
        std::thread::sleep(self.tick * ticks);
    }

    fn elapsed_ticks(&self) -> u64 {
        if self.tick.is_zero() {
            return 0;
        }
        let ticks = self.origin.elapsed().as_nanos() / self.tick.as_nanos();
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn zero_tick_does_not_block() {
        let pacer = SleepPacer::new(Duration::ZERO);
        let start = Instant::now();
        pacer.pause(1_000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn pause_scales_with_ticks() {
        let pacer = SleepPacer::new(Duration::from_millis(5));
        let start = Instant::now();
        pacer.pause(3);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn elapsed_ticks_follow_the_wall_clock() {
        let pacer = SleepPacer::new(Duration::from_millis(5));
        pacer.pause(3);
        assert!(pacer.elapsed_ticks() >= 3);
        assert_eq!(SleepPacer::new(Duration::ZERO).elapsed_ticks(), 0);
    }
}
