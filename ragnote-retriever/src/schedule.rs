//! Drain scheduling for the worker loop.
//!
//! [`DrainSchedule::every`] fires on a fixed interval plus an optional jitter;
//! [`DrainSchedule::manual`] never fires, leaving drains to explicit `DrainNow` controls
//! so tests can single-step the loop. Jitter is derived from the tick number, so a
//! given schedule always produces the same sequence of delays.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Every { interval: Duration, jitter: Duration },
    Manual,
}

/// Timer driving drain cycles.
#[derive(Debug)]
pub struct DrainSchedule {
    mode: ScheduleMode,
    next: Option<Instant>,
    ticks: u64,
}

impl DrainSchedule {
    pub fn every(interval: Duration, jitter: Duration) -> Self {
        Self {
            mode: ScheduleMode::Every { interval, jitter },
            next: None,
            ticks: 0,
        }
    }

    pub fn manual() -> Self {
        Self {
            mode: ScheduleMode::Manual,
            next: None,
            ticks: 0,
        }
    }

    pub fn mode(&self) -> ScheduleMode {
        self.mode
    }

    /// Number of ticks fired so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Wait for the next tick and return its number, starting at 1.
    ///
    /// Cancellation safe: dropping the future before it completes leaves the deadline
    /// untouched. A late tick pushes the following one back instead of bursting.
    pub async fn tick(&mut self) -> u64 {
        let ScheduleMode::Every { interval, jitter } = self.mode else {
            return std::future::pending().await;
        };

        let deadline = match self.next {
            Some(deadline) => deadline,
            None => {
                let deadline = Instant::now() + interval + jitter_for(self.ticks, jitter);
                self.next = Some(deadline);
                deadline
            }
        };

        tokio::time::sleep_until(deadline).await;

        self.ticks += 1;
        let base = deadline.max(Instant::now());
        self.next = Some(base + interval + jitter_for(self.ticks, jitter));
        self.ticks
    }
}

/// Deterministic jitter in `[0, max]` for a tick number
fn jitter_for(tick: u64, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let hash = blake3::hash(&tick.to_le_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    let span = max.as_nanos().min(u64::MAX as u128) as u64;
    Duration::from_nanos(u64::from_le_bytes(bytes) % span.saturating_add(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval() {
        let mut schedule = DrainSchedule::every(Duration::from_millis(75), Duration::ZERO);
        let start = Instant::now();

        assert_eq!(schedule.tick().await, 1);
        assert_eq!(start.elapsed(), Duration::from_millis(75));
        assert_eq!(schedule.tick().await, 2);
        assert_eq!(start.elapsed(), Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tick_delays_next() {
        let mut schedule = DrainSchedule::every(Duration::from_millis(50), Duration::ZERO);
        let start = Instant::now();

        schedule.tick().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Overdue tick fires immediately, then the interval restarts from now
        schedule.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(250));
        schedule.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_tick_keeps_deadline() {
        let mut schedule = DrainSchedule::every(Duration::from_millis(100), Duration::ZERO);
        let start = Instant::now();

        let early = tokio::time::timeout(Duration::from_millis(30), schedule.tick()).await;
        assert!(early.is_err());
        schedule.tick().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_never_fires() {
        let mut schedule = DrainSchedule::manual();
        let result = tokio::time::timeout(Duration::from_secs(3600), schedule.tick()).await;
        assert!(result.is_err());
        assert_eq!(schedule.ticks(), 0);
    }

    #[test]
    fn test_jitter_is_bounded_and_deterministic() {
        let max = Duration::from_millis(20);
        for tick in 0..100 {
            let jitter = jitter_for(tick, max);
            assert!(jitter <= max);
            assert_eq!(jitter, jitter_for(tick, max));
        }
        assert_eq!(jitter_for(7, Duration::ZERO), Duration::ZERO);
    }
}
