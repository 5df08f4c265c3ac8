//! Restartable timeout utility over `tokio::time::Sleep`, used to arm the
//! clustered lock's acquire deadlines.

use std::pin::Pin;

use crate::utils::GridError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer that fires once after a given duration and can be re-armed with a
/// different duration. Must be used within a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    // pinned box so the Sleep can be awaited repeatedly
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last arming.
    last_dur: Duration,
}

impl Timer {
    /// A fresh timer fires immediately (zero-length duration).
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Re-arm the timer with the given non-zero duration.
    pub fn restart(&mut self, dur: Duration) -> Result<(), GridError> {
        if dur.is_zero() {
            return Err(GridError::Msg(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Wait for the timer to fire; typically a `tokio::select!` branch.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod timer_tests {
    use super::*;
    use tokio::time::{Duration, Instant};

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn timer_new() {
        let timer = Timer::new();
        assert!(timer.get_dur().is_zero());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_initial() -> Result<(), GridError> {
        let start = Instant::now();
        let mut timer = Timer::new();
        timer.timeout().await; // should complete immediately
        let finish = Instant::now();
        assert!(finish.duration_since(start) < Duration::from_millis(100));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timer_restart() -> Result<(), GridError> {
        let mut timer = Timer::new();
        // round 1 with 200ms timeout
        let mut start = Instant::now();
        timer.restart(Duration::from_millis(200))?;
        timer.timeout().await;
        let mut finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(200));
        assert_eq!(timer.get_dur(), Duration::from_millis(200));
        // round 2 with 100ms incremental backoff
        start = Instant::now();
        timer.restart(timer.get_dur() + Duration::from_millis(100))?;
        timer.timeout().await;
        finish = Instant::now();
        assert!(finish.duration_since(start) >= Duration::from_millis(300));
        assert_eq!(timer.get_dur(), Duration::from_millis(300));
        Ok(())
    }
}
