//! Resettable timer implemented using `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::DiscoverdError;

use tokio::time::{self, Duration, Instant, Sleep};

/// Timer that fires once after a given duration and can be re-armed with a
/// different duration each round. Periodic loops with jittered intervals
/// (heartbeats, fast retries) use it as a `tokio::select!` branch.
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner `tokio::time::Sleep` future, pinned so it can be awaited
    /// repeatedly.
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last kick-off.
    last_dur: Duration,
}

impl Timer {
    /// Creates a new timer that fires immediately.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
        }
    }

    /// Duration used by the last kick-off.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Re-arms the timer to fire `dur` from now.
    pub fn restart(&mut self, dur: Duration) -> Result<(), DiscoverdError> {
        if dur.is_zero() {
            return Err(DiscoverdError::Validation(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Waits for the timer to fire.
    pub async fn timeout(&mut self) {
        self.sleep.as_mut().await
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
