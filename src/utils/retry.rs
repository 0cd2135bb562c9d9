//! Bounded retry strategy: keep trying with a fixed delay until a total time
//! budget runs out, but never give up before a minimum number of attempts.

use std::future::Future;

use crate::utils::DiscoverdError;

use tokio::time::{self, Duration, Instant};

/// Retry strategy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempts {
    /// Total time budget across all attempts.
    pub total: Duration,

    /// Delay between consecutive attempts.
    pub delay: Duration,

    /// Minimum number of attempts made even if `total` has elapsed.
    pub min_attempts: usize,
}

impl Attempts {
    /// Strategy used for a heartbeater's first registration.
    pub const REGISTER: Attempts = Attempts {
        total: Duration::from_secs(60),
        delay: Duration::from_millis(200),
        min_attempts: 5,
    };

    /// Strategy used by a watch to reconnect its stream.
    pub const RECONNECT: Attempts = Attempts {
        total: Duration::from_secs(30),
        delay: Duration::from_millis(200),
        min_attempts: 1,
    };

    /// Runs `op` until it succeeds or the strategy is exhausted, returning
    /// the last error in the latter case. `keep_going` may veto further
    /// attempts for errors that retrying cannot fix.
    pub async fn run<T, F, Fut>(
        &self,
        mut op: F,
        keep_going: impl Fn(&DiscoverdError) -> bool,
    ) -> Result<T, DiscoverdError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DiscoverdError>>,
    {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let exhausted = attempt >= self.min_attempts
                        && start.elapsed() + self.delay > self.total;
                    if exhausted || !keep_going(&e) {
                        return Err(e);
                    }
                    pf_trace!("attempt {} failed: {}", attempt, e);
                }
            }
            time::sleep(self.delay).await;
        }
    }
}
