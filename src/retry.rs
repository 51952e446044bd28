//! Bounded retries with exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How often, and how patiently, to retry a failing operation.
///
/// Each retry sleeps for the current delay plus a random extra of up to the
/// same amount, then multiplies the delay by `factor`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Growth of the delay per retry. Values below 1.0 are treated as 1.0.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(1),
            factor: 1.5,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            retries: 0,
            ..Self::default()
        }
    }

    /// Base delays before each retry, without jitter.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let factor = self.factor.max(1.0);
        let mut delay = self.delay;
        (0..self.retries).map(move |_| {
            let current = delay;
            delay = delay.mul_f64(factor);
            current
        })
    }

    /// Run `op` until it succeeds or the retries are used up, returning the
    /// last error in that case.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => match delays.next() {
                    Some(delay) => {
                        warn!(attempt, %err, "{what} failed, retrying in {delay:?}");
                        tokio::time::sleep(jittered(delay)).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..millis))
}
