use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
        }
    }
}

/// Runs `action` until it succeeds, the error is not retriable, or the
/// configured attempt budget is exhausted. Delays grow geometrically from
/// `min_delay` up to `max_delay`.
pub async fn with_retries<T, E, F, Fut>(
    description: &str,
    config: &RetryConfig,
    is_retriable: impl Fn(&E) -> bool,
    mut action: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0u32;
    let mut delay = config.min_delay;
    loop {
        match action().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempts += 1;
                if attempts >= config.max_attempts || !is_retriable(&error) {
                    return Err(error);
                }
                warn!(
                    "{description} failed (attempt {attempts}/{}), retrying in {delay:?}: {error}",
                    config.max_attempts
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay.mul_f64(config.multiplier), config.max_delay);
            }
        }
    }
}
