//! Chunk send scheduling: bounded resends with exponential backoff after transient errors.

use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::transport::TransportError;

/// Upper bound on a single backoff sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first resend; doubled for each further one.
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_send_retries,
            base_backoff: config.retry_backoff,
        }
    }

    /// Delay before resend number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << shift)
            .min(MAX_BACKOFF)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Why a scheduled send gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// Permanent error, or transient errors past the retry bound.
    Fatal(TransportError),
    /// `keep_going` returned false between attempts (session left `Active`).
    Abandoned,
}

/// Run `attempt` until it succeeds, fails permanently, or exhausts `policy`.
///
/// `keep_going` is checked before every resend so cancelled sessions stop retrying.
/// Returns the number of resends that were needed.
pub async fn send_with_retry<F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
    mut keep_going: impl FnMut() -> bool,
) -> Result<u32, SendFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TransportError>>,
{
    let mut retry = 0u32;
    loop {
        match attempt().await {
            Ok(()) => return Ok(retry),
            Err(TransportError::Transient(msg)) if retry < policy.max_retries => {
                retry += 1;
                let delay = policy.backoff(retry);
                tracing::warn!(
                    retry,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient transport error, resending: {}",
                    msg
                );
                tokio::time::sleep(delay).await;
                if !keep_going() {
                    return Err(SendFailure::Abandoned);
                }
            }
            Err(e) => return Err(SendFailure::Fatal(e)),
        }
    }
}
