//! Retry connector — bounded-retry connection to the target peripheral
//!
//! Wraps a single driver connect attempt with a maximum attempt count and a
//! delay between attempts. A successful attempt requires both a
//! driver-reported connect and a passing liveness check; anything else counts
//! the attempt and, if budget remains, sleeps before the next one. No partial
//! state is retained across failed attempts.

use super::RelayError;
use crate::driver::{CentralDriver, CentralEvent};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Retry behavior for [`connect_with_retry`]
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum connection attempts, at least 1
    pub max_attempts: u32,
    /// Delay between attempts; the backoff base when exponential
    pub delay: Duration,
    /// Double the delay after each failed attempt.
    ///
    /// BLE controllers can be sensitive to rapid reconnect attempts, so this
    /// is the default; disable it for timing-compatible fixed delays.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff starting at `delay`
    pub fn exponential(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            exponential: true,
        }
    }

    /// Fixed delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            exponential: false,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        if self.exponential {
            // Saturate the shift so a large attempt count cannot overflow
            let factor = 1u32 << attempt.saturating_sub(1).min(16);
            self.delay.saturating_mul(factor)
        } else {
            self.delay
        }
    }
}

/// Connect to `address`, retrying up to `policy.max_attempts` times.
///
/// On success returns the central event stream for the new link. After the
/// final failed attempt returns [`RelayError::Connection`] carrying the
/// address and attempt count; the caller must treat that as terminal rather
/// than retrying at a higher level.
pub async fn connect_with_retry(
    driver: &dyn CentralDriver,
    address: &str,
    policy: &RetryPolicy,
) -> Result<mpsc::UnboundedReceiver<CentralEvent>, RelayError> {
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match driver.connect(address).await {
            Ok(events) => {
                if driver.is_connected().await {
                    info!(attempt, address, "connected to target");
                    return Ok(events);
                }
                warn!(
                    attempt,
                    address, "driver reported connect but liveness check failed"
                );
            }
            Err(err) => {
                warn!(attempt, address, %err, "connect attempt failed");
            }
        }

        if attempt < max_attempts {
            let backoff = policy.backoff_after(attempt);
            debug!(attempt, address, delay_ms = backoff.as_millis() as u64, "retrying");
            sleep(backoff).await;
        }
    }

    Err(RelayError::Connection {
        address: address.to_string(),
        attempts: max_attempts,
    })
}
