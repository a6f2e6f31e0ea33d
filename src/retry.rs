use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::SeqTaxError;
use crate::transport::{EutilsRequest, Transport, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to 25% random delay on top of each backoff.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retries without sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(jitter_ms)
    }
}

/// Wraps a [`Transport`] so every request is retried on transient failures.
pub struct RetryingClient<T> {
    transport: T,
    policy: RetryPolicy,
}

impl<T: Transport> RetryingClient<T> {
    pub fn new(transport: T, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sends `request` and hands the body to `parse`. Parse failures reported
    /// as [`TransportError::Malformed`] are retried like network faults.
    pub fn execute<R, F>(
        &self,
        context: &str,
        request: &EutilsRequest,
        mut parse: F,
    ) -> Result<R, SeqTaxError>
    where
        F: FnMut(&str) -> Result<R, TransportError>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = self.transport.send(request).and_then(|response| {
                if let Some(err) = TransportError::from_status(response.status, &response.body) {
                    return Err(err);
                }
                if let Some(message) = entrez_error(&response.body) {
                    return Err(TransportError::Malformed(format!(
                        "service reported error: {message}"
                    )));
                }
                parse(&response.body)
            });

            let err = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{context} succeeded after {attempt} attempts");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(SeqTaxError::Request {
                    context: context.to_string(),
                    source: err,
                });
            }
            if attempt >= max_attempts {
                return Err(SeqTaxError::RetriesExhausted {
                    context: context.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = self.policy.backoff(attempt - 1);
            debug!(
                "Retrying {context} after {} failure (attempt {attempt}/{max_attempts}) in {delay:?}: {err}",
                err.kind()
            );
            thread::sleep(delay);
        }
    }
}

/// Text of an Entrez `<ERROR>` element, which the service sends with a 200
/// status when a backend is briefly unavailable.
pub fn entrez_error(body: &str) -> Option<&str> {
    let start = body.find("<ERROR>")? + "<ERROR>".len();
    let end = body[start..]
        .find("</ERROR>")
        .map(|offset| start + offset)
        .unwrap_or(body.len());
    Some(body[start..end].trim())
}
