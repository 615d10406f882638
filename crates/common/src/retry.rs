use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::MirrorError;

/// Upper bound on a server-provided `Retry-After` wait.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^attempt`, capped at
    /// `max_delay`, plus up to 25% jitter when enabled.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() / 4) as u64;
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    Permanent,
    Backoff,
    After(Duration),
}

/// Classifies which error values are worth another attempt.
pub trait Retryable {
    fn retry_hint(&self) -> RetryHint;
}

impl Retryable for MirrorError {
    fn retry_hint(&self) -> RetryHint {
        match self {
            MirrorError::RateLimited {
                retry_after: Some(wait),
            } => RetryHint::After(*wait),
            MirrorError::RateLimited { retry_after: None } | MirrorError::Transient(_) => {
                RetryHint::Backoff
            }
            _ => RetryHint::Permanent,
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    Permanent(E),
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) => e,
            Self::Exhausted { last, .. } => last,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl RetryError<MirrorError> {
    /// Collapse into a single error; exhausted retries keep the attempt count in the message.
    pub fn into_error(self) -> MirrorError {
        match self {
            Self::Permanent(e) => e,
            exhausted @ Self::Exhausted { .. } => MirrorError::Transient(exhausted.to_string()),
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent(e) => write!(f, "{e}"),
            Self::Exhausted { attempts, last } => {
                write!(f, "max retries exceeded after {attempts} attempts: {last}")
            }
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out of retries.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let wait = match err.retry_hint() {
            RetryHint::Permanent => return Err(RetryError::Permanent(err)),
            _ if attempt >= policy.max_retries => {
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: err,
                });
            }
            RetryHint::After(wait) => wait.min(MAX_RETRY_AFTER),
            RetryHint::Backoff => policy.backoff(attempt + 1),
        };

        attempt += 1;
        tracing::warn!(
            operation,
            attempt,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "retrying after backoff"
        );
        tokio::time::sleep(wait).await;
    }
}
