//! Provider-call retry with exponential back-off.
//!
//! Upstream providers signal overload and rate limiting in free-form error
//! text, so transient failures are recognised by substring.  Anything else is
//! returned to the caller immediately.  When retries run out the caller gets
//! a friendly message; the raw provider text is only logged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, warn};

const TRANSIENT_SIGNATURES: &[&str] = &[
    "overloaded",
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "429",
    "quota",
    "resource_exhausted",
    "503",
    "temporarily unavailable",
];

/// True when `message` looks like an overload / rate-limit / quota signal.
pub fn is_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let ms = self.base_delay_ms as f64 * self.multiplier.powi(retry as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// A successful result and how many attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error.  `message` is meant for
    /// end users; `last_error` is the raw provider text for logs.
    #[error("{message}")]
    Exhausted {
        attempts: u32,
        message: String,
        last_error: String,
    },

    /// A non-transient error; returned on first occurrence.
    #[error("{0}")]
    Permanent(E),
}

/// Run `op` until it succeeds, fails permanently, or exhausts
/// `policy.max_retries` retries on transient errors.
pub async fn retry_transient<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<Retried<T>, RetryError<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(Retried { value, attempts }),
            Err(e) => {
                let text = e.to_string();
                if !is_transient(&text) {
                    return Err(RetryError::Permanent(e));
                }
                if attempts > policy.max_retries {
                    error!(
                        operation,
                        attempts,
                        error = %text,
                        "transient failures exhausted retries"
                    );
                    return Err(RetryError::Exhausted {
                        attempts,
                        message: format!(
                            "The {operation} service is busy or rate limited right now \
                             (gave up after {attempts} attempts). \
                             Please try again in a few minutes."
                        ),
                        last_error: text,
                    });
                }

                let delay = policy.delay_for_retry(attempts - 1);
                warn!(
                    operation,
                    attempt = attempts,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %text,
                    "transient provider error, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy { max_retries: 3, base_delay_ms: 100, max_delay_ms: 1_000, multiplier: 2.0 }
    }

    #[test]
    fn recognises_transient_signatures() {
        assert!(is_transient("Error 529: Overloaded"));
        assert!(is_transient("HTTP 429 Too Many Requests"));
        assert!(is_transient("RESOURCE_EXHAUSTED: quota exceeded"));
        assert!(is_transient("rate limit reached for requests"));
        assert!(!is_transient("invalid api key"));
        assert!(!is_transient("syntax error at or near SELECT"));
    }

    #[test]
    fn delays_grow_and_cap() {
        let p = policy();
        assert_eq!(p.delay_for_retry(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_retry(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_retry(2), Duration::from_millis(400));
        assert_eq!(p.delay_for_retry(10), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_transient_failures() {
        for k in 0..3u32 {
            let calls = AtomicU32::new(0);
            let out = retry_transient(&policy(), "llm", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < k {
                        Err("503 Service Unavailable: overloaded".to_string())
                    } else {
                        Ok("answer")
                    }
                }
            })
            .await
            .unwrap();

            assert_eq!(out.value, "answer");
            assert_eq!(out.attempts, k + 1);
            assert_eq!(calls.load(Ordering::SeqCst), k + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_yields_friendly_error() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(), "llm", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("429 rate_limit_error: raw provider text".to_string()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            RetryError::Exhausted { attempts, message, last_error } => {
                assert_eq!(attempts, 4);
                assert!(message.contains("llm service is busy"));
                assert!(!message.contains("raw provider text"));
                assert!(last_error.contains("raw provider text"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let err = retry_transient(&policy(), "llm", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>("invalid api key".to_string()) }
        })
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RetryError::Permanent(msg) if msg == "invalid api key"));
    }
}
