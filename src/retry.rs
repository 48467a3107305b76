//! Run deadline and retry with exponential backoff under that deadline.
//!
//! Every blocking wait in a checkup run is bounded by a single [`Deadline`]
//! derived from `spec.timeout`. Operations against the platform that may fail
//! transiently go through [`retry_until_deadline`], which retries with
//! jittered exponential backoff until the operation succeeds, fails fatally,
//! or the deadline expires.
//!
//! # Example
//!
//! ```ignore
//! use kiagnose::retry::{retry_until_deadline, Deadline, RetryConfig};
//!
//! let deadline = Deadline::from_timeout("5m")?;
//! let data = retry_until_deadline(
//!     &RetryConfig::default(),
//!     &deadline,
//!     "read_store",
//!     kiagnose::Error::is_transient,
//!     || async { store.snapshot().await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::duration::{format_duration, parse_duration};
use crate::Error;

/// Deadlines further out are clamped so instant arithmetic cannot overflow.
const MAX_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn instant_after(start: Instant, budget: Duration) -> Instant {
    start + budget.min(MAX_HORIZON)
}

/// Absolute point in time bounding a checkup run.
///
/// Fixed at construction and never extended. Cheap to copy so the watcher
/// and the reporter can each hold one.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now, clamped to a century
    pub fn after(budget: Duration) -> Self {
        Self {
            at: instant_after(Instant::now(), budget),
            budget,
        }
    }

    /// Deadline from a timeout string such as `"5m"` or `"30s"`
    pub fn from_timeout(timeout: &str) -> Result<Self, Error> {
        Ok(Self::after(parse_duration(timeout)?))
    }

    /// A deadline `grace` past this one, or past now if this one has expired.
    ///
    /// Used for the final status write so that a run which timed out can still
    /// report it, however long diagnostics and teardown took. The original
    /// deadline is left untouched.
    pub fn with_grace(&self, grace: Duration) -> Self {
        let now = Instant::now();
        let start = self.at.max(now);
        Self {
            at: instant_after(start, grace),
            budget: self
                .budget
                .saturating_add(start.saturating_duration_since(self.at))
                .saturating_add(grace),
        }
    }

    /// Total budget this deadline was created with
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the deadline, zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// `min(remaining, ceiling)`: the longest a single wait may block
    pub fn bounded(&self, ceiling: Duration) -> Duration {
        self.remaining().min(ceiling)
    }
}

/// Backoff settings for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound for a single attempt, further capped by the deadline
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

/// Run `operation` until it succeeds, fails fatally, or `deadline` expires.
///
/// `classify` decides whether an error is transient (retry) or fatal (return
/// immediately). Each attempt is bounded by
/// `deadline.bounded(config.attempt_timeout)`; an attempt that overruns is
/// treated as a transient failure. At least one attempt is always made, so a
/// caller holding an already-expired deadline still gets one try. Once the
/// deadline expires the last error is returned.
pub async fn retry_until_deadline<F, Fut, T, C>(
    config: &RetryConfig,
    deadline: &Deadline,
    operation_name: &str,
    classify: C,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    C: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        // The first attempt keeps the full ceiling even past the deadline.
        let attempt_budget = if attempt == 1 && deadline.expired() {
            config.attempt_timeout
        } else {
            deadline.bounded(config.attempt_timeout)
        };

        let outcome = match tokio::time::timeout(attempt_budget, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::transient(format!(
                "{} did not complete within {}",
                operation_name,
                format_duration(attempt_budget)
            ))),
        };

        let e = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !classify(&e) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed with a non-retryable error"
            );
            return Err(e);
        }

        if deadline.expired() {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Operation failed and the deadline has expired"
            );
            return Err(e);
        }

        // Add jitter: 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered_delay =
            deadline.bounded(Duration::from_secs_f64(delay.as_secs_f64() * jitter));

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            remaining_ms = deadline.remaining().as_millis(),
            "Operation failed, retrying"
        );

        tokio::time::sleep(jittered_delay).await;

        // Exponential backoff, capped at max_delay
        delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * config.backoff_multiplier).min(config.max_delay.as_secs_f64()),
        );
    }
}
