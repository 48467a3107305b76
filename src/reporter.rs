//! Result reporter
//!
//! Writes the run's status back into the Store:
//! - `status.startTimestamp` once the spec is accepted
//! - The terminal status in one batch: `status.succeeded`,
//!   `status.failureReason` or `status.result.*`, `status.completionTimestamp`
//!
//! The terminal batch is attempted once per run, retried on transient errors
//! until the run deadline plus a grace period.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use tracing::{error, info};

use crate::config::{
    COMPLETION_TIMESTAMP_KEY, FAILURE_REASON_KEY, RESULT_KEY_PREFIX, START_TIMESTAMP_KEY,
    SUCCEEDED_KEY,
};
use crate::retry::{retry_until_deadline, Deadline, RetryConfig};
use crate::store::Store;
use crate::Error;

/// Extra time granted to the terminal write past the run deadline
pub const DEFAULT_REPORT_GRACE: Duration = Duration::from_secs(30);

/// Terminal status of a checkup run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckupStatus {
    /// The payload succeeded; results keyed without the `status.result.` prefix
    Succeeded {
        /// Payload results, written verbatim
        results: BTreeMap<String, String>,
    },
    /// The run failed
    Failed {
        /// Human-readable reason
        reason: String,
    },
    /// The deadline passed before the workload finished
    TimedOut {
        /// Human-readable reason, always mentions the timeout
        reason: String,
    },
}

impl CheckupStatus {
    /// A failure; an empty reason is replaced with a generic one
    pub fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let reason = if reason.trim().is_empty() {
            "checkup failed".to_string()
        } else {
            reason
        };
        CheckupStatus::Failed { reason }
    }

    /// A timeout; the reason is prefixed unless it already says so
    pub fn timed_out(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let reason = if detail.to_lowercase().contains("timeout") {
            detail
        } else {
            format!("timeout: {}", detail)
        };
        CheckupStatus::TimedOut { reason }
    }

    /// Whether this is a success
    pub fn succeeded(&self) -> bool {
        matches!(self, CheckupStatus::Succeeded { .. })
    }

    /// Store entries for this status, stamped with `completed_at`
    pub fn to_entries(&self, completed_at: &str) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        entries.insert(SUCCEEDED_KEY.to_string(), self.succeeded().to_string());
        entries.insert(COMPLETION_TIMESTAMP_KEY.to_string(), completed_at.to_string());

        match self {
            CheckupStatus::Succeeded { results } => {
                for (name, value) in results {
                    entries.insert(format!("{}{}", RESULT_KEY_PREFIX, name), value.clone());
                }
            }
            CheckupStatus::Failed { reason } | CheckupStatus::TimedOut { reason } => {
                entries.insert(FAILURE_REASON_KEY.to_string(), reason.clone());
            }
        }
        entries
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Writes run status into the Store
pub struct Reporter {
    store: Arc<dyn Store>,
    retry: RetryConfig,
    grace: Duration,
    reported: AtomicBool,
}

impl Reporter {
    /// Create a reporter writing to `store`
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
            grace: DEFAULT_REPORT_GRACE,
            reported: AtomicBool::new(false),
        }
    }

    /// Override the grace period past the run deadline
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Record that the run started
    pub async fn report_start(&self, deadline: &Deadline) -> Result<(), Error> {
        let started_at = timestamp();
        retry_until_deadline(
            &self.retry,
            deadline,
            "report_start",
            Error::is_transient,
            || self.store.write(START_TIMESTAMP_KEY, &started_at),
        )
        .await?;
        info!(started_at = %started_at, "Checkup start reported");
        Ok(())
    }

    /// Write the terminal status.
    ///
    /// Refused with [`Error::AlreadyReported`] on a second call. The batch is
    /// built once, so retried writes carry identical values and the Store's
    /// write-once check treats a retry after an unacknowledged success as a
    /// no-op.
    pub async fn report(&self, status: &CheckupStatus, deadline: &Deadline) -> Result<(), Error> {
        if self.reported.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyReported);
        }

        let report_deadline = deadline.with_grace(self.grace);
        let entries = status.to_entries(&timestamp());

        let result = retry_until_deadline(
            &self.retry,
            &report_deadline,
            "report_status",
            Error::is_transient,
            || self.store.write_batch(entries.clone()),
        )
        .await;

        match &result {
            Ok(()) => info!(
                succeeded = status.succeeded(),
                keys = entries.len(),
                "Checkup status reported"
            ),
            Err(e) => error!(
                error = %e,
                succeeded = status.succeeded(),
                "Failed to report checkup status, the Store holds no terminal status"
            ),
        }
        result
    }
}
