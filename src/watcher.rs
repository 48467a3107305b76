//! Completion watcher
//!
//! Follows the checkup Job from submission to a terminal phase:
//!
//! ```text
//! Pending ──started──▶ Running ──Complete──▶ Succeeded
//!    │                    │
//!    │                    ├──Failed────────▶ Failed
//!    └──deadline──────────┴──deadline──────▶ TimedOut
//! ```
//!
//! Each wait for the next Job state is a timed watch bounded by
//! `min(remaining, poll_ceiling)`. Transient platform errors are retried
//! until the run deadline; they never end the watch on their own.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, info, warn};

use crate::retry::{retry_until_deadline, Deadline, RetryConfig};
use crate::workload::job::{
    failed_pod_count, has_started, is_job_complete, is_job_failed, job_failure_message,
    job_failure_reason, REASON_DEADLINE_EXCEEDED,
};
use crate::workload::Platform;
use crate::Error;

/// What a single look at the Job showed
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// No pod is running yet
    NotStarted,
    /// A pod was started
    Started,
    /// `Complete=True`
    Completed,
    /// `Failed=True` or a failed pod, with a description
    Failed(String),
    /// The Job's own active deadline fired
    DeadlineExceeded,
}

impl Observation {
    /// Derive the observation from the Job's status
    pub fn from_job(job: &Job) -> Self {
        if is_job_complete(job) {
            return Observation::Completed;
        }
        if is_job_failed(job) {
            let reason = job_failure_reason(job);
            if reason.as_deref() == Some(REASON_DEADLINE_EXCEEDED) {
                return Observation::DeadlineExceeded;
            }
            let detail = match (reason, job_failure_message(job)) {
                (Some(r), Some(m)) => format!("{r}: {m}"),
                (Some(r), None) => r,
                (None, Some(m)) => m,
                (None, None) => "unknown reason".to_string(),
            };
            return Observation::Failed(format!("checkup job failed: {detail}"));
        }
        if failed_pod_count(job) > 0 {
            return Observation::Failed("checkup pod exited with a failure".to_string());
        }
        if has_started(job) {
            return Observation::Started;
        }
        Observation::NotStarted
    }
}

/// Lifecycle phase of the checkup workload
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkloadPhase {
    /// Submitted, not running yet
    Pending,
    /// A pod is running
    Running,
    /// Completed before the deadline
    Succeeded,
    /// Failed, with the reason
    Failed(String),
    /// The deadline passed before a terminal condition was seen
    TimedOut,
}

impl WorkloadPhase {
    /// Whether the phase absorbs all further observations
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkloadPhase::Succeeded | WorkloadPhase::Failed(_) | WorkloadPhase::TimedOut
        )
    }

    /// Apply an observation.
    ///
    /// A Pending workload that is seen already finished passes through
    /// Running. Terminal phases never change.
    pub fn advance(self, observation: Observation) -> Self {
        match (self, observation) {
            (phase, _) if phase.is_terminal() => phase,
            (WorkloadPhase::Pending, Observation::NotStarted) => WorkloadPhase::Pending,
            (WorkloadPhase::Pending, Observation::Started) => WorkloadPhase::Running,
            (WorkloadPhase::Pending, finished) => WorkloadPhase::Running.advance(finished),
            (WorkloadPhase::Running, Observation::NotStarted | Observation::Started) => {
                WorkloadPhase::Running
            }
            (WorkloadPhase::Running, Observation::Completed) => WorkloadPhase::Succeeded,
            (WorkloadPhase::Running, Observation::Failed(reason)) => WorkloadPhase::Failed(reason),
            (WorkloadPhase::Running, Observation::DeadlineExceeded) => WorkloadPhase::TimedOut,
            (phase, _) => phase,
        }
    }

    /// The run deadline passed
    pub fn expire(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            WorkloadPhase::TimedOut
        }
    }
}

/// Terminal phase plus the last Job state seen
#[derive(Clone, Debug)]
pub struct WatchOutcome {
    /// Terminal phase
    pub phase: WorkloadPhase,
    /// Last observed Job, if any was observed
    pub job: Option<Job>,
}

/// Logs and events gathered after a failed or timed-out run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Diagnostics {
    /// Pod log tails, if they could be read
    pub logs: Option<String>,
    /// Event lines for the Job and its pods
    pub events: Vec<String>,
}

/// Watches one checkup Job until it reaches a terminal phase
pub struct Watcher {
    platform: Arc<dyn Platform>,
    namespace: String,
    deadline: Deadline,
    poll_ceiling: Duration,
    retry: RetryConfig,
}

impl Watcher {
    /// Create a watcher for Jobs in `namespace` bounded by `deadline`
    pub fn new(
        platform: Arc<dyn Platform>,
        namespace: impl Into<String>,
        deadline: Deadline,
        poll_ceiling: Duration,
    ) -> Self {
        let retry = RetryConfig {
            // An attempt must outlive the wait it carries.
            attempt_timeout: poll_ceiling + Duration::from_secs(10),
            ..RetryConfig::default()
        };
        Self {
            platform,
            namespace: namespace.into(),
            deadline,
            poll_ceiling,
            retry,
        }
    }

    /// Follow the Job until Succeeded, Failed or TimedOut
    pub async fn watch(&self, job_name: &str) -> WatchOutcome {
        let mut phase = WorkloadPhase::Pending;
        let mut last_job = None;

        while !phase.is_terminal() {
            if self.deadline.expired() {
                phase = self.transition(job_name, phase, None);
                break;
            }

            let waited = retry_until_deadline(
                &self.retry,
                &self.deadline,
                "watch_job",
                Error::is_transient,
                || {
                    let wait = self.deadline.bounded(self.poll_ceiling);
                    self.platform.wait_job(&self.namespace, job_name, wait)
                },
            )
            .await;

            let observation = match waited {
                Ok(Some(job)) => {
                    let observation = Observation::from_job(&job);
                    last_job = Some(job);
                    observation
                }
                Ok(None) => Observation::Failed(format!(
                    "checkup job {job_name} disappeared before completing"
                )),
                Err(e) if e.is_transient() && self.deadline.expired() => {
                    warn!(job = %job_name, error = %e, "Lost track of the checkup job at the deadline");
                    Observation::NotStarted
                }
                Err(e) => Observation::Failed(format!("failed to watch checkup job: {e}")),
            };

            phase = self.transition(job_name, phase, Some(observation));
        }

        if let Some(job) = &last_job {
            debug!(
                job = %job_name,
                status = %serde_json::to_string(&job.status).unwrap_or_default(),
                "Final checkup job status"
            );
        }

        WatchOutcome {
            phase,
            job: last_job,
        }
    }

    fn transition(
        &self,
        job_name: &str,
        phase: WorkloadPhase,
        observation: Option<Observation>,
    ) -> WorkloadPhase {
        let before = phase.clone();
        // Success only counts if seen strictly before the deadline.
        let next = match observation {
            Some(obs @ (Observation::Failed(_) | Observation::DeadlineExceeded)) => {
                phase.advance(obs)
            }
            Some(obs) if !self.deadline.expired() => phase.advance(obs),
            _ => phase.expire(),
        };

        if next != before {
            info!(job = %job_name, from = ?before, to = ?next, "Checkup workload phase changed");
        }
        next
    }

    /// Gather logs and events for a Job that did not succeed.
    ///
    /// Bounded by `timeout` regardless of the run deadline, which has usually
    /// passed by the time this is called for a timed-out run.
    pub async fn collect_diagnostics(&self, job_name: &str, timeout: Duration) -> Diagnostics {
        let gather = async {
            let logs = match self.platform.workload_logs(&self.namespace, job_name).await {
                Ok(logs) => Some(logs),
                Err(e) => {
                    warn!(job = %job_name, error = %e, "Failed to collect checkup logs");
                    None
                }
            };
            let events = self
                .platform
                .workload_events(&self.namespace, job_name)
                .await
                .unwrap_or_else(|e| {
                    warn!(job = %job_name, error = %e, "Failed to collect checkup events");
                    Vec::new()
                });
            Diagnostics { logs, events }
        };

        let diagnostics = match tokio::time::timeout(timeout, gather).await {
            Ok(d) => d,
            Err(_) => {
                warn!(job = %job_name, "Collecting checkup diagnostics timed out");
                Diagnostics::default()
            }
        };

        for event in &diagnostics.events {
            warn!(job = %job_name, event = %event, "Checkup event");
        }
        if let Some(logs) = &diagnostics.logs {
            warn!(job = %job_name, "Checkup logs:\n{}", logs);
        }
        diagnostics
    }
}
