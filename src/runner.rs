//! One checkup run, from Store snapshot to terminal status
//!
//! ```text
//! snapshot → parse → deadline → start → launch → watch → verdict → teardown → report
//! ```
//!
//! Every error after the spec is parsed ends in exactly one terminal report.
//! Only an unreadable Store, a Store that belongs to an earlier run, or a
//! failed terminal write leave the Store without `status.succeeded`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::config::{CheckupSpec, StoreRef};
use crate::duration::format_duration;
use crate::reporter::{CheckupStatus, Reporter, DEFAULT_REPORT_GRACE};
use crate::retry::{retry_until_deadline, Deadline, RetryConfig};
use crate::store::Store;
use crate::watcher::{Watcher, WorkloadPhase};
use crate::workload::{Launcher, PayloadResults, Platform, Submission};
use crate::Error;

/// Timing knobs of a run
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Longest single wait for the Job to change
    pub poll_ceiling: Duration,
    /// Budget for reading the Store before the spec timeout is known
    pub startup_timeout: Duration,
    /// Time for the terminal write, counted from the run deadline or from
    /// the moment of writing, whichever is later
    pub report_grace: Duration,
    /// Budget for collecting logs and events of a failed run
    pub diagnostics_timeout: Duration,
    /// Budget for reading payload results after success
    pub results_timeout: Duration,
    /// Budget for deleting the run's sub-resources
    pub teardown_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_ceiling: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
            report_grace: DEFAULT_REPORT_GRACE,
            diagnostics_timeout: Duration::from_secs(20),
            results_timeout: Duration::from_secs(20),
            teardown_timeout: Duration::from_secs(30),
        }
    }
}

/// How a run ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The terminal status was written to the Store
    Reported(CheckupStatus),
    /// Nothing terminal could be written
    Unreported {
        /// Why the Store holds no terminal status
        reason: String,
    },
}

impl RunOutcome {
    /// Process exit code: 0 success, 1 reported failure, 2 unreported
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Reported(status) if status.succeeded() => 0,
            RunOutcome::Reported(_) => 1,
            RunOutcome::Unreported { .. } => 2,
        }
    }

    fn unreported(reason: impl Into<String>) -> Self {
        RunOutcome::Unreported {
            reason: reason.into(),
        }
    }
}

/// Orchestrates a single checkup run
pub struct Runner {
    store: Arc<dyn Store>,
    platform: Arc<dyn Platform>,
    store_ref: StoreRef,
    config: RunnerConfig,
}

impl Runner {
    /// Create a runner for the checkup described in `store_ref`
    pub fn new(
        store: Arc<dyn Store>,
        platform: Arc<dyn Platform>,
        store_ref: StoreRef,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            platform,
            store_ref,
            config,
        }
    }

    /// Execute the run and report its terminal status
    pub async fn run(&self) -> RunOutcome {
        info!(store = %self.store_ref, "Starting checkup");

        let startup = Deadline::after(self.config.startup_timeout);
        let data = match retry_until_deadline(
            &RetryConfig::default(),
            &startup,
            "read_store",
            Error::is_transient,
            || self.store.snapshot(),
        )
        .await
        {
            Ok(data) => data,
            Err(e) => {
                error!(store = %self.store_ref, error = %e, "Cannot read checkup spec");
                return RunOutcome::unreported(format!("failed to read Store: {e}"));
            }
        };

        let reporter = Reporter::new(self.store.clone()).with_grace(self.config.report_grace);

        let spec = match CheckupSpec::from_data(&data) {
            Ok(spec) => spec,
            Err(Error::AlreadyInUse) => {
                error!(store = %self.store_ref, "Store already holds status of an earlier run");
                return RunOutcome::unreported(Error::AlreadyInUse.to_string());
            }
            Err(e) => {
                error!(store = %self.store_ref, error = %e, "Invalid checkup spec");
                return self
                    .finish(&reporter, CheckupStatus::failed(e.to_string()), &startup)
                    .await;
            }
        };

        let deadline = Deadline::after(spec.timeout);
        info!(
            image = %spec.image,
            timeout = %format_duration(spec.timeout),
            service_account = %spec.service_account_name,
            params = spec.params.len(),
            "Checkup spec accepted"
        );

        match reporter.report_start(&deadline).await {
            Ok(()) => {}
            Err(Error::StatusAlreadyWritten(key)) => {
                error!(key = %key, "Another run claimed the Store");
                return RunOutcome::unreported(Error::AlreadyInUse.to_string());
            }
            Err(e) => {
                return self
                    .finish(
                        &reporter,
                        CheckupStatus::failed(format!("failed to record start: {e}")),
                        &deadline,
                    )
                    .await;
            }
        }

        let launcher = Launcher::new(self.platform.clone());
        let submission = match launcher.launch(&spec, &self.store_ref, &deadline).await {
            Ok(submission) => submission,
            Err(e) => {
                error!(error = %e, "Failed to launch checkup workload");
                return self
                    .finish(&reporter, CheckupStatus::failed(e.to_string()), &deadline)
                    .await;
            }
        };

        let status = self.supervise(&spec, &submission, &deadline).await;
        self.teardown(&submission).await;
        self.finish(&reporter, status, &deadline).await
    }

    async fn supervise(
        &self,
        spec: &CheckupSpec,
        submission: &Submission,
        deadline: &Deadline,
    ) -> CheckupStatus {
        let watcher = Watcher::new(
            self.platform.clone(),
            &submission.namespace,
            *deadline,
            self.config.poll_ceiling,
        );

        let outcome = watcher.watch(&submission.job_name).await;
        match outcome.phase {
            WorkloadPhase::Succeeded => self.payload_verdict(submission).await,
            WorkloadPhase::Failed(reason) => {
                watcher
                    .collect_diagnostics(&submission.job_name, self.config.diagnostics_timeout)
                    .await;
                CheckupStatus::failed(reason)
            }
            WorkloadPhase::TimedOut => {
                watcher
                    .collect_diagnostics(&submission.job_name, self.config.diagnostics_timeout)
                    .await;
                let err = Error::timeout(format!(
                    "checkup did not complete within {}",
                    format_duration(spec.timeout)
                ));
                CheckupStatus::timed_out(err.to_string())
            }
            // watch() only returns terminal phases
            WorkloadPhase::Pending | WorkloadPhase::Running => {
                CheckupStatus::failed("checkup watch ended before a terminal phase")
            }
        }
    }

    async fn payload_verdict(&self, submission: &Submission) -> CheckupStatus {
        let budget = Deadline::after(self.config.results_timeout);
        let data = retry_until_deadline(
            &RetryConfig::default(),
            &budget,
            "read_results",
            Error::is_transient,
            || {
                self.platform
                    .read_config_map_data(&submission.namespace, &submission.results_configmap)
            },
        )
        .await;

        match data {
            Ok(data) => match PayloadResults::from_data(&data.unwrap_or_default()) {
                PayloadResults::Succeeded { results } => CheckupStatus::Succeeded { results },
                PayloadResults::Failed { reason } => CheckupStatus::failed(reason),
            },
            Err(e) => CheckupStatus::failed(format!("failed to read checkup results: {e}")),
        }
    }

    /// Delete the run's sub-resources; the Job stays for the caller to inspect.
    async fn teardown(&self, submission: &Submission) {
        let delete_all = async {
            for resource in submission.sub_resources.iter().rev() {
                if let Err(e) = self
                    .platform
                    .delete_sub_resource(&submission.namespace, resource)
                    .await
                {
                    warn!(resource = %resource, error = %e, "Failed to delete checkup sub-resource");
                }
            }
        };

        if tokio::time::timeout(self.config.teardown_timeout, delete_all)
            .await
            .is_err()
        {
            warn!(job = %submission.job_name, "Teardown of checkup sub-resources timed out");
        }
    }

    async fn finish(
        &self,
        reporter: &Reporter,
        status: CheckupStatus,
        deadline: &Deadline,
    ) -> RunOutcome {
        match reporter.report(&status, deadline).await {
            Ok(()) => {
                match &status {
                    CheckupStatus::Succeeded { .. } => info!("Checkup succeeded"),
                    CheckupStatus::Failed { reason } | CheckupStatus::TimedOut { reason } => {
                        warn!(reason = %reason, "Checkup failed")
                    }
                }
                RunOutcome::Reported(status)
            }
            Err(e) => RunOutcome::unreported(format!("failed to write terminal status: {e}")),
        }
    }
}
