//! Checkup Job construction and status helpers
//!
//! Builds the single-shot Kubernetes Job that runs the diagnostic image.
//! The Job:
//! - Runs one `checkup` container with `imagePullPolicy: Always`
//! - Runs as the caller-supplied service account
//! - Never restarts (`restartPolicy: Never`, `backoffLimit: 0`)
//! - Is bounded by `activeDeadlineSeconds` equal to the checkup timeout
//! - Receives the results ConfigMap location and the checkup params as env vars

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobCondition, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::{CheckupSpec, StoreRef};

/// Env var carrying the results ConfigMap namespace
pub const RESULTS_CONFIGMAP_NAMESPACE_ENV: &str = "RESULT_CONFIGMAP_NAMESPACE";
/// Env var carrying the results ConfigMap name
pub const RESULTS_CONFIGMAP_NAME_ENV: &str = "RESULT_CONFIGMAP_NAME";

/// Label marking objects created by the framework
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kiagnose";
/// Label carrying the name of the Store ConfigMap the run belongs to
pub const CHECKUP_LABEL: &str = "kiagnose.io/checkup";
/// Label the Job controller puts on the Job's pods
pub const JOB_NAME_LABEL: &str = "job-name";

/// Job condition types and the reason set when `activeDeadlineSeconds` fires
pub const CONDITION_COMPLETE: &str = "Complete";
/// The "Failed" condition type for Jobs
pub const CONDITION_FAILED: &str = "Failed";
/// Reason on the Failed condition when the Job ran past its active deadline
pub const REASON_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";
const STATUS_TRUE: &str = "True";

const CONTAINER_NAME: &str = "checkup";
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 5;

/// `generateName` prefix for the checkup Job of a given Store
pub fn job_name_prefix(store: &StoreRef) -> String {
    generate_name_prefix(&store.name, "checkup")
}

/// Build a `<base>-<suffix>-` prefix that leaves room for the random part.
pub(crate) fn generate_name_prefix(base: &str, suffix: &str) -> String {
    // 63 chars max, minus 5 random chars, minus separators.
    const MAX_PREFIX: usize = 63 - 5;
    let mut prefix = format!("{}-{}-", base, suffix);
    if prefix.len() > MAX_PREFIX {
        let keep = MAX_PREFIX - suffix.len() - 2;
        let trimmed: String = base.chars().take(keep).collect();
        prefix = format!("{}-{}-", trimmed.trim_end_matches('-'), suffix);
    }
    prefix
}

/// Labels shared by every object a run creates
pub fn checkup_labels(store: &StoreRef) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CHECKUP_LABEL.to_string(), store.name.clone()),
    ])
}

/// Round a timeout up to whole seconds for `activeDeadlineSeconds`.
fn active_deadline_seconds(timeout: Duration) -> i64 {
    let mut secs = timeout.as_secs();
    if timeout.subsec_nanos() > 0 {
        secs += 1;
    }
    i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
}

/// Build the checkup Job for `spec` in the Store's namespace.
///
/// `results_configmap` names the per-run results ConfigMap the payload
/// writes to.
pub fn build_checkup_job(spec: &CheckupSpec, store: &StoreRef, results_configmap: &str) -> Job {
    let labels = checkup_labels(store);

    let mut env = vec![
        EnvVar {
            name: RESULTS_CONFIGMAP_NAMESPACE_ENV.to_string(),
            value: Some(store.namespace.clone()),
            ..Default::default()
        },
        EnvVar {
            name: RESULTS_CONFIGMAP_NAME_ENV.to_string(),
            value: Some(results_configmap.to_string()),
            ..Default::default()
        },
    ];
    env.extend(spec.param_env_vars());

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        env: Some(env),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            generate_name: Some(job_name_prefix(store)),
            namespace: Some(store.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            active_deadline_seconds: Some(active_deadline_seconds(spec.timeout)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(spec.service_account_name.clone()),
                    restart_policy: Some("Never".to_string()),
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn true_condition<'a>(job: &'a Job, type_: &str) -> Option<&'a JobCondition> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == type_ && c.status == STATUS_TRUE)
        })
}

/// Check if a Job has completed successfully
pub fn is_job_complete(job: &Job) -> bool {
    true_condition(job, CONDITION_COMPLETE).is_some()
}

/// Check if a Job has failed
pub fn is_job_failed(job: &Job) -> bool {
    true_condition(job, CONDITION_FAILED).is_some()
}

/// Check if a Job reached either terminal condition
pub fn is_job_finished(job: &Job) -> bool {
    is_job_complete(job) || is_job_failed(job)
}

/// Reason of the Failed condition, e.g. `BackoffLimitExceeded`
pub fn job_failure_reason(job: &Job) -> Option<String> {
    true_condition(job, CONDITION_FAILED).and_then(|c| c.reason.clone())
}

/// Extract failure message from a failed Job
pub fn job_failure_message(job: &Job) -> Option<String> {
    true_condition(job, CONDITION_FAILED).and_then(|c| c.message.clone())
}

/// Number of pods that ended in failure
pub fn failed_pod_count(job: &Job) -> i32 {
    job.status.as_ref().and_then(|s| s.failed).unwrap_or(0)
}

/// Whether the Job has started running a pod
pub fn has_started(job: &Job) -> bool {
    job.status
        .as_ref()
        .map(|s| {
            s.active.unwrap_or(0) > 0
                || s.start_time.is_some()
                || s.succeeded.unwrap_or(0) > 0
                || s.failed.unwrap_or(0) > 0
        })
        .unwrap_or(false)
}
