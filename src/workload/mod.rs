//! Workload launcher
//!
//! Turns a validated [`CheckupSpec`] into objects in the target namespace:
//! - A results ConfigMap the payload writes its verdict into
//! - A Role and RoleBinding letting the checkup service account update it
//! - Exactly one single-shot Job running the checkup image
//!
//! The target namespace is the Store's namespace. Anything created before a
//! failed step is removed again so a rejected launch leaves nothing behind.

pub mod job;
pub mod platform;
pub mod results;

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{CheckupSpec, StoreRef};
use crate::retry::{retry_until_deadline, Deadline, RetryConfig};
use crate::Error;

pub use job::build_checkup_job;
pub use platform::{KubePlatform, Platform};
pub use results::PayloadResults;

/// Object created alongside the Job and torn down after the run
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubResource {
    /// The per-run results ConfigMap
    ConfigMap(String),
    /// The results writer Role
    Role(String),
    /// Binding of the writer Role to the checkup service account
    RoleBinding(String),
}

impl SubResource {
    /// Name of the object
    pub fn name(&self) -> &str {
        match self {
            SubResource::ConfigMap(name)
            | SubResource::Role(name)
            | SubResource::RoleBinding(name) => name,
        }
    }

    /// Kubernetes kind of the object
    pub fn kind(&self) -> &'static str {
        match self {
            SubResource::ConfigMap(_) => "ConfigMap",
            SubResource::Role(_) => "Role",
            SubResource::RoleBinding(_) => "RoleBinding",
        }
    }
}

impl fmt::Display for SubResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind(), self.name())
    }
}

/// What a successful launch created
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    /// Namespace everything was created in
    pub namespace: String,
    /// Generated name of the checkup Job
    pub job_name: String,
    /// Generated name of the results ConfigMap
    pub results_configmap: String,
    /// Objects to delete once the run is over, in creation order
    pub sub_resources: Vec<SubResource>,
}

/// Submits the checkup workload
pub struct Launcher {
    platform: Arc<dyn Platform>,
    retry: RetryConfig,
}

impl Launcher {
    /// Create a launcher over the given platform
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            retry: RetryConfig::default(),
        }
    }

    /// Override the backoff used for the service account lookup
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Launch the checkup described by `spec` next to the Store.
    ///
    /// Fails with [`Error::Launch`] when the service account does not exist
    /// or any object is rejected. Creation calls are not retried: objects
    /// use generated names, so a retried create could leave duplicates.
    pub async fn launch(
        &self,
        spec: &CheckupSpec,
        store: &StoreRef,
        deadline: &Deadline,
    ) -> Result<Submission, Error> {
        let namespace = store.namespace.as_str();
        let sa = spec.service_account_name.as_str();

        let sa_exists = retry_until_deadline(
            &self.retry,
            deadline,
            "lookup_service_account",
            Error::is_transient,
            || self.platform.service_account_exists(namespace, sa),
        )
        .await
        .map_err(|e| Error::launch(format!("failed to look up service account {sa}: {e}")))?;

        if !sa_exists {
            return Err(Error::launch(format!(
                "service account {}/{} not found",
                namespace, sa
            )));
        }

        let mut created = Vec::new();
        match self.create_all(spec, store, &mut created).await {
            Ok(submission) => {
                info!(
                    namespace = %namespace,
                    job = %submission.job_name,
                    results = %submission.results_configmap,
                    image = %spec.image,
                    "Checkup workload launched"
                );
                Ok(submission)
            }
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    error = %e,
                    created = created.len(),
                    "Launch failed, removing what was created"
                );
                self.rollback(namespace, &created).await;
                Err(Error::launch(e.to_string()))
            }
        }
    }

    async fn create_all(
        &self,
        spec: &CheckupSpec,
        store: &StoreRef,
        created: &mut Vec<SubResource>,
    ) -> Result<Submission, Error> {
        let namespace = store.namespace.as_str();

        let cm = self
            .platform
            .create_config_map(namespace, results::build_results_config_map(store))
            .await?;
        let results_configmap = generated_name(cm.metadata.name, "results ConfigMap")?;
        created.push(SubResource::ConfigMap(results_configmap.clone()));

        let role = self
            .platform
            .create_role(
                namespace,
                results::build_results_writer_role(store, &results_configmap),
            )
            .await?;
        let role_name = generated_name(role.metadata.name, "results writer Role")?;
        created.push(SubResource::Role(role_name.clone()));

        let binding = self
            .platform
            .create_role_binding(
                namespace,
                results::build_results_writer_binding(
                    store,
                    &role_name,
                    &spec.service_account_name,
                ),
            )
            .await?;
        let binding_name = generated_name(binding.metadata.name, "results writer RoleBinding")?;
        created.push(SubResource::RoleBinding(binding_name));

        let job = self
            .platform
            .create_job(namespace, build_checkup_job(spec, store, &results_configmap))
            .await?;
        let job_name = generated_name(job.metadata.name, "checkup Job")?;

        Ok(Submission {
            namespace: namespace.to_string(),
            job_name,
            results_configmap,
            sub_resources: created.clone(),
        })
    }

    async fn rollback(&self, namespace: &str, created: &[SubResource]) {
        for resource in created.iter().rev() {
            if let Err(e) = self.platform.delete_sub_resource(namespace, resource).await {
                warn!(resource = %resource, error = %e, "Failed to remove object after launch failure");
            }
        }
    }
}

fn generated_name(name: Option<String>, what: &str) -> Result<String, Error> {
    name.ok_or_else(|| Error::launch(format!("{what} was created without a name")))
}
