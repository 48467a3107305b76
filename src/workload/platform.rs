//! Narrow interface to the cluster a checkup runs in
//!
//! The framework treats the platform as an opaque job-execution substrate:
//! submit objects, wait for the Job to change, read logs and events, delete
//! what it created. [`KubePlatform`] is the kube-rs implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Event, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use super::job::{is_job_finished, JOB_NAME_LABEL};
use super::SubResource;
use crate::Error;

/// Server-side watch timeouts must stay below 295 seconds.
const MAX_WATCH_TIMEOUT_SECS: u64 = 290;

/// Log lines kept per pod when collecting diagnostics
const LOG_TAIL_LINES: i64 = 200;

/// Trait abstracting the cluster operations a checkup run needs
///
/// This trait allows mocking the cluster in tests while using the real
/// client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Whether the service account exists in the namespace
    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Create a ConfigMap, returning it with its generated name
    async fn create_config_map(&self, namespace: &str, cm: ConfigMap) -> Result<ConfigMap, Error>;

    /// Create a Role, returning it with its generated name
    async fn create_role(&self, namespace: &str, role: Role) -> Result<Role, Error>;

    /// Create a RoleBinding, returning it with its generated name
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: RoleBinding,
    ) -> Result<RoleBinding, Error>;

    /// Create a Job, returning it with its generated name
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, Error>;

    /// Data of a ConfigMap, `None` if it does not exist
    async fn read_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Wait up to `timeout` for the Job to change.
    ///
    /// # Returns
    ///
    /// The latest state of the Job when it changed, finished, or the wait
    /// elapsed; `None` if the Job no longer exists.
    async fn wait_job(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, Error>;

    /// Tail of the logs of every pod the Job created
    async fn workload_logs(&self, namespace: &str, job_name: &str) -> Result<String, Error>;

    /// Events about the Job and its pods, one line each
    async fn workload_events(&self, namespace: &str, job_name: &str) -> Result<Vec<String>, Error>;

    /// Delete an object created for the run; already-gone objects are fine
    async fn delete_sub_resource(&self, namespace: &str, resource: &SubResource)
        -> Result<(), Error>;
}

/// Real Kubernetes platform implementation
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    /// Create a new KubePlatform wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn created_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("<unnamed>")
}

#[async_trait]
impl Platform for KubePlatform {
    async fn service_account_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<ServiceAccount> = self.api(namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_config_map(&self, namespace: &str, cm: ConfigMap) -> Result<ConfigMap, Error> {
        let api: Api<ConfigMap> = self.api(namespace);
        let created = api.create(&PostParams::default(), &cm).await?;
        debug!(namespace = %namespace, name = %created_name(&created.metadata), "Created ConfigMap");
        Ok(created)
    }

    async fn create_role(&self, namespace: &str, role: Role) -> Result<Role, Error> {
        let api: Api<Role> = self.api(namespace);
        let created = api.create(&PostParams::default(), &role).await?;
        debug!(namespace = %namespace, name = %created_name(&created.metadata), "Created Role");
        Ok(created)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: RoleBinding,
    ) -> Result<RoleBinding, Error> {
        let api: Api<RoleBinding> = self.api(namespace);
        let created = api.create(&PostParams::default(), &binding).await?;
        debug!(namespace = %namespace, name = %created_name(&created.metadata), "Created RoleBinding");
        Ok(created)
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, Error> {
        let api: Api<Job> = self.api(namespace);
        let created = api.create(&PostParams::default(), &job).await?;
        debug!(namespace = %namespace, name = %created_name(&created.metadata), "Created Job");
        Ok(created)
    }

    async fn read_config_map_data(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        let api: Api<ConfigMap> = self.api(namespace);
        Ok(api
            .get_opt(name)
            .await?
            .map(|cm| cm.data.unwrap_or_default()))
    }

    async fn wait_job(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, Error> {
        let api: Api<Job> = self.api(namespace);

        let Some(current) = api.get_opt(name).await? else {
            return Ok(None);
        };
        if is_job_finished(&current) || timeout.is_zero() {
            return Ok(Some(current));
        }

        let resource_version = current.metadata.resource_version.clone().unwrap_or_default();
        let server_timeout = timeout.as_secs().clamp(1, MAX_WATCH_TIMEOUT_SECS) as u32;
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(server_timeout);

        let mut stream = api.watch(&params, &resource_version).await?.boxed();
        let until = tokio::time::Instant::now() + timeout;

        loop {
            let event = match tokio::time::timeout_at(until, stream.try_next()).await {
                Err(_) => return Ok(Some(current)),
                Ok(event) => event?,
            };

            match event {
                Some(WatchEvent::Added(job)) | Some(WatchEvent::Modified(job)) => {
                    return Ok(Some(job));
                }
                Some(WatchEvent::Deleted(_)) => return Ok(None),
                Some(WatchEvent::Bookmark(_)) => continue,
                Some(WatchEvent::Error(e)) => {
                    // Usually 410 Gone after compaction; the caller re-subscribes.
                    return Err(Error::transient(format!(
                        "watch of job {}/{} failed: {:?}",
                        namespace, name, e
                    )));
                }
                // Server closed the watch: report what we have.
                None => return Ok(Some(current)),
            }
        }
    }

    async fn workload_logs(&self, namespace: &str, job_name: &str) -> Result<String, Error> {
        let pods: Api<Pod> = self.api(namespace);
        let list = pods
            .list(&ListParams::default().labels(&format!("{}={}", JOB_NAME_LABEL, job_name)))
            .await?;

        let params = LogParams {
            tail_lines: Some(LOG_TAIL_LINES),
            ..Default::default()
        };

        let mut out = String::new();
        for pod in list.items {
            let Some(pod_name) = pod.metadata.name else {
                continue;
            };
            out.push_str(&format!("--- pod {} ---\n", pod_name));
            match pods.logs(&pod_name, &params).await {
                Ok(logs) => out.push_str(&logs),
                Err(e) => {
                    warn!(pod = %pod_name, error = %e, "Failed to read pod logs");
                    out.push_str(&format!("<logs unavailable: {}>\n", e));
                }
            }
        }
        Ok(out)
    }

    async fn workload_events(&self, namespace: &str, job_name: &str) -> Result<Vec<String>, Error> {
        let api: Api<Event> = self.api(namespace);
        let events = api.list(&ListParams::default()).await?;
        let pod_prefix = format!("{}-", job_name);

        Ok(events
            .items
            .into_iter()
            .filter(|event| {
                event
                    .involved_object
                    .name
                    .as_deref()
                    .is_some_and(|n| n == job_name || n.starts_with(&pod_prefix))
            })
            .map(|event| {
                format!(
                    "{} {}/{} {}: {}",
                    event.type_.unwrap_or_default(),
                    event.involved_object.kind.unwrap_or_default(),
                    event.involved_object.name.unwrap_or_default(),
                    event.reason.unwrap_or_default(),
                    event.message.unwrap_or_default()
                )
            })
            .collect())
    }

    async fn delete_sub_resource(
        &self,
        namespace: &str,
        resource: &SubResource,
    ) -> Result<(), Error> {
        let params = DeleteParams::default();
        let result = match resource {
            SubResource::ConfigMap(name) => self
                .api::<ConfigMap>(namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
            SubResource::Role(name) => self
                .api::<Role>(namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
            SubResource::RoleBinding(name) => self
                .api::<RoleBinding>(namespace)
                .delete(name, &params)
                .await
                .map(|_| ()),
        };

        match result.map_err(Error::from) {
            Ok(()) => {
                debug!(namespace = %namespace, resource = %resource, "Deleted sub-resource");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
