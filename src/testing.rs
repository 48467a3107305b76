//! In-memory Store and cluster used by orchestration tests
//!
//! Mocks script single calls well; a whole checkup run needs stateful
//! stand-ins whose Job progresses with (paused) tokio time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use tokio::time::Instant;

use crate::error::api_error;
use crate::store::{merge_write_once, Store};
use crate::workload::{Platform, SubResource};
use crate::Error;

/// Store over a map, optionally refusing writes that touch one key
#[derive(Default)]
pub(crate) struct FakeStore {
    data: Mutex<BTreeMap<String, String>>,
    unreadable: AtomicBool,
    fail_writes_touching: Mutex<Option<String>>,
    writes: AtomicU32,
}

impl FakeStore {
    pub(crate) fn with_data(pairs: &[(&str, &str)]) -> Self {
        let store = Self::default();
        *store.data.lock().unwrap() = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        store
    }

    pub(crate) fn unreadable(self) -> Self {
        self.unreadable.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn fail_writes_touching(self, key: &str) -> Self {
        *self.fail_writes_touching.lock().unwrap() = Some(key.to_string());
        self
    }

    pub(crate) fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub(crate) fn data(&self) -> BTreeMap<String, String> {
        self.data.lock().unwrap().clone()
    }

    pub(crate) fn write_count(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn read(&self, key: &str) -> Result<Option<String>, Error> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(api_error(403, "Forbidden"));
        }
        Ok(self.get(key))
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, Error> {
        if self.unreadable.load(Ordering::SeqCst) {
            return Err(api_error(403, "Forbidden"));
        }
        Ok(self.data())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), Error> {
        self.write_batch(BTreeMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    async fn write_batch(&self, entries: BTreeMap<String, String>) -> Result<(), Error> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Some(key) = self.fail_writes_touching.lock().unwrap().as_ref() {
            if entries.contains_key(key) {
                return Err(api_error(503, "ServiceUnavailable"));
            }
        }
        let mut data = self.data.lock().unwrap();
        let mut merged = data.clone();
        merge_write_once(&mut merged, &entries)?;
        *data = merged;
        Ok(())
    }
}

/// How the fake checkup Job behaves once created
#[derive(Clone, Debug)]
pub(crate) enum JobScript {
    /// Runs, then completes and leaves `results` in its results ConfigMap
    Completes {
        after: Duration,
        results: BTreeMap<String, String>,
    },
    /// Runs, then fails with the given condition reason
    Fails { after: Duration, reason: String },
    /// Runs forever
    Hangs,
}

struct FakeJob {
    name: String,
    created_at: Instant,
}

/// Cluster holding service accounts and one scripted checkup Job
pub(crate) struct FakeCluster {
    service_accounts: BTreeSet<String>,
    script: JobScript,
    reject_jobs: bool,
    delete_delay: Duration,
    names: AtomicU32,
    job: Mutex<Option<FakeJob>>,
    results_configmap: Mutex<Option<String>>,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<SubResource>>,
}

impl FakeCluster {
    pub(crate) fn new(script: JobScript) -> Self {
        Self {
            service_accounts: BTreeSet::new(),
            script,
            reject_jobs: false,
            delete_delay: Duration::ZERO,
            names: AtomicU32::new(0),
            job: Mutex::new(None),
            results_configmap: Mutex::new(None),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_service_account(mut self, name: &str) -> Self {
        self.service_accounts.insert(name.to_string());
        self
    }

    pub(crate) fn rejecting_jobs(mut self) -> Self {
        self.reject_jobs = true;
        self
    }

    /// Every delete takes `delay` before it is acknowledged
    pub(crate) fn slow_deletes(mut self, delay: Duration) -> Self {
        self.delete_delay = delay;
        self
    }

    /// Every object created, as `Kind/name`
    pub(crate) fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<SubResource> {
        self.deleted.lock().unwrap().clone()
    }

    /// Created sub-resources that were never deleted; the Job is not one
    pub(crate) fn leftovers(&self) -> Vec<String> {
        let deleted: Vec<String> = self.deleted().iter().map(|r| r.to_string()).collect();
        self.created()
            .into_iter()
            .filter(|c| !c.starts_with("Job/") && !deleted.contains(c))
            .collect()
    }

    fn generate(&self, kind: &str, prefix: Option<String>) -> String {
        let n = self.names.fetch_add(1, Ordering::SeqCst);
        let name = format!("{}{:05}", prefix.unwrap_or_default(), n);
        self.created.lock().unwrap().push(format!("{kind}/{name}"));
        name
    }

    fn finishes_at(&self, created_at: Instant) -> Option<Instant> {
        match &self.script {
            JobScript::Completes { after, .. } | JobScript::Fails { after, .. } => {
                Some(created_at + *after)
            }
            JobScript::Hangs => None,
        }
    }

    fn job_state(&self, name: &str, created_at: Instant) -> Job {
        let finished = self
            .finishes_at(created_at)
            .is_some_and(|at| Instant::now() >= at);

        let status = if !finished {
            JobStatus {
                active: Some(1),
                ..Default::default()
            }
        } else {
            let (type_, reason) = match &self.script {
                JobScript::Fails { reason, .. } => ("Failed", Some(reason.clone())),
                _ => ("Complete", None),
            };
            JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    reason,
                    ..Default::default()
                }]),
                ..Default::default()
            }
        };

        let mut job = Job {
            status: Some(status),
            ..Default::default()
        };
        job.metadata.name = Some(name.to_string());
        job
    }
}

#[async_trait]
impl Platform for FakeCluster {
    async fn service_account_exists(&self, _namespace: &str, name: &str) -> Result<bool, Error> {
        Ok(self.service_accounts.contains(name))
    }

    async fn create_config_map(&self, _namespace: &str, mut cm: ConfigMap) -> Result<ConfigMap, Error> {
        let name = self.generate("ConfigMap", cm.metadata.generate_name.clone());
        *self.results_configmap.lock().unwrap() = Some(name.clone());
        cm.metadata.name = Some(name);
        Ok(cm)
    }

    async fn create_role(&self, _namespace: &str, mut role: Role) -> Result<Role, Error> {
        role.metadata.name = Some(self.generate("Role", role.metadata.generate_name.clone()));
        Ok(role)
    }

    async fn create_role_binding(
        &self,
        _namespace: &str,
        mut binding: RoleBinding,
    ) -> Result<RoleBinding, Error> {
        binding.metadata.name = Some(
            self.generate("RoleBinding", binding.metadata.generate_name.clone()),
        );
        Ok(binding)
    }

    async fn create_job(&self, _namespace: &str, mut job: Job) -> Result<Job, Error> {
        if self.reject_jobs {
            return Err(api_error(403, "Forbidden"));
        }
        let name = self.generate("Job", job.metadata.generate_name.clone());
        *self.job.lock().unwrap() = Some(FakeJob {
            name: name.clone(),
            created_at: Instant::now(),
        });
        job.metadata.name = Some(name);
        Ok(job)
    }

    async fn read_config_map_data(
        &self,
        _namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        if self.results_configmap.lock().unwrap().as_deref() != Some(name) {
            return Ok(None);
        }
        let results = match &self.script {
            JobScript::Completes { results, .. } => results.clone(),
            _ => BTreeMap::new(),
        };
        Ok(Some(results))
    }

    async fn wait_job(
        &self,
        _namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, Error> {
        let created_at = match self.job.lock().unwrap().as_ref() {
            Some(job) if job.name == name => job.created_at,
            _ => return Ok(None),
        };

        let until = Instant::now() + timeout;
        let wake = match self.finishes_at(created_at) {
            Some(at) if at > Instant::now() => at.min(until),
            Some(_) => Instant::now(),
            None => until,
        };
        tokio::time::sleep_until(wake).await;

        Ok(Some(self.job_state(name, created_at)))
    }

    async fn workload_logs(&self, _namespace: &str, job_name: &str) -> Result<String, Error> {
        Ok(format!("--- pod {job_name}-xyz ---\nchecking...\n"))
    }

    async fn workload_events(&self, _namespace: &str, job_name: &str) -> Result<Vec<String>, Error> {
        Ok(vec![format!("Normal Job/{job_name} SuccessfulCreate: Created pod")])
    }

    async fn delete_sub_resource(
        &self,
        _namespace: &str,
        resource: &SubResource,
    ) -> Result<(), Error> {
        tokio::time::sleep(self.delete_delay).await;
        self.deleted.lock().unwrap().push(resource.clone());
        Ok(())
    }
}
