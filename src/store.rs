//! Spec/Status Store backed by a ConfigMap
//!
//! The Store is the only channel between the caller and the framework. The
//! caller writes `spec.*` keys before the run; the framework reads them once
//! and writes `status.*` keys.
//!
//! # Atomicity
//!
//! Writes go through [`Store::write_batch`], which applies every entry in one
//! `replace` carrying the `resourceVersion` that was read. If the ConfigMap
//! changed in between, the API server answers 409 Conflict and the batch is
//! re-read and re-applied. An observer therefore sees either none or all of a
//! batch's keys.
//!
//! Status keys are write-once: re-writing a key with the same value is a
//! no-op, re-writing it with a different value is an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::StoreRef;
use crate::Error;

/// Conflicting updates tolerated before a batch write gives up
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Trait abstracting the Spec/Status Store
///
/// This trait allows mocking the Store in tests while using the ConfigMap
/// implementation in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a single key, `None` if absent
    async fn read(&self, key: &str) -> Result<Option<String>, Error>;

    /// Read every key in one request
    async fn snapshot(&self) -> Result<BTreeMap<String, String>, Error>;

    /// Write a single key with write-once semantics
    async fn write(&self, key: &str, value: &str) -> Result<(), Error>;

    /// Write all entries atomically with write-once semantics
    ///
    /// # Returns
    ///
    /// `Ok(())` once every entry is visible in the Store, or
    /// [`Error::StatusAlreadyWritten`] if a key already holds another value.
    async fn write_batch(&self, entries: BTreeMap<String, String>) -> Result<(), Error>;
}

/// Outcome of merging a batch into existing data
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Merge {
    /// Every entry already present with the same value
    Unchanged,
    /// At least one entry was added
    Changed,
}

/// Merge `entries` into `data`, refusing to overwrite differing values.
pub(crate) fn merge_write_once(
    data: &mut BTreeMap<String, String>,
    entries: &BTreeMap<String, String>,
) -> Result<Merge, Error> {
    for (key, value) in entries {
        if let Some(existing) = data.get(key) {
            if existing != value {
                return Err(Error::StatusAlreadyWritten(key.clone()));
            }
        }
    }

    let mut merge = Merge::Unchanged;
    for (key, value) in entries {
        if data.insert(key.clone(), value.clone()).is_none() {
            merge = Merge::Changed;
        }
    }
    Ok(merge)
}

/// The two ConfigMap calls a Store needs
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait ConfigMapApi: Send + Sync {
    /// Fetch the ConfigMap, including its `resourceVersion`
    async fn get(&self, name: &str) -> Result<ConfigMap, Error>;

    /// Replace the ConfigMap; fails with 409 if `resourceVersion` is stale
    async fn replace(&self, name: &str, cm: &ConfigMap) -> Result<ConfigMap, Error>;
}

struct KubeConfigMapApi {
    api: Api<ConfigMap>,
}

#[async_trait]
impl ConfigMapApi for KubeConfigMapApi {
    async fn get(&self, name: &str) -> Result<ConfigMap, Error> {
        Ok(self.api.get(name).await?)
    }

    async fn replace(&self, name: &str, cm: &ConfigMap) -> Result<ConfigMap, Error> {
        Ok(self.api.replace(name, &PostParams::default(), cm).await?)
    }
}

/// Store implementation over a namespaced ConfigMap
pub struct ConfigMapStore {
    api: Arc<dyn ConfigMapApi>,
    store: StoreRef,
}

impl ConfigMapStore {
    /// Create a Store for the ConfigMap identified by `store`
    pub fn new(client: Client, store: StoreRef) -> Self {
        let api = KubeConfigMapApi {
            api: Api::namespaced(client, &store.namespace),
        };
        Self::with_api(Arc::new(api), store)
    }

    pub(crate) fn with_api(api: Arc<dyn ConfigMapApi>, store: StoreRef) -> Self {
        Self { api, store }
    }

    async fn get(&self) -> Result<ConfigMap, Error> {
        self.api.get(&self.store.name).await
    }
}

#[async_trait]
impl Store for ConfigMapStore {
    async fn read(&self, key: &str) -> Result<Option<String>, Error> {
        let cm = self.get().await?;
        Ok(cm.data.and_then(|mut data| data.remove(key)))
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, String>, Error> {
        let cm = self.get().await?;
        let data = cm
            .data
            .ok_or_else(|| Error::config(format!("ConfigMap {} has no data", self.store)))?;
        debug!(store = %self.store, keys = data.len(), "Read Store snapshot");
        Ok(data)
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), Error> {
        self.write_batch(BTreeMap::from([(key.to_string(), value.to_string())]))
            .await
    }

    async fn write_batch(&self, entries: BTreeMap<String, String>) -> Result<(), Error> {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            // The read resourceVersion rides along with the replace.
            let mut cm = self.get().await?;
            let data = cm.data.get_or_insert_with(BTreeMap::new);

            if merge_write_once(data, &entries)? == Merge::Unchanged {
                debug!(store = %self.store, "Batch already applied, nothing to write");
                return Ok(());
            }

            match self.api.replace(&self.store.name, &cm).await {
                Ok(_) => {
                    info!(
                        store = %self.store,
                        keys = ?entries.keys().collect::<Vec<_>>(),
                        "Store updated"
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    warn!(
                        store = %self.store,
                        attempt = attempt,
                        "Store update conflicted with a concurrent writer, re-reading"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::transient(format!(
            "Store {} kept conflicting after {} attempts",
            self.store, MAX_CONFLICT_RETRIES
        )))
    }
}
