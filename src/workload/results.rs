//! Per-run results ConfigMap and the payload's verdict
//!
//! The workload never touches the caller's Store. It writes its verdict into
//! a ConfigMap created for the run, located through the
//! `RESULT_CONFIGMAP_NAMESPACE`/`RESULT_CONFIGMAP_NAME` env vars, using the
//! same `status.*` keys. A Role scoped to that single ConfigMap and a
//! RoleBinding to the checkup service account give it write access.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::job::{checkup_labels, generate_name_prefix};
use crate::config::{StoreRef, FAILURE_REASON_KEY, RESULT_KEY_PREFIX, SUCCEEDED_KEY};

const DEFAULT_PAYLOAD_FAILURE: &str = "checkup payload reported failure without a reason";

fn metadata(store: &StoreRef, suffix: &str) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(generate_name_prefix(&store.name, suffix)),
        namespace: Some(store.namespace.clone()),
        labels: Some(checkup_labels(store)),
        ..Default::default()
    }
}

/// Empty ConfigMap the payload writes its results into
pub fn build_results_config_map(store: &StoreRef) -> ConfigMap {
    ConfigMap {
        metadata: metadata(store, "results"),
        data: Some(BTreeMap::new()),
        ..Default::default()
    }
}

/// Role allowing updates of exactly one results ConfigMap
pub fn build_results_writer_role(store: &StoreRef, results_configmap: &str) -> Role {
    Role {
        metadata: metadata(store, "results-writer"),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["configmaps".to_string()]),
            resource_names: Some(vec![results_configmap.to_string()]),
            verbs: vec!["get".to_string(), "update".to_string(), "patch".to_string()],
            ..Default::default()
        }]),
    }
}

/// Binding of the writer Role to the checkup service account
pub fn build_results_writer_binding(
    store: &StoreRef,
    role_name: &str,
    service_account_name: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: metadata(store, "results-writer"),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: role_name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account_name.to_string(),
            namespace: Some(store.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// Verdict the payload left in its results ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadResults {
    /// The payload succeeded (or did not say otherwise)
    Succeeded {
        /// `status.result.*` entries, keys without the prefix
        results: BTreeMap<String, String>,
    },
    /// The payload reported a failure
    Failed {
        /// The payload's own failure reason
        reason: String,
    },
}

impl PayloadResults {
    /// Interpret the results ConfigMap of a Job that completed.
    ///
    /// A payload must write `status.succeeded`; a Job that exits zero without
    /// a verdict is a failure.
    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let reason = || {
            data.get(FAILURE_REASON_KEY)
                .filter(|r| !r.trim().is_empty())
                .cloned()
                .unwrap_or_else(|| DEFAULT_PAYLOAD_FAILURE.to_string())
        };

        let Some(raw) = data.get(SUCCEEDED_KEY) else {
            return PayloadResults::Failed {
                reason: "results: succeeded field is missing".to_string(),
            };
        };

        match parse_bool(raw) {
            Some(true) => {
                let results = data
                    .iter()
                    .filter_map(|(key, value)| {
                        key.strip_prefix(RESULT_KEY_PREFIX)
                            .filter(|name| !name.is_empty())
                            .map(|name| (name.to_string(), value.clone()))
                    })
                    .collect();
                PayloadResults::Succeeded { results }
            }
            Some(false) => PayloadResults::Failed { reason: reason() },
            None => PayloadResults::Failed {
                reason: format!("results: succeeded field is illegal: {raw:?}"),
            },
        }
    }
}

/// Boolean spellings payloads are known to write
fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
