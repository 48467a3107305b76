//! Checkup configuration read from the Store
//!
//! The Store is a flat ConfigMap whose keys are dotted paths. The `spec.*`
//! keys are parsed once at start into a [`CheckupSpec`]; recognized options
//! are enumerated and validated, `spec.param.*` pairs are forwarded to the
//! workload without interpretation.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::EnvVar;

use crate::duration::parse_duration;
use crate::{Error, Result};

/// Workload container image (required)
pub const IMAGE_KEY: &str = "spec.image";
/// Checkup timeout as a duration string (required)
pub const TIMEOUT_KEY: &str = "spec.timeout";
/// Service account the workload runs as (required)
pub const SERVICE_ACCOUNT_NAME_KEY: &str = "spec.serviceAccountName";
/// Prefix of opaque parameters forwarded to the workload
pub const PARAM_KEY_PREFIX: &str = "spec.param.";

/// Written when a run starts; its presence marks the Store as used
pub const START_TIMESTAMP_KEY: &str = "status.startTimestamp";
/// Terminal verdict, `"true"` or `"false"`
pub const SUCCEEDED_KEY: &str = "status.succeeded";
/// Human-readable reason, only on failure or timeout
pub const FAILURE_REASON_KEY: &str = "status.failureReason";
/// Written together with the terminal verdict
pub const COMPLETION_TIMESTAMP_KEY: &str = "status.completionTimestamp";
/// Prefix of payload results, only on success
pub const RESULT_KEY_PREFIX: &str = "status.result.";

const SPEC_KEY_PREFIX: &str = "spec.";

/// Namespace and name of the Store ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreRef {
    /// Namespace holding the ConfigMap; also the checkup's target namespace
    pub namespace: String,
    /// ConfigMap name
    pub name: String,
}

impl StoreRef {
    /// Build a reference, rejecting empty components
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() {
            return Err(Error::config("ConfigMap namespace is empty"));
        }
        if name.is_empty() {
            return Err(Error::config("ConfigMap name is empty"));
        }
        Ok(Self { namespace, name })
    }
}

impl std::fmt::Display for StoreRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Validated checkup specification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckupSpec {
    /// Workload container image
    pub image: String,
    /// Timeout bounding the whole run
    pub timeout: Duration,
    /// Identity the workload runs as
    pub service_account_name: String,
    /// Opaque parameters keyed by name, without the `spec.param.` prefix
    pub params: BTreeMap<String, String>,
}

impl CheckupSpec {
    /// Parse and validate the Store contents.
    ///
    /// Fails with [`Error::AlreadyInUse`] if the Store already carries status
    /// from an earlier run, and with [`Error::Config`] or
    /// [`Error::InvalidDuration`] on missing or malformed fields.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        if is_already_in_use(data) {
            return Err(Error::AlreadyInUse);
        }

        let image = required(data, IMAGE_KEY, "image")?;

        let raw_timeout = data
            .get(TIMEOUT_KEY)
            .ok_or_else(|| Error::config("timeout field is missing"))?;
        let timeout = parse_duration(raw_timeout)?;
        if timeout.is_zero() {
            return Err(Error::config("timeout field is illegal: must be positive"));
        }

        let service_account_name = required(data, SERVICE_ACCOUNT_NAME_KEY, "serviceAccountName")?;

        let mut params = BTreeMap::new();
        for (key, value) in data {
            if let Some(name) = key.strip_prefix(PARAM_KEY_PREFIX) {
                if name.is_empty() {
                    return Err(Error::config("param name is illegal: empty name"));
                }
                params.insert(name.to_string(), value.clone());
            } else if key.starts_with(SPEC_KEY_PREFIX) && !is_recognized(key) {
                return Err(Error::config(format!("unknown field {key:?}")));
            }
        }

        Ok(Self {
            image,
            timeout,
            service_account_name,
            params,
        })
    }

    /// Parameters as workload environment variables.
    ///
    /// Names are upper-cased, values forwarded verbatim, ordered by name.
    pub fn param_env_vars(&self) -> Vec<EnvVar> {
        self.params
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.to_uppercase(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect()
    }
}

fn is_recognized(key: &str) -> bool {
    matches!(key, IMAGE_KEY | TIMEOUT_KEY | SERVICE_ACCOUNT_NAME_KEY)
}

fn is_already_in_use(data: &BTreeMap<String, String>) -> bool {
    data.contains_key(START_TIMESTAMP_KEY) || data.contains_key(SUCCEEDED_KEY)
}

fn required(data: &BTreeMap<String, String>, key: &str, field: &str) -> Result<String> {
    match data.get(key) {
        None => Err(Error::config(format!("{field} field is missing"))),
        Some(value) if value.trim().is_empty() => {
            Err(Error::config(format!("{field} field is illegal: empty value")))
        }
        Some(value) => Ok(value.clone()),
    }
}
