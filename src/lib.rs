//! kiagnose - checkup framework for Kubernetes clusters
//!
//! A checkup is a single diagnostic run. The caller describes it in a
//! ConfigMap (the Store) with `spec.*` keys and starts a Job running this
//! framework. The framework launches the diagnostic image as its own Job,
//! watches it until it finishes or the checkup times out, and writes the
//! verdict back into the Store under `status.*` keys.
//!
//! # Architecture
//!
//! - The Store is the only channel between caller and framework
//! - Every blocking wait is bounded by one deadline derived from `spec.timeout`
//! - Exactly one workload Job per run, never restarted, never deleted by us
//! - The terminal status is written once, atomically
//!
//! # Modules
//!
//! - [`config`] - Store references and the typed checkup spec
//! - [`duration`] - Human duration strings (`30s`, `1h30m`)
//! - [`retry`] - Run deadline and retry-under-deadline combinator
//! - [`store`] - Spec/Status Store over a ConfigMap
//! - [`workload`] - Workload launcher and the cluster interface
//! - [`watcher`] - Completion watcher state machine
//! - [`reporter`] - Terminal status reporting
//! - [`runner`] - Orchestration of a whole run
//! - [`client`] - Kubernetes client construction
//! - [`error`] - Error types for the framework

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod duration;
pub mod error;
pub mod reporter;
pub mod retry;
pub mod runner;
pub mod store;
pub mod watcher;
pub mod workload;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

