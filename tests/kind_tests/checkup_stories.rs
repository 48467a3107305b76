//! Stories of a caller running checkups through the Store
//!
//! The caller prepares a namespace, a service account and a Store ConfigMap,
//! runs the framework, and reads `status.*` back from the Store.

use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, ListParams};
use kube::Client;

use kiagnose::config::StoreRef;
use kiagnose::workload::job::CHECKUP_LABEL;

use super::helpers::{
    cleanup_namespace, create_namespace, create_service_account, create_store, echo_image,
    read_store, run_checkup, test_client,
};

const SA: &str = "checkup-e2e-test";

/// Objects labelled for this checkup, excluding the Store itself
async fn leftovers(client: &Client, store: &StoreRef) -> Vec<String> {
    let params = ListParams::default().labels(&format!("{}={}", CHECKUP_LABEL, store.name));
    let ns = store.namespace.as_str();
    let mut found = Vec::new();

    let cms: Api<ConfigMap> = Api::namespaced(client.clone(), ns);
    for cm in cms.list(&params).await.expect("list ConfigMaps").items {
        found.push(format!("ConfigMap/{}", cm.metadata.name.unwrap_or_default()));
    }
    let roles: Api<Role> = Api::namespaced(client.clone(), ns);
    for role in roles.list(&params).await.expect("list Roles").items {
        found.push(format!("Role/{}", role.metadata.name.unwrap_or_default()));
    }
    let bindings: Api<RoleBinding> = Api::namespaced(client.clone(), ns);
    for binding in bindings.list(&params).await.expect("list RoleBindings").items {
        found.push(format!(
            "RoleBinding/{}",
            binding.metadata.name.unwrap_or_default()
        ));
    }
    found
}

async fn checkup_jobs(client: &Client, store: &StoreRef) -> usize {
    let jobs: Api<Job> = Api::namespaced(client.clone(), &store.namespace);
    jobs.list(&ListParams::default().labels(&format!("{}={}", CHECKUP_LABEL, store.name)))
        .await
        .expect("list Jobs")
        .items
        .len()
}

// =============================================================================
// Successful checkup
// =============================================================================

/// Story: Caller runs the echo checkup and reads its result
///
/// The echo payload writes back the message it was given. The framework
/// copies the payload's results into the Store verbatim.
///
/// Expected behavior:
/// - `status.succeeded` is "true" and `status.result.echo` is "Hi!"
/// - No failure reason is written
/// - Only the checkup Job is left behind
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_echo_checkup_reports_results() {
    let client = test_client().await;
    let ns = "kiagnose-e2e-echo";
    create_namespace(&client, ns).await;
    create_service_account(&client, ns, SA).await;

    let image = echo_image();
    let store = create_store(
        &client,
        ns,
        "echo-checkup-test",
        &[
            ("spec.image", image.as_str()),
            ("spec.timeout", "1m"),
            ("spec.serviceAccountName", SA),
            ("spec.param.message", "Hi!"),
        ],
    )
    .await;

    let outcome = run_checkup(&client, &store).await;
    let status = read_store(&client, &store).await;

    assert_eq!(outcome.exit_code(), 0, "outcome: {outcome:?}");
    assert_eq!(status.get("status.succeeded").map(String::as_str), Some("true"));
    assert_eq!(status.get("status.result.echo").map(String::as_str), Some("Hi!"));
    assert!(!status.contains_key("status.failureReason"));
    assert!(leftovers(&client, &store).await.is_empty());
    assert_eq!(checkup_jobs(&client, &store).await, 1);

    // Re-reading yields the same status.
    assert_eq!(read_store(&client, &store).await, status);

    cleanup_namespace(&client, ns).await;
}

// =============================================================================
// Failing checkups
// =============================================================================

/// Story: A checkup that never finishes is reported as timed out
///
/// The pause image runs forever, so only the deadline can end the run.
///
/// Expected behavior:
/// - `status.succeeded` is "false" with a reason mentioning the timeout
/// - The run ends shortly after `spec.timeout`, not open-ended
/// - Sub-resources are removed, the Job stays for inspection
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_hung_checkup_times_out() {
    let client = test_client().await;
    let ns = "kiagnose-e2e-timeout";
    create_namespace(&client, ns).await;
    create_service_account(&client, ns, SA).await;

    let store = create_store(
        &client,
        ns,
        "hung-checkup",
        &[
            ("spec.image", "registry.k8s.io/pause:3.9"),
            ("spec.timeout", "20s"),
            ("spec.serviceAccountName", SA),
        ],
    )
    .await;

    let started = Instant::now();
    let outcome = run_checkup(&client, &store).await;
    let status = read_store(&client, &store).await;

    assert_eq!(outcome.exit_code(), 1, "outcome: {outcome:?}");
    assert_eq!(status.get("status.succeeded").map(String::as_str), Some("false"));
    assert!(status["status.failureReason"].contains("timeout"));
    assert!(started.elapsed() < Duration::from_secs(20 + 90));
    assert!(leftovers(&client, &store).await.is_empty());
    assert_eq!(checkup_jobs(&client, &store).await, 1);

    cleanup_namespace(&client, ns).await;
}

/// Story: A checkup naming a missing service account fails fast
///
/// Expected behavior:
/// - `status.succeeded` is "false" well before the 5 minute timeout
/// - Nothing is created in the namespace
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_missing_service_account_fails_fast() {
    let client = test_client().await;
    let ns = "kiagnose-e2e-no-sa";
    create_namespace(&client, ns).await;

    let image = echo_image();
    let store = create_store(
        &client,
        ns,
        "no-sa-checkup",
        &[
            ("spec.image", image.as_str()),
            ("spec.timeout", "5m"),
            ("spec.serviceAccountName", "does-not-exist"),
        ],
    )
    .await;

    let started = Instant::now();
    let outcome = run_checkup(&client, &store).await;
    let status = read_store(&client, &store).await;

    assert_eq!(outcome.exit_code(), 1, "outcome: {outcome:?}");
    assert_eq!(status.get("status.succeeded").map(String::as_str), Some("false"));
    assert!(status["status.failureReason"].contains("does-not-exist"));
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(checkup_jobs(&client, &store).await, 0);

    cleanup_namespace(&client, ns).await;
}

/// Story: A Store is used for exactly one run
///
/// Expected behavior:
/// - A second run against a finished Store writes nothing and reports
///   the unreported exit code
#[tokio::test]
#[ignore = "requires kind cluster - run with: cargo test --test kind -- --ignored"]
async fn story_store_cannot_be_reused() {
    let client = test_client().await;
    let ns = "kiagnose-e2e-reuse";
    create_namespace(&client, ns).await;
    create_service_account(&client, ns, SA).await;

    let image = echo_image();
    let store = create_store(
        &client,
        ns,
        "reused-checkup",
        &[
            ("spec.image", image.as_str()),
            ("spec.timeout", "1m"),
            ("spec.serviceAccountName", SA),
            ("spec.param.message", "once"),
        ],
    )
    .await;

    let first = run_checkup(&client, &store).await;
    let after_first = read_store(&client, &store).await;
    let second = run_checkup(&client, &store).await;

    assert_ne!(first.exit_code(), 2, "outcome: {first:?}");
    assert_eq!(second.exit_code(), 2, "outcome: {second:?}");
    assert_eq!(read_store(&client, &store).await, after_first);
    assert_eq!(checkup_jobs(&client, &store).await, 1);

    cleanup_namespace(&client, ns).await;
}
