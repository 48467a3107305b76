//! Integration tests for the checkup framework
//!
//! These tests require a Kubernetes cluster (kind) to run and tell the story
//! of how a caller drives a checkup through its Store ConfigMap.
//!
//! # Test Organization
//!
//! - `checkup_stories`: a caller writes a spec, runs the framework and reads
//!   the status back (success, timeout, missing service account, reuse)
//!
//! # Running These Tests
//!
//! ```bash
//! # Echo checkup image, override to test a locally built one
//! export KIAGNOSE_ECHO_IMAGE=quay.io/kiagnose/echo-checkup:main
//! cargo test --test kind -- --ignored --nocapture
//! ```

mod checkup_stories;
