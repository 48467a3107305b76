//! kiagnose - runs one checkup described by a ConfigMap

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kiagnose::client::create_client;
use kiagnose::config::StoreRef;
use kiagnose::runner::{RunOutcome, Runner, RunnerConfig};
use kiagnose::store::ConfigMapStore;
use kiagnose::workload::KubePlatform;

/// Exit code when the run could not start at all
const EXIT_STARTUP_FAILURE: u8 = 2;

/// kiagnose - run a checkup and report its status into the Store ConfigMap
#[derive(Parser, Debug)]
#[command(name = "kiagnose", version, about, long_about = None)]
struct Cli {
    /// Namespace of the Store ConfigMap; also where the workload runs
    #[arg(long, env = "CONFIGMAP_NAMESPACE")]
    configmap_namespace: String,

    /// Name of the Store ConfigMap
    #[arg(long, env = "CONFIGMAP_NAME")]
    configmap_name: String,

    /// Longest single wait on the workload before re-checking, in seconds
    #[arg(long, env = "KIAGNOSE_POLL_INTERVAL_SECS", default_value = "5")]
    poll_interval_secs: u64,

    /// Path to a kubeconfig; in-cluster config is used when absent
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(outcome) => {
            if let RunOutcome::Unreported { reason } = &outcome {
                error!(reason = %reason, "Checkup ended without a terminal status");
            }
            ExitCode::from(outcome.exit_code())
        }
        Err(e) => {
            error!(error = %e, "Checkup could not start");
            ExitCode::from(EXIT_STARTUP_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<RunOutcome> {
    let store_ref = StoreRef::new(cli.configmap_namespace, cli.configmap_name)?;
    let client = create_client(cli.kubeconfig.as_deref()).await?;

    let config = RunnerConfig {
        poll_ceiling: Duration::from_secs(cli.poll_interval_secs.max(1)),
        ..RunnerConfig::default()
    };

    info!(store = %store_ref, "kiagnose starting");

    let runner = Runner::new(
        Arc::new(ConfigMapStore::new(client.clone(), store_ref.clone())),
        Arc::new(KubePlatform::new(client)),
        store_ref,
        config,
    );
    Ok(runner.run().await)
}
