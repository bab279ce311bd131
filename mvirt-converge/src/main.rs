//! mvirt-converge: command line front end for the convergence engine.
//!
//! Reconciles a single machine against a desired-state file, prints the
//! planned batch, removes a machine or waits for its network.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_converge::clients::http::Credentials;
use mvirt_converge::{
    Cancellation, ConvergeConfig, DesiredState, HttpMachineClient, Orchestrator, Removal,
};

/// mvirt convergence engine
#[derive(Parser, Debug)]
#[command(name = "mvirt-converge", version, about)]
struct Args {
    /// Machine control service endpoint
    #[arg(long, env = "MVIRT_CONVERGE_ENDPOINT", default_value = "http://127.0.0.1:8080")]
    endpoint: String,

    /// API key sent as X-Api-Key
    #[arg(long, env = "MVIRT_CONVERGE_API_KEY", conflicts_with = "token")]
    api_key: Option<String>,

    /// Bearer token
    #[arg(long, env = "MVIRT_CONVERGE_TOKEN")]
    token: Option<String>,

    /// JSON file with retry budgets and the readiness command
    #[arg(long, env = "MVIRT_CONVERGE_CONFIG")]
    config: Option<PathBuf>,

    /// Overall deadline in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Per-request timeout in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile a machine against a desired-state file
    Apply {
        #[arg(long)]
        machine: String,
        /// Desired state (JSON)
        #[arg(long)]
        desired: PathBuf,
        /// Previously applied desired state; omit for a newly created machine
        #[arg(long)]
        previous: Option<PathBuf>,
    },
    /// Print the operation batch a reconcile would submit
    Plan {
        #[arg(long)]
        machine: String,
        #[arg(long)]
        desired: PathBuf,
    },
    /// Stop and delete a machine
    Remove {
        #[arg(long)]
        machine: String,
    },
    /// Wait until the machine reports a network address
    WaitNetwork {
        #[arg(long)]
        machine: String,
    },
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mvirt_converge=info,reqwest=warn,hyper=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => read_json::<ConvergeConfig>(path)?,
        None => ConvergeConfig::default(),
    };

    let request_timeout = Duration::from_secs(args.request_timeout);
    let mut client = HttpMachineClient::new(&args.endpoint, request_timeout)?;
    if let Some(key) = args.api_key.clone() {
        client = client.with_credentials(Credentials::ApiKey(key));
    } else if let Some(token) = args.token.clone() {
        client = client.with_credentials(Credentials::Bearer(token));
    }

    info!("Machine control service: {}", args.endpoint);
    let orchestrator = Orchestrator::new(Arc::new(client), config);

    let (handle, mut cancel) = Cancellation::new();
    if let Some(secs) = args.timeout {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            handle.cancel();
        }
    });

    if let Err(e) = run(&orchestrator, args.command, &cancel).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(orchestrator: &Orchestrator, command: Command, cancel: &Cancellation) -> Result<()> {
    match command {
        Command::Apply {
            machine,
            desired,
            previous,
        } => {
            let desired: DesiredState = read_json(&desired)?;
            let previous: Option<DesiredState> = previous
                .as_deref()
                .map(read_json::<DesiredState>)
                .transpose()?;

            let report = orchestrator
                .reconcile(&machine, &desired, previous.as_ref(), cancel)
                .await
                .with_context(|| format!("failed to reconcile {}", machine))?;

            for op in &report.operations {
                println!("{}", op);
            }
            for output in &report.commands {
                print!("{}", output.stdout);
            }
            info!(
                machine = %machine,
                state = %report.snapshot.state,
                operations = report.operations.len(),
                "Applied"
            );
        }
        Command::Plan { machine, desired } => {
            let desired: DesiredState = read_json(&desired)?;
            let batch = orchestrator
                .plan(&machine, &desired, cancel)
                .await
                .with_context(|| format!("failed to plan {}", machine))?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
        Command::Remove { machine } => {
            match orchestrator
                .remove(&machine, cancel)
                .await
                .with_context(|| format!("failed to remove {}", machine))?
            {
                Removal::AlreadyAbsent => info!(machine = %machine, "Machine was already absent"),
                Removal::Deleted => info!(machine = %machine, "Machine deleted"),
            }
        }
        Command::WaitNetwork { machine } => {
            let snapshot = orchestrator
                .wait_for_network(&machine, cancel)
                .await
                .with_context(|| format!("network of {} never came up", machine))?;
            println!("{}", snapshot.network_address().unwrap_or_default());
        }
    }
    Ok(())
}
