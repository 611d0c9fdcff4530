use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use delta_desk_analytics::AnalyticsEngine;
use delta_desk_broker_neo::{NeoBroker, SealedSession};
use delta_desk_core::types::{
    Deployment, DeploymentLifecycle, DeploymentState, UserAllocation,
};
use delta_desk_core::{BrokerKind, ConfigLoader, SecretBox, StateStore};
use delta_desk_execution::{ExecutionEngine, SimBroker};
use delta_desk_reconcile::Reconciler;
use delta_desk_strategy::StrategyRunner;

#[derive(Parser)]
#[command(name = "delta-desk")]
#[command(about = "Multi-leg options trading automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full trading day: analytics, strategies, and reconciliation
    Run {
        /// Config file path
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        /// Deployments file path (JSON)
        #[arg(short, long, default_value = "config/deployments.json")]
        deployments: String,
        /// Sealed brokerage sessions file (JSON), decrypted with
        /// DELTA_DESK_ENCRYPT_KEY
        #[arg(long)]
        neo_sessions: Option<String>,
    },
    /// Run a single reconciliation pass and exit
    Reconcile {
        #[arg(short, long, default_value = "config/Config.toml")]
        config: String,
        #[arg(short, long, default_value = "config/deployments.json")]
        deployments: String,
        #[arg(long)]
        neo_sessions: Option<String>,
    },
    /// Generate a new session encryption key
    GenerateKey,
}

/// One row of the deployments file: the deployment plus its allocated users.
#[derive(serde::Deserialize)]
struct DeploymentSpec {
    #[serde(flatten)]
    deployment: Deployment,
    users: Vec<UserAllocation>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run {
            config,
            deployments,
            neo_sessions,
        } => {
            run_trading_day(&config, &deployments, neo_sessions.as_deref()).await?;
        }
        Commands::Reconcile {
            config,
            deployments,
            neo_sessions,
        } => {
            run_reconcile_once(&config, &deployments, neo_sessions.as_deref()).await?;
        }
        Commands::GenerateKey => {
            println!("{}", SecretBox::generate_key());
        }
    }

    Ok(())
}

fn load_deployments(path: &str) -> anyhow::Result<Vec<DeploymentSpec>> {
    let raw = std::fs::read_to_string(path)?;
    let specs: Vec<DeploymentSpec> = serde_json::from_str(&raw)?;
    Ok(specs)
}

/// Seeds the live registry from the deployments file, with per-profile
/// quantities rebalanced for each user.
fn seed_registry(store: &StateStore, specs: &[DeploymentSpec]) {
    store.update_deployments(|registry| {
        for spec in specs {
            if !spec.deployment.is_active {
                continue;
            }
            let mut users = spec.users.clone();
            for user in &mut users {
                user.rebalance(spec.deployment.profiles.len(), spec.deployment.lot_size);
            }
            registry.insert(
                spec.deployment.id.to_string(),
                DeploymentState {
                    lifecycle: DeploymentLifecycle::Inactive,
                    profile_count: spec.deployment.profiles.len(),
                    users,
                },
            );
        }
    });
}

fn build_execution(
    store: &StateStore,
    config: &delta_desk_core::AppConfig,
    neo_sessions: Option<&str>,
) -> anyhow::Result<Arc<ExecutionEngine>> {
    let mut exec = ExecutionEngine::new(store.clone(), config.execution.clone());
    exec.register(Arc::new(SimBroker::new(config.execution.slippage)));

    if let Some(path) = neo_sessions {
        let secrets = SecretBox::from_env()?;
        let raw = std::fs::read_to_string(path)?;
        let sealed: Vec<SealedSession> = serde_json::from_str(&raw)?;

        let mut neo = NeoBroker::new(&config.broker);
        for entry in &sealed {
            neo.add_session(entry.unseal(&secrets)?);
        }
        info!(sessions = sealed.len(), "Brokerage sessions loaded");
        exec.register(Arc::new(neo));
    }

    Ok(Arc::new(exec))
}

async fn run_trading_day(
    config_path: &str,
    deployments_path: &str,
    neo_sessions: Option<&str>,
) -> anyhow::Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let specs = load_deployments(deployments_path)?;
    info!(
        underlying = config.market.underlying,
        deployments = specs.len(),
        "Starting trading day"
    );

    let store = StateStore::new();
    seed_registry(&store, &specs);
    let exec = build_execution(&store, &config, neo_sessions)?;

    if specs
        .iter()
        .any(|s| s.deployment.is_active && s.deployment.broker == BrokerKind::Neo)
        && neo_sessions.is_none()
    {
        warn!("Deployments target the live brokerage but no sessions were provided");
    }

    let analytics = Arc::new(AnalyticsEngine::new(
        store.clone(),
        &config.market,
        &config.analytics,
    ));
    let close = config.market.close;
    let cadence = config.market.tick_cadence_secs;
    let analytics_task = tokio::spawn(Arc::clone(&analytics).run(cadence, close));

    let mut strategy_tasks = Vec::new();
    for spec in &specs {
        if !spec.deployment.is_active {
            continue;
        }
        let runner = match StrategyRunner::build(
            store.clone(),
            Arc::clone(&exec),
            spec.deployment.clone(),
        ) {
            Ok(runner) => runner,
            Err(e) => {
                error!(deployment = spec.deployment.id, error = %e, "Deployment rejected");
                continue;
            }
        };
        strategy_tasks.push(tokio::spawn(async move {
            let id = runner.deployment_id();
            if let Err(e) = runner.run().await {
                error!(deployment = id, error = %e, "Strategy run failed");
            }
        }));
    }

    let deployments: Vec<Deployment> = specs.iter().map(|s| s.deployment.clone()).collect();
    let reconciler = Reconciler::new(store.clone(), Arc::clone(&exec), deployments);
    reconciler.run(config.reconcile.interval_secs, close).await;

    for task in strategy_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Strategy task panicked");
        }
    }
    if let Err(e) = analytics_task.await {
        error!(error = %e, "Analytics task panicked");
    }

    info!("Trading day complete");
    Ok(())
}

async fn run_reconcile_once(
    config_path: &str,
    deployments_path: &str,
    neo_sessions: Option<&str>,
) -> anyhow::Result<()> {
    let config = ConfigLoader::load(config_path)?;
    let specs = load_deployments(deployments_path)?;

    let store = StateStore::new();
    seed_registry(&store, &specs);
    let exec = build_execution(&store, &config, neo_sessions)?;

    let deployments: Vec<Deployment> = specs.iter().map(|s| s.deployment.clone()).collect();
    let reconciler = Reconciler::new(store, exec, deployments);
    let corrected = reconciler.reconcile_once().await?;
    info!(corrections = corrected, "Reconciliation pass complete");
    Ok(())
}
