//! SwarmGuard CLI entry point.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use swarmguard::infrastructure::config::{Config, ConfigLoader};
use swarmguard::infrastructure::database::{DatabaseConnection, WorkflowStore};
use swarmguard::infrastructure::http::{gateway, orchestrator_api, scanner_api};
use swarmguard::infrastructure::telemetry;
use swarmguard::services::cancellation::CancellationRegistry;
use swarmguard::services::plugins::{PluginRegistry, PolicyPlugin};
use swarmguard::services::result_cache::{ResultCache, ResultCacheConfig};
use swarmguard::services::scheduler::{Scheduler, SchedulerConfig};
use swarmguard::services::signature::{DirRuleLoader, HotReloadScanner, ScanMetricsCollector};
use swarmguard::services::workflow_engine::{EngineConfig, WorkflowEngine};
use swarmguard::services::RateLimiterConfig;

#[derive(Parser)]
#[command(name = "swarmguard", about = "SwarmGuard request-processing core", version)]
struct Cli {
    /// Configuration file; defaults to swarmguard.yaml in the working
    /// directory plus environment overrides.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API gateway.
    Gateway {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the workflow orchestrator.
    Orchestrator {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run the signature scanner.
    Scanner {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Apply store migrations and exit.
    Migrate,
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path),
        None => ConfigLoader::load(),
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli).context("Failed to load configuration")?;
    telemetry::init_tracing(&config.logging);

    match cli.command {
        Commands::Gateway { port } => run_gateway(config, port).await,
        Commands::Orchestrator { port } => run_orchestrator(config, port).await,
        Commands::Scanner { port } => run_scanner(config, port).await,
        Commands::Migrate => run_migrate(config).await,
    }
}

async fn run_gateway(config: Config, port: Option<u16>) -> Result<()> {
    let metrics_handle = telemetry::install_metrics_recorder();
    let state = gateway::GatewayState::from_config(&config, metrics_handle);
    let port = port.unwrap_or(config.gateway.port);
    gateway::serve(state, port, shutdown_signal()).await
}

async fn run_orchestrator(config: Config, port: Option<u16>) -> Result<()> {
    let metrics_handle = telemetry::install_metrics_recorder();

    let database_url = format!("sqlite:{}", config.orchestrator.db_path);
    let db = DatabaseConnection::new(&database_url)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(WorkflowStore::new(db.pool().clone()));

    let client = reqwest::Client::builder()
        .pool_max_idle_per_host(config.orchestrator.http_pool_max_idle_per_host)
        .build()
        .context("Failed to build http client")?;

    let mut plugins = PluginRegistry::with_defaults(
        client.clone(),
        config.downstreams.policy_url.clone(),
        config.orchestrator.python_path.clone(),
        config.orchestrator.shell_allow_list.clone(),
    );
    // Policy calls carry the decision cache and outbound rate limit.
    plugins.register(
        swarmguard::domain::models::TaskKind::Policy,
        Arc::new(
            PolicyPlugin::new(client, config.downstreams.policy_url.clone()).with_shell(
                config.policy.decision_cache_size,
                RateLimiterConfig {
                    capacity: config.policy.rate_limit_capacity,
                    fill_rate: config.policy.rate_limit_refill_per_sec,
                    window: Duration::from_secs(60),
                    max_per_window: u64::MAX,
                },
            ),
        ),
    );

    let registry = CancellationRegistry::new();
    let cache = ResultCache::new(ResultCacheConfig::default());
    let _cache_sweeper = cache.start_sweeper();
    let _registry_sweeper = registry.start_sweeper(Duration::from_secs(60));

    let engine = Arc::new(WorkflowEngine::new(
        EngineConfig {
            max_workers: config.orchestrator.max_workers,
            ..Default::default()
        },
        Arc::new(plugins),
        cache,
        registry.clone(),
    ));

    let scheduler = Scheduler::new(engine.clone(), store.clone(), SchedulerConfig::default());
    scheduler.restore().await.context("Failed to restore schedules")?;
    let scheduler_handle = scheduler.start();

    let state = Arc::new(orchestrator_api::OrchestratorState {
        engine,
        store,
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        metrics_handle,
    });

    let port = port.unwrap_or(config.orchestrator.port);
    let result = orchestrator_api::serve(state, port, shutdown_signal()).await;

    // Drain: stop triggers, cancel running executions, bounded wait, close db.
    scheduler.stop();
    scheduler_handle.abort();
    let cancelled = registry.cancel_all("server shutdown").await;
    if cancelled > 0 {
        tracing::info!(cancelled, "waiting for cancelled executions to drain");
        let drain = async {
            while !registry.active().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(10), drain).await;
    }
    db.close().await;
    result
}

async fn run_scanner(config: Config, port: Option<u16>) -> Result<()> {
    let metrics_handle = telemetry::install_metrics_recorder();

    let loader = Arc::new(DirRuleLoader::new(&config.scanner.rule_dir));
    let scanner = HotReloadScanner::new(loader)
        .await
        .context("Failed to load signature rules")?;
    let reload_handle =
        scanner.start(Duration::from_secs(config.scanner.reload_interval_secs.max(1)));

    let state = Arc::new(scanner_api::ScannerState {
        scanner: scanner.clone(),
        collector: Arc::new(ScanMetricsCollector::new()),
        metrics_handle,
    });

    let port = port.unwrap_or(config.scanner.port);
    let result = scanner_api::serve(state, port, shutdown_signal()).await;

    scanner.stop();
    reload_handle.abort();
    result
}

async fn run_migrate(config: Config) -> Result<()> {
    let database_url = format!("sqlite:{}", config.orchestrator.db_path);
    let db = DatabaseConnection::new(&database_url)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    db.close().await;
    println!("migrations applied to {}", config.orchestrator.db_path);
    Ok(())
}
