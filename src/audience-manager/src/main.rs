//! Audience Manager: rule-based audience segmentation with incremental
//! segment reuse.
//!
//! `compile` prints the query a condition list compiles to. `run` loads rules
//! and transactions into the in-memory engine and materializes segments,
//! either once or on their recurring schedules until interrupted.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use audience_core::config::AppConfig;
use audience_core::event_bus::noop_sink;
use audience_core::{RuleId, Schedule, SetOperation};
use audience_materializer::{
    Executor, MaterializationScheduler, MemoryEngine, SchedulerMode, SegmentManager, Transaction,
};
use audience_segmentation::{normalize, ConditionCompiler, ConditionInput, MemoryCatalog, RuleBuilder};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "audience-manager")]
#[command(about = "Rule-based audience segmentation with incremental segment reuse")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, env = "AUDIENCE_MANAGER_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "AUDIENCE_MANAGER__NODE_ID")]
    node_id: Option<String>,

    /// Maximum concurrent materialization runs (overrides config)
    #[arg(long, env = "AUDIENCE_MANAGER__SCHEDULER__MAX_CONCURRENT_RUNS")]
    max_concurrent_runs: Option<usize>,

    /// Prometheus exporter port; enables the exporter (overrides config)
    #[arg(long, env = "AUDIENCE_MANAGER__METRICS__PORT")]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a condition list (or legacy condition object) and print the query
    Compile {
        #[arg(long)]
        conditions: PathBuf,
    },
    /// Create rules and materialize their segments
    Run {
        /// JSON array of rule definitions
        #[arg(long)]
        rules: PathBuf,
        /// JSON array of transactions
        #[arg(long)]
        transactions: PathBuf,
        /// Run a single pass over all rules and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

/// One entry of the rules file.
#[derive(Debug, Deserialize)]
struct RuleFileEntry {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "no_conditions")]
    conditions: ConditionInput,
    #[serde(default)]
    schedule: Schedule,
    #[serde(default = "default_active")]
    active: bool,
    #[serde(default)]
    combine: Option<CombineEntry>,
}

/// Explicit composition over rules defined earlier in the same file.
#[derive(Debug, Deserialize)]
struct CombineEntry {
    operation: SetOperation,
    rules: Vec<String>,
}

fn no_conditions() -> ConditionInput {
    ConditionInput::List(Vec::new())
}

fn default_active() -> bool {
    true
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "audience_manager=info,audience_materializer=info,audience_segmentation=info"
                    .into()
            }),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load_from(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(runs) = cli.max_concurrent_runs {
        config.scheduler.max_concurrent_runs = runs;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.enabled = true;
        config.metrics.port = port;
    }

    info!(
        node_id = %config.node_id,
        max_concurrent_runs = config.scheduler.max_concurrent_runs,
        sources = config.compiler.sources.len(),
        "Configuration loaded"
    );

    let compiler = ConditionCompiler::from_config(&config.compiler)?;

    match cli.command {
        Command::Compile { conditions } => compile(&compiler, &conditions),
        Command::Run {
            rules,
            transactions,
            once,
        } => {
            if config.metrics.enabled {
                if let Err(e) = start_metrics(config.metrics.port) {
                    error!(error = %e, "Failed to start metrics exporter");
                }
            }
            run(config, compiler, &rules, &transactions, once).await
        }
    }
}

fn start_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;
    info!(port, "Metrics exporter started");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn compile(compiler: &ConditionCompiler, path: &Path) -> anyhow::Result<()> {
    let normalized = normalize(read_json::<ConditionInput>(path)?);
    for key in &normalized.ignored_keys {
        warn!(key = %key, "Ignored legacy condition key");
    }
    let compilation = compiler.compile(&normalized.conditions);
    let output = serde_json::json!({
        "query": compilation.query,
        "warnings": compilation.warnings,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    config: AppConfig,
    compiler: ConditionCompiler,
    rules_path: &Path,
    transactions_path: &Path,
    once: bool,
) -> anyhow::Result<()> {
    let rules: Vec<RuleFileEntry> = read_json(rules_path)?;
    let transactions: Vec<Transaction> = read_json(transactions_path)?;
    info!(
        rules = rules.len(),
        transactions = transactions.len(),
        "Input loaded"
    );

    let engine = Arc::new(MemoryEngine::with_transactions(transactions));
    let catalog = Arc::new(MemoryCatalog::new());
    let events = noop_sink();
    let executor = Arc::new(Executor::new(
        engine.clone(),
        catalog.clone(),
        events.clone(),
        &config.scheduler,
    ));
    let mode = if once {
        SchedulerMode::Manual
    } else {
        SchedulerMode::Background
    };
    let scheduler = Arc::new(MaterializationScheduler::new(
        executor,
        catalog.clone(),
        events.clone(),
        config.scheduler.clone(),
        mode,
    ));
    let manager = SegmentManager::new(
        catalog,
        compiler,
        scheduler.clone(),
        engine,
        events,
        config.catalog.clone(),
    );

    let mut ids: HashMap<String, RuleId> = HashMap::new();
    for entry in rules {
        let normalized = normalize(entry.conditions);
        let mut builder = RuleBuilder::new(entry.name.clone())
            .schedule(entry.schedule)
            .conditions(normalized.conditions);
        if let Some(description) = entry.description {
            builder = builder.description(description);
        }
        if !entry.active {
            builder = builder.inactive();
        }
        if let Some(combine) = entry.combine {
            let deps = combine
                .rules
                .iter()
                .map(|name| {
                    ids.get(name)
                        .copied()
                        .with_context(|| format!("rule {} combines unknown rule {name}", entry.name))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            builder = builder.combine(combine.operation, deps);
        }

        let outcome = manager.create_rule(builder.build())?;
        for warning in &outcome.warnings {
            warn!(rule = %entry.name, condition = %warning.condition, reason = %warning.reason, "Condition dropped");
        }
        ids.insert(entry.name, outcome.entry.id());
    }

    if once {
        let report = scheduler.run_pass().await;
        let output = serde_json::json!({
            "report": report,
            "segments": manager.segment_records()?,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    info!(jobs = scheduler.job_keys().len(), "Audience Manager is running");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    scheduler.shutdown();
    Ok(())
}
