mod config_watcher;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use config_watcher::ConfigWatcher;
use fleet_backends::{http_backends, BackendRouter, ModelRegistry};
use fleet_core::{BackendId, FleetConfig, Priority};
use fleet_orchestrator::{
    AllowAll, ComplexityAnalyzer, ExpertMatchingEngine, InMemoryExpertDirectory,
    InMemoryTaskStore, Orchestrator, Submission, Submitter, TaskDecomposer, WorkerPool,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet", about = "Fleet: expert-fleet orchestration over local model servers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "fleet.toml")]
    config: PathBuf,

    /// Task snapshot file
    #[arg(long, default_value = "fleet-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator loop and the worker pool until interrupted
    Run {
        /// Do not hot-reload analyzer and matching settings
        #[arg(long)]
        no_watch: bool,
        /// Seconds between task snapshot saves
        #[arg(long, default_value_t = 30)]
        save_every: u64,
    },
    /// Submit a goal; simple goals are answered immediately
    Submit {
        goal: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_enum)]
        priority: Option<PriorityArg>,
    },
    /// Show the models each backend currently serves
    Models,
    /// Score a goal's complexity
    Classify { goal: String },
    /// Split a goal into a subtask DAG
    Decompose {
        goal: String,
        #[arg(long)]
        category: Option<String>,
        /// Skip the model and use the heuristic split
        #[arg(long)]
        heuristic: bool,
    },
    /// Validate the configuration file
    CheckConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum PriorityArg {
    High,
    Medium,
    Low,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => Priority::High,
            PriorityArg::Medium => Priority::Medium,
            PriorityArg::Low => Priority::Low,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    if let Commands::CheckConfig = cli.command {
        return check_config(&cli.config);
    }
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            no_watch,
            save_every,
        } => run(&cli, config, !no_watch, save_every).await?,
        Commands::Submit {
            ref goal,
            ref category,
            priority,
        } => {
            let store = Arc::new(InMemoryTaskStore::load(&cli.state).await?);
            let (_, router) = build_router(&config).await;
            let submitter = Submitter::new(
                store.clone(),
                Arc::new(ComplexityAnalyzer::new(config.analyzer.clone())),
                router,
                Arc::new(AllowAll),
            );
            let mut submission = Submission::new(goal.clone());
            if let Some(category) = category {
                submission = submission.with_category(category.clone());
            }
            if let Some(priority) = priority {
                submission = submission.with_priority(priority.into());
            }
            let outcome = submitter.submit(submission).await?;
            store.save(&cli.state).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Models => {
            let (registry, _) = build_router(&config).await;
            println!("{}", serde_json::to_string_pretty(&registry.report())?);
        }
        Commands::Classify { ref goal } => {
            let analyzer = ComplexityAnalyzer::new(config.analyzer.clone());
            let complexity = analyzer.classify(goal);
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "complexity": complexity,
                    "category": analyzer.infer_category(goal),
                }))?
            );
        }
        Commands::Decompose {
            ref goal,
            ref category,
            heuristic,
        } => {
            let mut decomposer_config = config.decomposer.clone();
            decomposer_config.heuristic_only |= heuristic;
            let (_, router) = build_router(&config).await;
            let decomposer = TaskDecomposer::new(router, decomposer_config)?;
            let decomposition = decomposer.decompose(goal, category.as_deref(), None).await;
            let estimate = decomposition.graph.estimate()?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "heuristic": decomposition.heuristic,
                    "subtasks": decomposition.graph,
                    "estimate": estimate,
                }))?
            );
        }
        Commands::CheckConfig => {}
    }

    Ok(())
}

/// Loads the config file, or the built-in defaults when it does not exist.
fn load_config(path: &Path) -> anyhow::Result<FleetConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(FleetConfig::default());
    }
    FleetConfig::load(path).with_context(|| format!("Invalid config '{}'", path.display()))
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::load(path)
        .with_context(|| format!("Invalid config '{}'", path.display()))?;
    let backends: Vec<serde_json::Value> = [BackendId::Fast, BackendId::Batch]
        .iter()
        .map(|id| {
            let backend = config.backends.get(*id);
            serde_json::json!({
                "backend": id,
                "base_url": backend.base_url,
                "max_concurrent": backend.max_concurrent,
                "max_queue": backend.max_queue,
                "categories": backend.categories.len(),
            })
        })
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "valid": true,
            "backends": backends,
            "fallback_order": config.backends.fallback_order,
            "experts": config.experts.iter().map(|e| &e.name).collect::<Vec<_>>(),
            "worker_concurrency": config.worker.max_concurrent,
        }))?
    );
    Ok(())
}

async fn build_router(config: &FleetConfig) -> (Arc<ModelRegistry>, Arc<BackendRouter>) {
    let backends = http_backends(config);
    let registry = Arc::new(ModelRegistry::new(
        backends.clone(),
        &config.backends,
        &config.registry,
    ));
    registry.refresh(true).await;
    let router = Arc::new(BackendRouter::new(Arc::clone(&registry), backends, config));
    (registry, router)
}

async fn run(cli: &Cli, config: FleetConfig, watch: bool, save_every: u64) -> anyhow::Result<()> {
    let store = Arc::new(InMemoryTaskStore::load(&cli.state).await?);
    info!(tasks = store.len(), state = %cli.state.display(), "Task store loaded");

    let (registry, router) = build_router(&config).await;
    if !registry.has_available_models() {
        warn!("No backend reported any model; tasks will wait until one does");
    }
    let refresh = Arc::clone(&registry).spawn_refresh();

    let analyzer = Arc::new(ComplexityAnalyzer::new(config.analyzer.clone()));
    let matcher = Arc::new(ExpertMatchingEngine::new(
        Arc::new(InMemoryExpertDirectory::new(config.experts.clone())),
        store.clone(),
        Arc::clone(&registry),
        config.matching.clone(),
    ));
    let decomposer = Arc::new(TaskDecomposer::new(
        router.clone(),
        config.decomposer.clone(),
    )?);
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        Arc::clone(&analyzer),
        decomposer,
        Arc::clone(&matcher),
        config.orchestrator.clone(),
    ));
    let workers = Arc::new(WorkerPool::new(
        store.clone(),
        router.clone(),
        config.worker.clone(),
    ));

    let _watcher = if watch && cli.config.exists() {
        let analyzer = Arc::clone(&analyzer);
        let matcher = Arc::clone(&matcher);
        Some(ConfigWatcher::start(cli.config.clone(), 500, move |reloaded| {
            if let Err(e) = analyzer.update_config(reloaded.analyzer) {
                warn!(error = %e, "Analyzer settings not applied");
            }
            if let Err(e) = matcher.update_config(reloaded.matching) {
                warn!(error = %e, "Matching settings not applied");
            }
            info!("Configuration reloaded");
        })?)
    } else {
        None
    };

    let mut handles = vec![refresh, Arc::clone(&orchestrator).spawn()];
    handles.extend(Arc::clone(&workers).spawn());
    info!(
        experts = config.experts.len(),
        workers = config.worker.max_concurrent,
        "Fleet running"
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(save_every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Err(e) = store.save(&cli.state).await {
                    warn!(error = %e, "Failed to save task snapshot");
                }
            }
        }
    }

    for handle in &handles {
        handle.abort();
    }
    store.save(&cli.state).await?;
    info!(
        monitor = %workers.monitor().to_json().await,
        router = %serde_json::to_string(&router.status()).unwrap_or_default(),
        "Fleet stopped"
    );
    Ok(())
}
