//! Tooltune - 工具定义自我调优循环
//!
//! 入口：初始化日志、加载配置，按子命令运行循环或查看状态。
//!
//! 用法：
//!   tooltune run [--config FILE] [--resume]
//!   tooltune status [--config FILE]
//!   tooltune stats [--config FILE]
//!   tooltune history [LIMIT] [--config FILE]
//!   tooltune schema [--config FILE]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tooltune::{
    config::{load_config, AppConfig},
    core::{EvolutionError, ShutdownManager},
    evolution::{
        default_checks, runner::command_bridge, AgentRunner, CommandAgentRunner, CommandComparator,
        CommandEnvironment, EvolutionConfig, EvolutionLoop, GitTracker, ImprovementLedger, LoopComponents,
        ProgressSnapshot, RegressionValidator, TestCase, VersionControl,
    },
    observability,
    telemetry::TelemetryStore,
    tools::{serializer_for, DefinitionRepository, InMemoryToolRegistry, ToolRegistry},
};

struct Args {
    command: String,
    config: Option<PathBuf>,
    resume: bool,
    limit: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        command: "run".to_string(),
        config: None,
        resume: false,
        limit: 20,
    };
    let mut positional = Vec::new();
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                args.config = Some(PathBuf::from(iter.next().context("--config requires a path")?));
            }
            "--resume" => args.resume = true,
            "-h" | "--help" => {
                println!("usage: tooltune [run|status|stats|history [LIMIT]|schema] [--config FILE] [--resume]");
                std::process::exit(0);
            }
            other => positional.push(other.to_string()),
        }
    }
    if let Some(command) = positional.first() {
        args.command = command.clone();
    }
    if let Some(limit) = positional.get(1) {
        args.limit = limit.parse().context("history limit must be a number")?;
    }
    Ok(args)
}

fn definition_repository(cfg: &AppConfig) -> anyhow::Result<DefinitionRepository> {
    let serializer = serializer_for(&cfg.storage.definitions_format)?;
    Ok(DefinitionRepository::new(cfg.definitions_file(), serializer))
}

async fn run(cfg: AppConfig, resume: bool) -> anyhow::Result<()> {
    let test_case_path = cfg
        .app
        .test_case
        .clone()
        .context("[app] test_case is required for `run`")?;
    let test_case = TestCase::load(&test_case_path)
        .await
        .with_context(|| format!("Failed to load test case {}", test_case_path.display()))?;

    let evolution_config = EvolutionConfig::from(cfg.evolution.clone());
    let timeout = Duration::from_secs(cfg.runner.command_timeout_secs);

    let telemetry = Arc::new(
        TelemetryStore::new(cfg.telemetry_dir())
            .with_poll_interval(Duration::from_millis(evolution_config.poll_interval_ms)),
    );
    let repository = definition_repository(&cfg)?;
    let definitions = repository.load().await?;

    let checks = default_checks();
    let check_tools: Vec<String> = checks
        .iter()
        .flat_map(|c| {
            c.required_tools
                .iter()
                .cloned()
                .chain(c.setup.iter().chain(&c.execute).chain(&c.cleanup).map(|s| s.tool.clone()))
                .chain(std::iter::once(c.validate.tool.clone()))
        })
        .collect();
    let bridge: Arc<dyn ToolRegistry> = if cfg.runner.tool_command.is_empty() {
        tracing::warn!("[runner] tool_command not configured, regression checks will report missing tools");
        Arc::new(InMemoryToolRegistry::new())
    } else {
        Arc::new(command_bridge(&cfg.runner.tool_command, &definitions, &check_tools, timeout))
    };
    let mut validator = RegressionValidator::new(bridge);
    for check in checks {
        validator.register(Arc::new(check));
    }
    tracing::info!(checks = ?validator.check_names(), "regression checks registered");

    let version_control: Option<Arc<dyn VersionControl>> = if cfg.git.enabled {
        Some(Arc::new(
            GitTracker::new(&cfg.git.repo_root)
                .with_timeout(Duration::from_secs(cfg.git.timeout_secs))
                .with_branch_prefix(cfg.git.branch_prefix.clone())
                .with_tracked_path(cfg.definitions_file()),
        ))
    } else {
        None
    };
    let runner: Arc<dyn AgentRunner> = Arc::new(CommandAgentRunner::new(cfg.runner.command.clone()));

    let components = LoopComponents {
        telemetry,
        definitions: repository,
        ledger: ImprovementLedger::open(cfg.history_file()).await?,
        validator,
        environment: Arc::new(CommandEnvironment::new(
            cfg.runner.reset_command.clone(),
            cfg.runner.metrics_command.clone(),
            cfg.runner.observe_command.clone(),
            timeout,
        )),
        comparator: Arc::new(CommandComparator::new(cfg.runner.compare_command.clone(), timeout)),
        runner: Some(runner),
        version_control,
    };

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let agents = evolution_config.agents_per_generation;
    let mut evolution = EvolutionLoop::new(evolution_config, components)
        .await?
        .with_cancellation(shutdown.token())
        .with_progress_file(cfg.progress_file())
        .with_report_file(cfg.report_file());

    let progress_file = cfg.progress_file();
    if resume && progress_file.exists() {
        evolution.load_progress(&progress_file).await?;
    } else {
        evolution.initialize(test_case, agents).await?;
    }

    let summary = match evolution.run().await {
        Ok(summary) => summary,
        Err(EvolutionError::Cancelled) => {
            let reason = shutdown.reason().map(|r| r.to_string()).unwrap_or_else(|| "cancellation".into());
            println!(
                "Stopped by {} in generation {} ({}). Resume with `tooltune run --resume`; progress is in {}",
                reason,
                evolution.generation(),
                evolution.phase(),
                progress_file.display()
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("Evolution run failed"),
    };
    println!("{}", evolution.monitor().progress_report());
    println!("{}", summary);
    Ok(())
}

async fn status(cfg: &AppConfig) -> anyhow::Result<()> {
    let path = cfg.progress_file();
    let content = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("No progress file at {}", path.display()))?;
    let snapshot: ProgressSnapshot = serde_json::from_str(&content)?;
    println!("Phase:       {}", snapshot.phase);
    println!("Generation:  {} / {}", snapshot.generation, snapshot.config.max_generations);
    println!("Agents:      {} / {}", snapshot.current_agent_index, snapshot.agent_count);
    println!("Improvements applied: {}", snapshot.improvements.len());
    for g in &snapshot.generations {
        println!(
            "  gen {:>3}: avg {:>5.1}  best {:>5.1}  worst {:>5.1}",
            g.generation, g.average_score, g.best_score, g.worst_score
        );
    }
    if let Some(pending) = &snapshot.pending {
        println!(
            "Pending:     {} {} (before {:.1})",
            pending.improvement.kind, pending.improvement.tool, pending.before_score
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config.clone()).context("Failed to load configuration")?;

    match args.command.as_str() {
        "run" => run(cfg, args.resume).await?,
        "status" => status(&cfg).await?,
        "stats" => {
            let ledger = ImprovementLedger::open(cfg.history_file()).await?;
            println!("{}", serde_json::to_string_pretty(&ledger.get_statistics())?);
        }
        "history" => {
            let tracker = GitTracker::new(&cfg.git.repo_root)
                .with_timeout(Duration::from_secs(cfg.git.timeout_secs));
            for entry in tracker.get_improvement_history(args.limit).await? {
                println!(
                    "{} {} gen {} {}: {}",
                    &entry.hash[..entry.hash.len().min(10)],
                    entry.date,
                    entry.generation.map(|g| g.to_string()).unwrap_or_else(|| "?".into()),
                    entry.kind,
                    entry.tool
                );
            }
        }
        "schema" => {
            let definitions = definition_repository(&cfg)?.load().await?;
            println!("{}", definitions.to_schema_json());
        }
        other => bail!("Unknown command: {} (expected run, status, stats, history or schema)", other),
    }
    Ok(())
}
