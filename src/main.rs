use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use quorum::agents::AgentRegistry;
use quorum::bus::{BusEvent, BusEventKind, EventBus, EventFilter};
use quorum::config::QuorumConfig;
use quorum::diagnostics::{CrashDumpWriter, ResourceMonitor};
use quorum::execute::ExecutorControl;
use quorum::kanban::{EngineCommand, KanbanEngine};
use quorum::model::KanbanColumn;
use quorum::runner::{WorkflowRunner, recover_zombies};
use quorum::store::StateStore;

#[derive(Parser)]
#[command(name = "quorum")]
#[command(version, about = "Multi-agent coding workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory (defaults to the current directory).
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a prompt and run the workflow to completion.
    Run {
        /// The natural-language prompt.
        prompt: String,
        /// Create the workflow without executing it (queue for the engine).
        #[arg(long)]
        queue: bool,
    },
    /// Print the kanban board.
    Board,
    /// Move a workflow to another column.
    Move {
        workflow_id: String,
        /// Target column: refinement, todo, in_progress, to_verify, done.
        column: String,
    },
    /// Kanban engine controls.
    Engine {
        #[command(subcommand)]
        command: EngineCommands,
    },
    /// Show workflow status, or all workflows when no id is given.
    Status { workflow_id: Option<String> },
    /// Resume a workflow from its last checkpoint boundary.
    Resume { workflow_id: String },
    /// Cancel a running workflow.
    Cancel { workflow_id: String },
    /// Permanently delete a workflow and its artifacts.
    Purge {
        workflow_id: String,
        #[arg(long)]
        force: bool,
    },
    /// Validate and print the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum EngineCommands {
    /// Start the tick loop (runs until interrupted).
    Start,
    /// Persistently disable the engine.
    Stop,
    /// Close the circuit breaker and re-enable picking.
    ResetBreaker,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate the configuration and print it.
    Check,
}

fn init_tracing(project_dir: &std::path::Path, verbose: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_filter = if verbose { "quorum=debug" } else { "quorum=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_env("QUORUM_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let logs_dir = QuorumConfig::logs_dir(project_dir);
    let file_layer = std::fs::create_dir_all(&logs_dir).ok().map(|_| {
        let appender = tracing_appender::rolling::daily(&logs_dir, "quorum.log");
        tracing_appender::non_blocking(appender)
    });

    match file_layer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}

struct App {
    config: QuorumConfig,
    store: StateStore,
    bus: EventBus,
    registry: AgentRegistry,
    project_dir: PathBuf,
}

impl App {
    fn open(project_dir: PathBuf) -> Result<Self> {
        let config = QuorumConfig::load(&project_dir)?;
        let store = StateStore::open(&QuorumConfig::db_path(&project_dir))?;
        let bus = EventBus::new();
        let registry = AgentRegistry::from_config(&config);
        Ok(Self {
            config,
            store,
            bus,
            registry,
            project_dir,
        })
    }

    fn runner(&self) -> WorkflowRunner {
        WorkflowRunner::new(
            self.config.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.bus.clone(),
            &self.project_dir,
        )
    }

    /// Print live progress to stderr while a workflow runs.
    fn spawn_progress_printer(&self) -> tokio::task::JoinHandle<()> {
        let mut subscription = self.bus.subscribe(EventFilter::for_kinds(vec![
            "phase_started",
            "phase_completed",
            "task_started",
            "task_completed",
            "task_failed",
            "task_retry",
            "warning",
        ]));
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                match &event.kind {
                    BusEventKind::PhaseStarted { phase } => {
                        eprintln!("==> phase {}", phase.as_str());
                    }
                    BusEventKind::PhaseCompleted { phase } => {
                        eprintln!("    phase {} done", phase.as_str());
                    }
                    BusEventKind::TaskStarted { task_id, agent, attempt } => {
                        eprintln!("    task {} started (agent {}, attempt {})", task_id, agent, attempt);
                    }
                    BusEventKind::TaskCompleted { task_id, .. } => {
                        eprintln!("    task {} completed", task_id);
                    }
                    BusEventKind::TaskFailed { task_id, error } => {
                        eprintln!("    task {} failed: {}", task_id, error);
                    }
                    BusEventKind::TaskRetry { task_id, attempt, .. } => {
                        eprintln!("    task {} retrying (attempt {})", task_id, attempt);
                    }
                    BusEventKind::Warning { message } => {
                        eprintln!("    warning: {}", message);
                    }
                    _ => {}
                }
            }
        })
    }

    async fn run_workflow(&self, workflow_id: &str) -> Result<()> {
        let printer = self.spawn_progress_printer();
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let cancel_on_interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received, cancelling workflow");
                cancel_on_interrupt.cancel();
            }
        });

        let status = self.runner().run(workflow_id, &cancel, control_rx).await?;
        printer.abort();
        println!("workflow {}: {}", workflow_id, status.as_str());
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to resolve current directory")?,
    };

    let _log_guard = init_tracing(&project_dir, cli.verbose);
    let crash_writer = Arc::new(CrashDumpWriter::new(
        QuorumConfig::crash_dir(&project_dir),
        10,
    ));
    crash_writer.install_panic_hook();

    let app = App::open(project_dir)?;
    app.bus
        .publish(BusEvent::engine("default", BusEventKind::ConfigLoaded))
        .await;

    match cli.command {
        Commands::Run { prompt, queue } => {
            let workflow = app.store.create_workflow("default", &prompt)?;
            println!("created workflow {}", workflow.id);
            if queue {
                app.store
                    .move_workflow_to_column(&workflow.id, KanbanColumn::Todo)?;
                println!("queued in todo; start the engine with `quorum engine start`");
            } else {
                app.run_workflow(&workflow.id).await?;
            }
        }

        Commands::Board => {
            let board = app.store.get_board("default")?;
            for column in &board.columns {
                println!("{} ({})", column.column.as_str(), column.workflows.len());
                for workflow in &column.workflows {
                    println!(
                        "  [{}] {} — {}",
                        workflow.status.as_str(),
                        workflow.id,
                        quorum::util::truncate_str(&workflow.prompt, 60)
                    );
                }
            }
        }

        Commands::Move { workflow_id, column } => {
            let column = KanbanColumn::from_str(&column).map_err(|e| anyhow::anyhow!(e))?;
            app.store.move_workflow_to_column(&workflow_id, column)?;
            println!("moved {} to {}", workflow_id, column.as_str());
        }

        Commands::Engine { command } => match command {
            EngineCommands::Start => {
                let report = recover_zombies(&app.store, &app.bus, &app.config.workflow).await?;
                for id in &report.resumed {
                    println!("re-queued zombie workflow {}", id);
                }
                for id in &report.failed {
                    println!("failed zombie workflow {}", id);
                }

                let engine = KanbanEngine::new(
                    app.store.clone(),
                    app.bus.clone(),
                    app.config.kanban.clone(),
                    Arc::new(app.runner()),
                );
                engine.set_enabled(true).await?;
                println!("engine running; ctrl-c to stop");

                let cancel = CancellationToken::new();
                let cancel_on_interrupt = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel_on_interrupt.cancel();
                    }
                });

                let monitor = Arc::new(ResourceMonitor::new(
                    app.config.diagnostics.clone(),
                    app.bus.clone(),
                ));
                let monitor_cancel = cancel.clone();
                let monitor_task = {
                    let monitor = Arc::clone(&monitor);
                    tokio::spawn(async move { monitor.run(&monitor_cancel).await })
                };

                let (_tx, rx) = tokio::sync::mpsc::unbounded_channel::<EngineCommand>();
                engine.run(&cancel, rx).await?;
                monitor_task.abort();
            }
            EngineCommands::Stop => {
                let engine = KanbanEngine::new(
                    app.store.clone(),
                    app.bus.clone(),
                    app.config.kanban.clone(),
                    Arc::new(app.runner()),
                );
                engine.set_enabled(false).await?;
                println!("engine disabled");
            }
            EngineCommands::ResetBreaker => {
                let engine = KanbanEngine::new(
                    app.store.clone(),
                    app.bus.clone(),
                    app.config.kanban.clone(),
                    Arc::new(app.runner()),
                );
                engine.reset_circuit_breaker().await?;
                println!("circuit breaker reset, engine enabled");
            }
        },

        Commands::Status { workflow_id } => match workflow_id {
            Some(id) => {
                let workflow = app
                    .store
                    .get_workflow(&id)?
                    .with_context(|| format!("workflow {} not found", id))?;
                println!("id:       {}", workflow.id);
                println!("status:   {}", workflow.status.as_str());
                println!("phase:    {}", workflow.current_phase.as_str());
                println!("column:   {}", workflow.kanban_column.as_str());
                println!("prompt:   {}", workflow.prompt);
                if let Some(refined) = &workflow.refined_prompt {
                    println!("refined:  {}", refined);
                }
                if let Some(branch) = &workflow.workflow_branch {
                    println!("branch:   {}", branch);
                }
                if let Some(error) = &workflow.error {
                    println!("error:    {}", error);
                }
                let tasks = app.store.get_tasks(&id)?;
                if !tasks.is_empty() {
                    println!("tasks:");
                    for task in tasks {
                        println!(
                            "  [{}] {} (attempt {})",
                            task.status.as_str(),
                            task.id,
                            task.attempt
                        );
                    }
                }
            }
            None => {
                for workflow in app.store.list_workflows("default")? {
                    println!(
                        "[{}] {} — {} ({})",
                        workflow.status.as_str(),
                        workflow.id,
                        quorum::util::truncate_str(&workflow.prompt, 50),
                        workflow.current_phase.as_str()
                    );
                }
            }
        },

        Commands::Resume { workflow_id } => {
            app.run_workflow(&workflow_id).await?;
        }

        Commands::Cancel { workflow_id } => {
            // Take the state lock so a live runner cannot be raced.
            let lock = app
                .store
                .acquire_lock(&workflow_id, chrono::Duration::seconds(60))?;
            let token = match lock {
                quorum::store::LockOutcome::Acquired(token) => token,
                quorum::store::LockOutcome::Held { holder_pid, .. } => {
                    anyhow::bail!(
                        "workflow {} is being executed by pid {}; interrupt that process instead",
                        workflow_id,
                        holder_pid
                    );
                }
            };
            let mut workflow = app
                .store
                .get_workflow(&workflow_id)?
                .with_context(|| format!("workflow {} not found", workflow_id))?;
            workflow.status = quorum::model::WorkflowStatus::Cancelled;
            workflow.current_phase = quorum::model::WorkflowPhase::Cancelled;
            app.store.save_workflow(&workflow)?;
            app.store.release_lock(&token)?;
            app.bus
                .publish(BusEvent::for_workflow(
                    workflow.id.clone(),
                    workflow.project_id.clone(),
                    BusEventKind::WorkflowCancelled,
                ))
                .await;
            println!("cancelled {}", workflow_id);
        }

        Commands::Purge { workflow_id, force } => {
            if !force {
                anyhow::bail!("purge is destructive; pass --force to confirm");
            }
            let existed = app.store.purge_workflow(&workflow_id)?;
            let runs_dir = QuorumConfig::runs_dir(&app.project_dir, &workflow_id);
            if runs_dir.exists() {
                std::fs::remove_dir_all(&runs_dir)
                    .with_context(|| format!("Failed to remove {}", runs_dir.display()))?;
            }
            if existed {
                println!("purged {}", workflow_id);
            } else {
                println!("workflow {} not found", workflow_id);
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Check => {
                println!(
                    "{}",
                    toml::to_string_pretty(&app.config).context("Failed to render config")?
                );
                println!("# configuration is valid");
            }
        },
    }

    Ok(())
}
