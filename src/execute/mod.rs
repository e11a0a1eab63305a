//! DAG task execution under isolation, retry and quality-monitoring policies.
//!
//! The scheduler repeatedly refills the ready-set (tasks whose dependencies
//! are all terminal), launches ready tasks up to the parallelism cap, waits
//! for any completion, persists and publishes, and loops until the graph is
//! drained or a fatal policy trips. Dependents of a failed task are skipped
//! transitively; failed tasks never pollute the workflow branch.
//!
//! A control channel accepts Pause (finish in-flight work, hold the
//! ready-set), Resume, and Cancel (cancels in-flight agents via the context
//! cascade; persisted state remains resumable).

mod retry;
mod watchdog;

pub use retry::RetryPolicy;
pub use watchdog::{Quality, WatchdogConfig, repetition_ratio, score_output};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, AgentRequest};
use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::{AgentPhase, ExecutionConfig, GitConfig, WorktreeMode};
use crate::errors::{AdapterError, AdapterErrorKind, WorkflowError};
use crate::git::{TaskWorktree, WorktreeManager, paths_outside_scope};
use crate::model::{AgentEvent, Task, TaskStatus, Workflow};
use crate::plan::TaskGraph;
use crate::store::StateStore;

/// Signals accepted by a running executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Pause,
    Resume,
    Cancel,
}

/// Handle for sending control signals into a running execution.
#[derive(Clone)]
pub struct ExecutorControl {
    tx: mpsc::UnboundedSender<ControlSignal>,
}

impl ExecutorControl {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControlSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn pause(&self) {
        let _ = self.tx.send(ControlSignal::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(ControlSignal::Resume);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(ControlSignal::Cancel);
    }
}

/// Result of finalization: push, PR, merge. Failures here never roll back
/// locally committed work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinalizationReport {
    pub pushed: bool,
    pub pr_url: Option<String>,
    pub merged: bool,
    pub errors: Vec<String>,
}

/// The checkpointed result of the Execute phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteArtifacts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
    pub finalization: FinalizationReport,
}

impl ExecuteArtifacts {
    pub fn success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }
}

/// Outcome of one task's run, sent back to the scheduler loop.
struct TaskOutcome {
    task: Task,
    worktree: Option<TaskWorktree>,
}

pub struct Executor {
    registry: AgentRegistry,
    store: StateStore,
    bus: EventBus,
    worktrees: WorktreeManager,
    config: ExecutionConfig,
    git_config: GitConfig,
}

impl Executor {
    pub fn new(
        registry: AgentRegistry,
        store: StateStore,
        bus: EventBus,
        worktrees: WorktreeManager,
        config: ExecutionConfig,
        git_config: GitConfig,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            worktrees,
            config,
            git_config,
        }
    }

    /// Run the workflow's task DAG to completion.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        workflow: &Workflow,
        mut control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Result<ExecuteArtifacts, WorkflowError> {
        let workflow_branch = workflow
            .workflow_branch
            .clone()
            .unwrap_or_else(|| workflow.branch_name());
        self.worktrees
            .ensure_workflow_branch(&workflow_branch)
            .await
            .map_err(WorkflowError::Infrastructure)?;

        let tasks = self
            .store
            .get_tasks(&workflow.id)
            .map_err(WorkflowError::Infrastructure)?;
        let graph = TaskGraph::build(
            &tasks
                .iter()
                .map(|task| (task.id.clone(), task.depends_on.clone()))
                .collect::<Vec<_>>(),
        )
        .map_err(WorkflowError::Plan)?;

        // Normalize rows left non-terminal by a crashed run: Running, Ready
        // and Retrying all restart from Pending.
        let mut tasks = tasks;
        for task in tasks.iter_mut() {
            if !task.status.is_terminal() && task.status != TaskStatus::Pending {
                task.status = TaskStatus::Pending;
                self.store.upsert_task(task).map_err(WorkflowError::Infrastructure)?;
            }
        }

        let mut statuses: HashMap<String, TaskStatus> =
            tasks.iter().map(|task| (task.id.clone(), task.status)).collect();
        let task_map: HashMap<String, Task> =
            tasks.iter().map(|task| (task.id.clone(), task.clone())).collect();

        // Resume case: dependents of tasks that failed in a previous attempt
        // must be skipped now.
        let failed_ids: Vec<String> = statuses
            .iter()
            .filter(|(_, status)| **status == TaskStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();
        for id in failed_ids {
            self.skip_dependents(workflow, &graph, &id, &mut statuses).await?;
        }

        let child_cancel = cancel.child_token();
        let (result_tx, mut result_rx) = mpsc::channel::<TaskOutcome>(64);
        let mut active: HashMap<String, JoinHandle<()>> = HashMap::new();
        let mut paused = false;
        let mut cancelled = false;

        loop {
            // Launch ready tasks up to the cap.
            if !paused && !cancelled {
                let ready = self.ready_tasks(&graph, &statuses);
                let concurrent = active.len() + ready.len().min(self.config.max_parallel);
                for task_id in ready {
                    if active.len() >= self.config.max_parallel {
                        break;
                    }
                    let task = task_map
                        .get(&task_id)
                        .cloned()
                        .expect("graph ids come from the task list");

                    statuses.insert(task_id.clone(), TaskStatus::Running);

                    let use_worktree = match self.config.worktree_mode {
                        WorktreeMode::Enabled => true,
                        WorktreeMode::Disabled => false,
                        // Worktrees only once two or more tasks overlap.
                        WorktreeMode::Parallel => concurrent >= 2,
                    };

                    let worktree = if use_worktree {
                        match self
                            .worktrees
                            .create_task_worktree(&workflow_branch, &task_id)
                            .await
                        {
                            Ok(worktree) => Some(worktree),
                            Err(e) => {
                                tracing::warn!(
                                    task_id = task_id.as_str(),
                                    error = %e,
                                    "Worktree setup failed, falling back to shared directory"
                                );
                                None
                            }
                        }
                    } else {
                        None
                    };

                    let handle = self.spawn_task(
                        workflow,
                        task,
                        worktree,
                        child_cancel.child_token(),
                        result_tx.clone(),
                    );
                    active.insert(task_id, handle);
                }
            }

            // Done?
            if active.is_empty() {
                let all_terminal = statuses.values().all(|status| status.is_terminal());
                let any_ready = !self.ready_tasks(&graph, &statuses).is_empty();
                if cancelled || all_terminal || (!any_ready && !paused) {
                    break;
                }
            }

            tokio::select! {
                signal = control.recv(), if !cancelled => {
                    match signal {
                        Some(ControlSignal::Pause) => {
                            if !paused {
                                paused = true;
                                tracing::info!(workflow_id = %workflow.id, "Execution paused");
                                self.publish(workflow, BusEventKind::WorkflowPaused).await;
                            }
                        }
                        Some(ControlSignal::Resume) => {
                            if paused {
                                paused = false;
                                tracing::info!(workflow_id = %workflow.id, "Execution resumed");
                                self.publish(workflow, BusEventKind::WorkflowResumed).await;
                            }
                        }
                        Some(ControlSignal::Cancel) | None => {
                            cancelled = true;
                            child_cancel.cancel();
                        }
                    }
                }
                _ = cancel.cancelled(), if !cancelled => {
                    cancelled = true;
                    child_cancel.cancel();
                }
                outcome = result_rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    if let Some(handle) = active.remove(&outcome.task.id) {
                        handle.await.ok();
                    }
                    self.handle_outcome(workflow, &workflow_branch, &graph, outcome, &mut statuses)
                        .await?;
                }
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }

        // Cancelled with work still pending: leave non-terminal rows as they
        // are so a resume can pick them up.
        let completed = statuses.values().filter(|s| **s == TaskStatus::Completed).count();
        let failed = statuses.values().filter(|s| **s == TaskStatus::Failed).count();
        let skipped = statuses.values().filter(|s| **s == TaskStatus::Skipped).count();

        let mut artifacts = ExecuteArtifacts {
            completed,
            failed,
            skipped,
            cancelled,
            finalization: FinalizationReport::default(),
        };

        if artifacts.success() {
            artifacts.finalization = self.finalize(workflow, &workflow_branch).await;
        }

        Ok(artifacts)
    }

    fn ready_tasks(&self, graph: &TaskGraph, statuses: &HashMap<String, TaskStatus>) -> Vec<String> {
        let done: HashSet<usize> = statuses
            .iter()
            .filter(|(_, status)| status.satisfies_dependency())
            .filter_map(|(id, _)| graph.index_of(id))
            .collect();

        graph
            .ids()
            .iter()
            .filter(|id| statuses.get(*id) == Some(&TaskStatus::Pending))
            .filter(|id| {
                graph
                    .index_of(id)
                    .map(|index| graph.dependencies_satisfied(index, &done))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    fn spawn_task(
        &self,
        workflow: &Workflow,
        task: Task,
        worktree: Option<TaskWorktree>,
        task_cancel: CancellationToken,
        result_tx: mpsc::Sender<TaskOutcome>,
    ) -> JoinHandle<()> {
        let runner = TaskRunner {
            registry: self.registry.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            worktrees: self.worktrees.clone(),
            policy: RetryPolicy::from_config(&self.config),
            watchdog: WatchdogConfig {
                grace: Duration::from_secs(self.config.watchdog_grace_secs),
                repetition_threshold: self.config.repetition_threshold,
                ..Default::default()
            },
            workflow_id: workflow.id.clone(),
            project_id: workflow.project_id.clone(),
            execution_id: workflow.execution_id.clone().unwrap_or_default(),
        };
        let workdir = worktree
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_else(|| self.worktrees.project_dir().to_path_buf());

        tokio::spawn(async move {
            let task = runner.run(task, workdir, task_cancel).await;
            let _ = result_tx.send(TaskOutcome { task, worktree }).await;
        })
    }

    /// Apply a finished task: merge into the workflow branch, clean up the
    /// worktree, publish, persist, cascade skips. Merges are serialised here
    /// on the scheduler loop because they check out branches in the main
    /// working directory.
    async fn handle_outcome(
        &self,
        workflow: &Workflow,
        workflow_branch: &str,
        graph: &TaskGraph,
        outcome: TaskOutcome,
        statuses: &mut HashMap<String, TaskStatus>,
    ) -> Result<(), WorkflowError> {
        let mut task = outcome.task;

        if task.status == TaskStatus::Completed {
            if let Some(ref worktree) = outcome.worktree {
                let merged = self
                    .worktrees
                    .merge_task_branch(&worktree.branch, workflow_branch)
                    .await
                    .map_err(WorkflowError::Infrastructure)?;
                if !merged {
                    task.status = TaskStatus::Failed;
                    task.error = Some(format!(
                        "merge conflict merging {} into {}",
                        worktree.branch, workflow_branch
                    ));
                }
            }
        }

        // Worktree cleanup: completed and cancelled tasks clean up (a resume
        // recreates the worktree fresh); failed tasks keep theirs for
        // inspection unless auto_clean is set.
        if let Some(ref worktree) = outcome.worktree {
            let clean = task.status != TaskStatus::Failed || self.config.auto_clean;
            if clean {
                if let Err(e) = self.worktrees.remove_worktree(&worktree.path).await {
                    tracing::warn!(task_id = %task.id, error = %e, "Worktree cleanup failed");
                } else {
                    let _ = self.worktrees.delete_branch(&worktree.branch).await;
                }
            } else {
                tracing::info!(
                    task_id = %task.id,
                    path = %worktree.path.display(),
                    "Preserving worktree of failed task for inspection"
                );
            }
        }

        statuses.insert(task.id.clone(), task.status);

        // Completion events precede the state-save of the task row.
        match task.status {
            TaskStatus::Completed => {
                self.publish(
                    workflow,
                    BusEventKind::TaskCompleted {
                        task_id: task.id.clone(),
                        tokens_in: task.tokens_in,
                        tokens_out: task.tokens_out,
                    },
                )
                .await;
            }
            TaskStatus::Failed => {
                self.publish(
                    workflow,
                    BusEventKind::TaskFailed {
                        task_id: task.id.clone(),
                        error: task.error.clone().unwrap_or_default(),
                    },
                )
                .await;
            }
            // A cancelled attempt leaves the task Pending and resumable.
            _ => {
                self.publish(
                    workflow,
                    BusEventKind::TaskProgress {
                        task_id: task.id.clone(),
                        message: "attempt cancelled".to_string(),
                    },
                )
                .await;
            }
        }
        self.store.upsert_task(&task).map_err(WorkflowError::Infrastructure)?;

        if task.status == TaskStatus::Failed {
            self.skip_dependents(workflow, graph, &task.id, statuses).await?;
        }
        Ok(())
    }

    /// Transitively mark every dependent of a failed task as Skipped.
    async fn skip_dependents(
        &self,
        workflow: &Workflow,
        graph: &TaskGraph,
        failed_id: &str,
        statuses: &mut HashMap<String, TaskStatus>,
    ) -> Result<(), WorkflowError> {
        let Some(start) = graph.index_of(failed_id) else {
            return Ok(());
        };
        let mut stack = vec![start];
        while let Some(index) = stack.pop() {
            for &dependent in graph.dependents(index) {
                let id = graph.id_of(dependent).unwrap_or_default().to_string();
                let current = statuses.get(&id).copied();
                if current == Some(TaskStatus::Pending) {
                    statuses.insert(id.clone(), TaskStatus::Skipped);
                    if let Some(mut task) =
                        self.store.get_task(&workflow.id, &id).map_err(WorkflowError::Infrastructure)?
                    {
                        task.status = TaskStatus::Skipped;
                        task.error = Some(format!("dependency {} failed", failed_id));
                        self.publish(
                            workflow,
                            BusEventKind::TaskSkipped {
                                task_id: id.clone(),
                                reason: format!("dependency {} failed", failed_id),
                            },
                        )
                        .await;
                        self.store.upsert_task(&task).map_err(WorkflowError::Infrastructure)?;
                    }
                    stack.push(dependent);
                }
            }
        }
        Ok(())
    }

    /// Push, PR and merge per configuration. Errors are collected, not
    /// propagated: locally committed work is never rolled back.
    async fn finalize(&self, workflow: &Workflow, branch: &str) -> FinalizationReport {
        let mut report = FinalizationReport::default();

        if !self.git_config.auto_push {
            return report;
        }
        match self.worktrees.push_branch(branch).await {
            Ok(()) => report.pushed = true,
            Err(e) => {
                report.errors.push(format!("push failed: {}", e));
                self.warn(workflow, &format!("push failed: {}", e)).await;
                return report;
            }
        }

        if !self.git_config.auto_pr {
            return report;
        }
        let title = crate::util::truncate_str(workflow.effective_prompt(), 72);
        let body = format!(
            "Automated implementation for workflow `{}`.\n\n{}",
            workflow.id,
            workflow.effective_prompt()
        );
        match self
            .worktrees
            .create_pull_request(&title, &body, self.git_config.pr_base_branch.as_deref())
            .await
        {
            Ok(url) => report.pr_url = Some(url),
            Err(e) => {
                report.errors.push(format!("pr creation failed: {}", e));
                self.warn(workflow, &format!("pr creation failed: {}", e)).await;
                return report;
            }
        }

        if !self.git_config.auto_merge {
            return report;
        }
        match self
            .worktrees
            .merge_pull_request(branch, self.git_config.merge_strategy)
            .await
        {
            Ok(()) => report.merged = true,
            Err(e) => {
                report.errors.push(format!("pr merge failed: {}", e));
                self.warn(workflow, &format!("pr merge failed: {}", e)).await;
            }
        }
        report
    }

    async fn publish(&self, workflow: &Workflow, kind: BusEventKind) {
        self.bus
            .publish(BusEvent::for_workflow(
                workflow.id.clone(),
                workflow.project_id.clone(),
                kind,
            ))
            .await;
    }

    async fn warn(&self, workflow: &Workflow, message: &str) {
        self.publish(
            workflow,
            BusEventKind::Warning {
                message: message.to_string(),
            },
        )
        .await;
    }
}

/// Everything one spawned task needs, cloneable into its tokio task.
struct TaskRunner {
    registry: AgentRegistry,
    store: StateStore,
    bus: EventBus,
    worktrees: WorktreeManager,
    policy: RetryPolicy,
    watchdog: WatchdogConfig,
    workflow_id: String,
    project_id: String,
    execution_id: String,
}

impl TaskRunner {
    /// Run one task to a terminal status, retrying retryable adapter errors.
    async fn run(&self, mut task: Task, workdir: PathBuf, cancel: CancellationToken) -> Task {
        let prompt = build_task_prompt(&task);

        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.backoff_delay(attempt - 1);
                task.status = TaskStatus::Retrying;
                self.persist(&task).await;
                self.publish(BusEventKind::TaskRetry {
                    task_id: task.id.clone(),
                    attempt: attempt + 1,
                    delay_ms: delay.as_millis() as u64,
                })
                .await;
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return self.mark_cancelled(task).await;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            task.status = TaskStatus::Running;
            task.attempt = attempt + 1;
            task.started_at = Some(Utc::now());
            self.persist(&task).await;
            self.publish(BusEventKind::TaskStarted {
                task_id: task.id.clone(),
                agent: task.agent.clone(),
                attempt: task.attempt,
            })
            .await;

            match self.attempt(&task, &prompt, &workdir, &cancel).await {
                Ok(response) => {
                    // File-scope enforcement before commit. The worktree is
                    // left intact on violation; there is no auto-revert.
                    let changed = match self.worktrees.changed_paths(&workdir) {
                        Ok(changed) => changed,
                        Err(e) => {
                            task.status = TaskStatus::Failed;
                            task.error = Some(format!("change inspection failed: {}", e));
                            task.completed_at = Some(Utc::now());
                            self.persist(&task).await;
                            return task;
                        }
                    };
                    let violations = paths_outside_scope(&changed, &task.scope);
                    if !changed.is_empty() && !violations.is_empty() {
                        tracing::warn!(
                            task_id = %task.id,
                            ?violations,
                            "File-scope violation"
                        );
                        task.status = TaskStatus::Failed;
                        task.error = Some(format!(
                            "scope_violation: modified paths outside declared scope: {}",
                            violations
                                .iter()
                                .map(|p| p.display().to_string())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ));
                        task.completed_at = Some(Utc::now());
                        self.persist(&task).await;
                        return task;
                    }

                    if !changed.is_empty() {
                        let message = format!("{}: {}", task.id, task.name);
                        if let Err(e) = self.worktrees.commit_all(&workdir, &message).await {
                            task.status = TaskStatus::Failed;
                            task.error = Some(format!("commit failed: {}", e));
                            task.completed_at = Some(Utc::now());
                            self.persist(&task).await;
                            return task;
                        }
                    }

                    task.status = TaskStatus::Completed;
                    task.error = None;
                    task.tokens_in = response.tokens_in;
                    task.tokens_out = response.tokens_out;
                    task.completed_at = Some(Utc::now());
                    self.persist(&task).await;
                    return task;
                }
                Err(e) if self.policy.should_retry(&e, attempt) => {
                    tracing::warn!(
                        task_id = %task.id,
                        attempt,
                        error = %e,
                        "Retryable task failure"
                    );
                    continue;
                }
                Err(e) if e.kind == AdapterErrorKind::Cancelled => {
                    return self.mark_cancelled(task).await;
                }
                Err(e) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.to_string());
                    task.completed_at = Some(Utc::now());
                    self.persist(&task).await;
                    return task;
                }
            }
        }
        unreachable!("attempt loop always returns")
    }

    /// One agent invocation with the output-quality watchdog attached.
    async fn attempt(
        &self,
        task: &Task,
        prompt: &str,
        workdir: &PathBuf,
        cancel: &CancellationToken,
    ) -> Result<crate::agents::AgentResponse, AdapterError> {
        let attempt_cancel = cancel.child_token();
        let (observation_tx, mut observation_rx) =
            mpsc::unbounded_channel::<crate::agents::stream::Observation>();
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();

        let watchdog = tokio::spawn(watchdog::watch(
            self.watchdog.clone(),
            prompt.to_string(),
            chunk_rx,
            attempt_cancel.clone(),
        ));

        // Forward observations to the bus as agent events; chunk text also
        // feeds the watchdog.
        let bus = self.bus.clone();
        let agent_name = task.agent.clone();
        let workflow_id = self.workflow_id.clone();
        let project_id = self.project_id.clone();
        let execution_id = self.execution_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(observation) = observation_rx.recv().await {
                if observation.kind == crate::model::AgentEventKind::Chunk {
                    if let Some(text) = observation.payload.get("text").and_then(|t| t.as_str()) {
                        let _ = chunk_tx.send(text.to_string());
                    }
                }
                let event = AgentEvent::new(
                    observation.kind,
                    agent_name.clone(),
                    workflow_id.clone(),
                    execution_id.clone(),
                    observation.payload,
                );
                bus.publish(BusEvent::for_workflow(
                    workflow_id.clone(),
                    project_id.clone(),
                    BusEventKind::AgentEvent { event },
                ))
                .await;
            }
        });

        let request = AgentRequest::prompt(prompt.to_string())
            .with_model(task.model.clone())
            .with_workdir(workdir.clone())
            .with_phase(AgentPhase::Execute)
            .with_events(observation_tx);

        let result = self.registry.execute(&task.agent, &attempt_cancel, request).await;

        forwarder.await.ok();
        let tripped = watchdog.await.ok().flatten();

        match result {
            Err(e) if e.kind == AdapterErrorKind::Cancelled => {
                if let Some(reason) = tripped {
                    // The watchdog, not the user, cancelled this attempt.
                    Err(AdapterError::invocation(
                        &task.agent,
                        format!("low quality output: {}", reason),
                    ))
                } else {
                    Err(e)
                }
            }
            other => other,
        }
    }

    /// A cancelled attempt returns the task to Pending so persisted state
    /// stays resumable; the error field records the interruption.
    async fn mark_cancelled(&self, mut task: Task) -> Task {
        task.status = TaskStatus::Pending;
        task.error = Some("cancelled".to_string());
        self.persist(&task).await;
        task
    }

    async fn persist(&self, task: &Task) {
        if let Err(e) = self.store.upsert_task(task) {
            tracing::error!(task_id = %task.id, error = %e, "Failed to persist task");
        }
    }

    async fn publish(&self, kind: BusEventKind) {
        self.bus
            .publish(BusEvent::for_workflow(
                self.workflow_id.clone(),
                self.project_id.clone(),
                kind,
            ))
            .await;
    }
}

/// The self-contained prompt handed to the task's agent.
fn build_task_prompt(task: &Task) -> String {
    let scope = if task.scope.is_empty() {
        "(none declared)".to_string()
    } else {
        task.scope.join("\n- ")
    };
    let done = if task.done_criteria.is_empty() {
        "All described changes are implemented and consistent."
    } else {
        &task.done_criteria
    };
    format!(
        "## Task: {}\n\n{}\n\n## File scope\nModify ONLY these paths:\n- {}\n\n\
         ## Definition of done\n{}\n",
        task.name, task.description, scope, done,
    )
}
