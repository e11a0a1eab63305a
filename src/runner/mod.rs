//! The workflow runner: a phase state machine with crash-safe checkpointing.
//!
//! ```text
//! Pending ─start→ Refining ─ok→ Analyzing ─ok→ Planning ─ok→ Executing ─ok→ Completed
//!    │              │             │             │             │
//!    └─ cancel ─────┴─────────────┴─────────────┴─────────────┴────→ Cancelled
//!                   │             │             │             │
//!                   └─ error ─────┴─────────────┴─────────────┴────→ Failed
//! ```
//!
//! Each phase loads the prior phases' checkpoints, does its work, persists
//! its own checkpoint and publishes phase events. Resume replays from the
//! last complete checkpoint boundary, never mid-phase. While running, a
//! background task writes heartbeats; a priority bus subscription persists
//! every published agent event before the terminal workflow event goes out,
//! and the terminal status is persisted before the terminal event is
//! published.

mod recovery;

pub use recovery::{RecoveryReport, recover_zombies};

use chrono::Utc;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::AgentRegistry;
use crate::analyze::{AnalysisArtifacts, Analyzer};
use crate::artifacts::RunArtifacts;
use crate::bus::{BusEvent, BusEventKind, EventBus, EventFilter};
use crate::config::QuorumConfig;
use crate::errors::{AdapterErrorKind, WorkflowError};
use crate::execute::{ControlSignal, Executor};
use crate::git::WorktreeManager;
use crate::model::{Task, TaskStatus, Workflow, WorkflowPhase, WorkflowStatus};
use crate::plan::Planner;
use crate::refine::Refiner;
use crate::store::{LockOutcome, StateStore};

pub struct WorkflowRunner {
    config: QuorumConfig,
    registry: AgentRegistry,
    store: StateStore,
    bus: EventBus,
    project_dir: PathBuf,
}

impl WorkflowRunner {
    pub fn new(
        config: QuorumConfig,
        registry: AgentRegistry,
        store: StateStore,
        bus: EventBus,
        project_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            bus,
            project_dir: project_dir.into(),
        }
    }

    /// Run a workflow to a terminal status under its state lock.
    pub async fn run(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let lock = self
            .store
            .acquire_lock(
                workflow_id,
                chrono::Duration::seconds(self.config.workflow.lock_ttl_secs as i64),
            )
            .map_err(WorkflowError::Infrastructure)?;

        let token = match lock {
            LockOutcome::Acquired(token) => token,
            LockOutcome::Held {
                holder_pid,
                holder_host,
                ..
            } => {
                return Err(WorkflowError::LockConflict {
                    workflow_id: workflow_id.to_string(),
                    holder_pid,
                    holder_host,
                });
            }
        };

        let result = self.run_locked(workflow_id, cancel, control).await;

        if let Err(e) = self.store.release_lock(&token) {
            tracing::error!(workflow_id, error = %e, "Lock release failed");
        }
        result
    }

    async fn run_locked(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Result<WorkflowStatus, WorkflowError> {
        crate::diagnostics::preflight(&self.config.diagnostics)?;

        let mut workflow = self
            .store
            .get_workflow(workflow_id)
            .map_err(WorkflowError::Infrastructure)?
            .ok_or_else(|| {
                WorkflowError::Validation(format!("workflow {} not found", workflow_id))
            })?;

        let execution_id = crate::ids::execution_id();
        workflow.execution_id = Some(execution_id.clone());
        workflow.status = WorkflowStatus::Running;
        self.store
            .save_workflow(&workflow)
            .map_err(WorkflowError::Infrastructure)?;

        let resume_from = self
            .store
            .latest_checkpoint_phase(&workflow.id)
            .map_err(WorkflowError::Infrastructure)?;

        if resume_from.is_some() {
            self.publish(&workflow, BusEventKind::WorkflowResumed).await;
        } else {
            self.publish(
                &workflow,
                BusEventKind::WorkflowStarted {
                    prompt: workflow.prompt.clone(),
                },
            )
            .await;
        }

        // Heartbeat task, cancelled when the runner stops.
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(&workflow.id, &execution_id, heartbeat_stop.clone());

        // Persistence pipeline: a priority subscription that must not lose
        // agent events.
        let pipeline_stop = CancellationToken::new();
        let pipeline = self.spawn_event_pipeline(&workflow.id, pipeline_stop.clone());

        let result = self
            .run_phases(&mut workflow, resume_from, cancel, control)
            .await;

        heartbeat_stop.cancel();
        heartbeat.await.ok();

        // Flush all published agent events before the terminal state lands.
        pipeline_stop.cancel();
        pipeline.await.ok();

        let status = match result {
            Ok(()) => {
                workflow.status = WorkflowStatus::Completed;
                workflow.current_phase = WorkflowPhase::Done;
                workflow.error = None;
                self.store
                    .save_workflow(&workflow)
                    .map_err(WorkflowError::Infrastructure)?;
                self.publish(&workflow, BusEventKind::WorkflowCompleted).await;
                tracing::info!(workflow_id, "Workflow completed");
                WorkflowStatus::Completed
            }
            Err(e) if is_cancellation(&e) => {
                workflow.status = WorkflowStatus::Cancelled;
                workflow.current_phase = WorkflowPhase::Cancelled;
                workflow.error = Some("cancelled".to_string());
                self.store
                    .save_workflow(&workflow)
                    .map_err(WorkflowError::Infrastructure)?;
                self.publish(&workflow, BusEventKind::WorkflowCancelled).await;
                tracing::info!(workflow_id, "Workflow cancelled");
                WorkflowStatus::Cancelled
            }
            Err(e) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.current_phase = WorkflowPhase::Failed;
                workflow.error = Some(e.to_string());
                self.store
                    .save_workflow(&workflow)
                    .map_err(WorkflowError::Infrastructure)?;
                self.publish(
                    &workflow,
                    BusEventKind::WorkflowFailed {
                        error: e.to_string(),
                    },
                )
                .await;
                tracing::error!(workflow_id, error = %e, "Workflow failed");
                return Err(e);
            }
        };
        Ok(status)
    }

    async fn run_phases(
        &self,
        workflow: &mut Workflow,
        resume_from: Option<WorkflowPhase>,
        cancel: &CancellationToken,
        control: mpsc::UnboundedReceiver<ControlSignal>,
    ) -> Result<(), WorkflowError> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.workflow.timeout_secs);
        let mut control = Some(control);
        let mut reporter = RunArtifacts::new(&self.project_dir, &workflow.id)
            .map_err(WorkflowError::Infrastructure)?;
        if resume_from.is_none() {
            if let Err(e) = reporter.write_prompt(&workflow.prompt) {
                tracing::warn!(error = %e, "Failed to write prompt artifact");
            }
        }

        // Artifacts of prior phases, loaded from checkpoints on resume.
        let mut analysis: Option<AnalysisArtifacts> = None;

        for phase in WorkflowPhase::sequence() {
            if let Some(boundary) = resume_from {
                if phase_order(phase) <= phase_order(boundary) {
                    // Already checkpointed; reload what later phases need.
                    // The refined prompt survives on the workflow row itself.
                    if phase == WorkflowPhase::Analyze {
                        analysis = Some(self.load_analysis(&workflow.id)?);
                    }
                    continue;
                }
            }

            workflow.current_phase = phase;
            self.store
                .save_workflow(workflow)
                .map_err(WorkflowError::Infrastructure)?;
            self.publish(workflow, BusEventKind::PhaseStarted { phase }).await;
            self.publish(
                workflow,
                BusEventKind::WorkflowStateUpdated {
                    status: workflow.status,
                    phase,
                },
            )
            .await;

            let phase_budget = Duration::from_secs(self.config.workflow.phase_timeout_secs);
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(WorkflowError::WorkflowTimeout {
                    seconds: self.config.workflow.timeout_secs,
                })?;
            let budget = phase_budget.min(remaining);

            let phase_result = tokio::time::timeout(budget, async {
                match phase {
                    WorkflowPhase::Refine => self.phase_refine(workflow, &mut reporter, cancel).await,
                    WorkflowPhase::Analyze => {
                        let artifacts =
                            self.phase_analyze(workflow, &mut reporter, cancel).await?;
                        analysis = Some(artifacts);
                        Ok(())
                    }
                    WorkflowPhase::Plan => {
                        let consolidated = analysis
                            .as_ref()
                            .map(|a| a.consolidated.clone())
                            .unwrap_or_default();
                        self.phase_plan(workflow, &consolidated, &mut reporter, cancel).await
                    }
                    WorkflowPhase::Execute => {
                        let control = control
                            .take()
                            .expect("execute phase runs at most once per runner invocation");
                        self.phase_execute(workflow, control, &mut reporter, cancel).await
                    }
                    _ => Ok(()),
                }
            })
            .await;

            match phase_result {
                Ok(Ok(())) => {
                    self.publish(workflow, BusEventKind::PhaseCompleted { phase }).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(WorkflowError::PhaseTimeout {
                        phase: phase.as_str().to_string(),
                        seconds: budget.as_secs(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn phase_refine(
        &self,
        workflow: &mut Workflow,
        reporter: &mut RunArtifacts,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let refiner = Refiner::new(self.registry.clone(), self.bus.clone());
        let artifacts = refiner
            .refine(cancel, &workflow.id, &workflow.project_id, &workflow.prompt)
            .await;
        if cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }

        workflow.refined_prompt = artifacts.refined.clone();
        self.store
            .save_workflow(workflow)
            .map_err(WorkflowError::Infrastructure)?;
        self.checkpoint(&workflow.id, WorkflowPhase::Refine, &artifacts)?;
        if let Err(e) = reporter.write_refinement(&artifacts) {
            tracing::warn!(error = %e, "Failed to write refinement artifact");
        }
        Ok(())
    }

    async fn phase_analyze(
        &self,
        workflow: &Workflow,
        reporter: &mut RunArtifacts,
        cancel: &CancellationToken,
    ) -> Result<AnalysisArtifacts, WorkflowError> {
        let analyzer = Analyzer::new(
            self.registry.clone(),
            self.config.analysis.clone(),
            self.bus.clone(),
        )
        .with_store(self.store.clone());

        let artifacts = analyzer
            .analyze(
                cancel,
                &workflow.id,
                &workflow.project_id,
                workflow.effective_prompt(),
            )
            .await?;

        self.checkpoint(&workflow.id, WorkflowPhase::Analyze, &artifacts)?;
        if let Err(e) = reporter.write_analysis(&artifacts) {
            tracing::warn!(error = %e, "Failed to write analysis artifact");
        }
        Ok(artifacts)
    }

    async fn phase_plan(
        &self,
        workflow: &mut Workflow,
        consolidated: &str,
        reporter: &mut RunArtifacts,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let mut planner = Planner::new(self.registry.clone())
            .with_multi_agent(!self.config.analysis.single_agent);
        if let Some(first) = self.registry.names().first() {
            planner = planner.with_default_agent(first.clone());
        }

        let artifacts = planner
            .plan(cancel, &workflow.id, workflow.effective_prompt(), consolidated)
            .await?;

        workflow.workflow_branch = Some(workflow.branch_name());
        self.store
            .save_workflow(workflow)
            .map_err(WorkflowError::Infrastructure)?;

        for planned in &artifacts.tasks {
            let task = Task {
                id: planned.id.clone(),
                workflow_id: workflow.id.clone(),
                name: planned.name.clone(),
                description: planned.description.clone(),
                scope: planned.scope.clone(),
                depends_on: planned.depends_on.clone(),
                agent: planned.agent.clone(),
                model: planned.model.clone(),
                done_criteria: planned.done_criteria.clone(),
                status: TaskStatus::Pending,
                attempt: 0,
                batch_index: Some(planned.batch_index),
                started_at: None,
                completed_at: None,
                tokens_in: 0,
                tokens_out: 0,
                error: None,
            };
            self.store
                .upsert_task(&task)
                .map_err(WorkflowError::Infrastructure)?;
            self.publish(
                workflow,
                BusEventKind::TaskCreated {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                },
            )
            .await;
        }

        self.checkpoint(&workflow.id, WorkflowPhase::Plan, &artifacts)?;
        if let Err(e) = reporter.write_plan(&artifacts) {
            tracing::warn!(error = %e, "Failed to write plan artifact");
        }
        Ok(())
    }

    async fn phase_execute(
        &self,
        workflow: &Workflow,
        control: mpsc::UnboundedReceiver<ControlSignal>,
        reporter: &mut RunArtifacts,
        cancel: &CancellationToken,
    ) -> Result<(), WorkflowError> {
        let executor = Executor::new(
            self.registry.clone(),
            self.store.clone(),
            self.bus.clone(),
            WorktreeManager::new(&self.project_dir),
            self.config.execution.clone(),
            self.config.git.clone(),
        );

        let artifacts = executor.run(cancel, workflow, control).await?;
        if let Err(e) = reporter.write_execution(&artifacts) {
            tracing::warn!(error = %e, "Failed to write execution artifact");
        }

        if artifacts.cancelled {
            return Err(WorkflowError::Cancelled);
        }
        if !artifacts.success() {
            // Execute is not checkpointed complete; a resume re-enters it.
            return Err(WorkflowError::ExecutionFailed {
                failed: artifacts.failed,
            });
        }
        self.checkpoint(&workflow.id, WorkflowPhase::Execute, &artifacts)?;
        Ok(())
    }

    fn checkpoint<T: serde::Serialize>(
        &self,
        workflow_id: &str,
        phase: WorkflowPhase,
        artifacts: &T,
    ) -> Result<(), WorkflowError> {
        let value = serde_json::json!({
            "complete": true,
            "artifacts": serde_json::to_value(artifacts)
                .map_err(|e| WorkflowError::Infrastructure(e.into()))?,
        });
        self.store
            .append_checkpoint(workflow_id, phase, &value)
            .map_err(WorkflowError::Infrastructure)
    }

    fn load_analysis(&self, workflow_id: &str) -> Result<AnalysisArtifacts, WorkflowError> {
        let blob = self
            .store
            .get_checkpoint(workflow_id, WorkflowPhase::Analyze)
            .map_err(WorkflowError::Infrastructure)?
            .ok_or_else(|| {
                WorkflowError::Validation("analyze checkpoint missing on resume".to_string())
            })?;
        serde_json::from_value(blob["artifacts"].clone())
            .map_err(|e| WorkflowError::Infrastructure(e.into()))
    }

    fn spawn_heartbeat(
        &self,
        workflow_id: &str,
        execution_id: &str,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let workflow_id = workflow_id.to_string();
        let execution_id = execution_id.to_string();
        let interval = Duration::from_secs(self.config.workflow.heartbeat_interval_secs.max(1));

        tokio::spawn(async move {
            loop {
                if let Err(e) = store.write_heartbeat(&workflow_id, &execution_id, Utc::now()) {
                    tracing::error!(workflow_id, error = %e, "Heartbeat write failed");
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }

    /// Priority subscription draining `agent_event`s into the store. The
    /// producer blocks rather than dropping, so nothing published is lost;
    /// synthetic-id dedup makes replays idempotent.
    fn spawn_event_pipeline(
        &self,
        workflow_id: &str,
        stop: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let workflow_id = workflow_id.to_string();
        let mut subscription = self.bus.subscribe_priority(EventFilter {
            kinds: Some(vec!["agent_event"]),
            workflow_id: Some(workflow_id.clone()),
        });

        tokio::spawn(async move {
            let mut flush = |events: &mut Vec<crate::model::AgentEvent>| {
                if events.is_empty() {
                    return;
                }
                if let Err(e) = store.append_agent_events(&workflow_id, events) {
                    tracing::error!(workflow_id, error = %e, "Agent event persistence failed");
                }
                events.clear();
            };

            let mut batch = Vec::new();
            loop {
                tokio::select! {
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if let BusEventKind::AgentEvent { event } = event.kind {
                            batch.push(event);
                        }
                        // Drain whatever else is ready before hitting the db.
                        while batch.len() < 50 {
                            match subscription.try_recv() {
                                Some(queued) => {
                                    if let BusEventKind::AgentEvent { event } = queued.kind {
                                        batch.push(event);
                                    }
                                }
                                None => break,
                            }
                        }
                        flush(&mut batch);
                    }
                    _ = stop.cancelled() => {
                        while let Some(queued) = subscription.try_recv() {
                            if let BusEventKind::AgentEvent { event } = queued.kind {
                                batch.push(event);
                            }
                        }
                        flush(&mut batch);
                        break;
                    }
                }
            }
        })
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
}

fn phase_order(phase: WorkflowPhase) -> u8 {
    match phase {
        WorkflowPhase::Refine => 0,
        WorkflowPhase::Analyze => 1,
        WorkflowPhase::Plan => 2,
        WorkflowPhase::Execute => 3,
        _ => 4,
    }
}

fn is_cancellation(error: &WorkflowError) -> bool {
    match error {
        WorkflowError::Cancelled => true,
        WorkflowError::Adapter(e) => e.kind == AdapterErrorKind::Cancelled,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AnalysisConfig, ExecutionConfig, WorkflowConfig, WorktreeMode};
    use crate::execute::ExecutorControl;
    use crate::testing::ScriptedAgent;
    use std::process::Stdio;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "test"]);
        run(&["config", "user.email", "test@test.com"]);
        std::fs::write(dir.path().join("README.md"), "# test\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        dir
    }

    fn single_agent_config() -> QuorumConfig {
        QuorumConfig {
            analysis: AnalysisConfig {
                single_agent: true,
                ..Default::default()
            },
            execution: ExecutionConfig {
                worktree_mode: WorktreeMode::Disabled,
                initial_backoff_ms: 10,
                ..Default::default()
            },
            workflow: WorkflowConfig {
                heartbeat_interval_secs: 1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    const PLAN_JSON: &str = r#"{
        "reasoning": "single task",
        "tasks": [
            {"id": "task-00-impl", "name": "Implement", "description": "Implement the change",
             "files": ["src/", "README.md"], "agent": "fake",
             "done_criteria": "change implemented"}
        ]
    }"#;

    fn scripted_happy_agent() -> Arc<ScriptedAgent> {
        let agent = ScriptedAgent::new("fake");
        agent.push_response("<refined_prompt>Implement JWT middleware</refined_prompt>");
        agent.push_response("## Claims\nanalysis\n## Risks\n## Recommendations");
        agent.push_response(PLAN_JSON);
        // Remaining calls (task execution) use the default response.
        Arc::new(agent)
    }

    fn runner(
        config: QuorumConfig,
        agent: Arc<ScriptedAgent>,
        store: &StateStore,
        bus: &EventBus,
        repo: &TempDir,
    ) -> WorkflowRunner {
        WorkflowRunner::new(
            config,
            AgentRegistry::from_agents(vec![agent]),
            store.clone(),
            bus.clone(),
            repo.path(),
        )
    }

    #[tokio::test]
    async fn single_agent_happy_path_completes_all_phases() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "Add JWT middleware").unwrap();

        let mut phase_events = bus.subscribe(EventFilter::for_kinds(vec!["phase_completed"]));
        let agent = scripted_happy_agent();
        let runner = runner(single_agent_config(), agent.clone(), &store, &bus, &repo);
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let status = runner.run(&wf.id, &cancel, control_rx).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);

        // All four phases completed.
        let mut phases = Vec::new();
        while let Some(event) = phase_events.try_recv() {
            if let BusEventKind::PhaseCompleted { phase } = event.kind {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                WorkflowPhase::Refine,
                WorkflowPhase::Analyze,
                WorkflowPhase::Plan,
                WorkflowPhase::Execute,
            ]
        );

        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Completed);
        assert_eq!(loaded.current_phase, WorkflowPhase::Done);
        assert_eq!(
            loaded.refined_prompt.as_deref(),
            Some("Implement JWT middleware")
        );
        assert!(loaded.last_heartbeat_at.is_some());

        // One consolidated analysis artifact, one task, workflow branch set.
        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Execute)
        );
        let tasks = store.get_tasks(&wf.id).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(loaded.workflow_branch.as_deref(), Some(&*wf.branch_name()));

        // Run artifacts written.
        let runs_dir = QuorumConfig::runs_dir(repo.path(), &wf.id);
        assert!(runs_dir.join("00-prompt.md").exists());
    }

    #[tokio::test]
    async fn resume_replays_from_last_checkpoint_boundary() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "Add JWT middleware").unwrap();

        // Pretend Refine/Analyze/Plan completed in a previous (crashed) run.
        let refine = crate::refine::RefineArtifacts {
            original: wf.prompt.clone(),
            refined: None,
            agent: None,
        };
        let analysis = AnalysisArtifacts {
            consolidated: "prior analysis".into(),
            ..Default::default()
        };
        let plan: crate::plan::PlanArtifacts = serde_json::from_value(serde_json::json!({
            "reasoning": "prior plan",
            "tasks": [{
                "id": "task-00-impl", "name": "Implement", "description": "d",
                "scope": ["src/", "README.md"], "depends_on": [], "agent": "fake",
                "model": null, "done_criteria": "done", "batch_index": 0
            }],
            "proposals": []
        }))
        .unwrap();

        let envelope = |value: serde_json::Value| serde_json::json!({"complete": true, "artifacts": value});
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &envelope(serde_json::to_value(&refine).unwrap()))
            .unwrap();
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Analyze, &envelope(serde_json::to_value(&analysis).unwrap()))
            .unwrap();
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Plan, &envelope(serde_json::to_value(&plan).unwrap()))
            .unwrap();
        let task = Task {
            id: "task-00-impl".into(),
            workflow_id: wf.id.clone(),
            name: "Implement".into(),
            description: "d".into(),
            scope: vec!["src/".into(), "README.md".into()],
            depends_on: vec![],
            agent: "fake".into(),
            model: None,
            done_criteria: "done".into(),
            status: TaskStatus::Pending,
            attempt: 0,
            batch_index: Some(0),
            started_at: None,
            completed_at: None,
            tokens_in: 0,
            tokens_out: 0,
            error: None,
        };
        store.upsert_task(&task).unwrap();

        let agent = Arc::new(ScriptedAgent::new("fake"));
        let runner = runner(single_agent_config(), agent.clone(), &store, &bus, &repo);
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let status = runner.run(&wf.id, &cancel, control_rx).await.unwrap();
        assert_eq!(status, WorkflowStatus::Completed);

        // Refine/Analyze/Plan artifacts were NOT regenerated: the only agent
        // call is the task execution.
        assert_eq!(agent.call_count(), 1);
        assert!(agent.prompts()[0].contains("## Task: Implement"));
    }

    #[tokio::test]
    async fn lock_conflict_is_reported() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "prompt").unwrap();

        // Hold the lock as if another runner owned the workflow.
        let LockOutcome::Acquired(_token) = store
            .acquire_lock(&wf.id, chrono::Duration::hours(1))
            .unwrap()
        else {
            panic!("Expected acquisition");
        };

        let agent = Arc::new(ScriptedAgent::new("fake"));
        let runner = runner(single_agent_config(), agent, &store, &bus, &repo);
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let err = runner.run(&wf.id, &cancel, control_rx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::LockConflict { .. }));
    }

    #[tokio::test]
    async fn failure_is_persisted_before_terminal_event() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "prompt").unwrap();

        // Refine succeeds (falls back), analysis fails hard.
        let agent = ScriptedAgent::new("fake");
        agent.push_response("<refined_prompt>refined</refined_prompt>");
        agent.push_failure(AdapterErrorKind::Parse, "not parseable");
        let agent = Arc::new(agent);

        let mut terminal = bus.subscribe(EventFilter::for_kinds(vec!["workflow_failed"]));
        let runner = runner(single_agent_config(), agent, &store, &bus, &repo);
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let err = runner.run(&wf.id, &cancel, control_rx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Adapter(_)));

        // Terminal event observed, and the persisted row already terminal.
        let event = terminal.recv().await.unwrap();
        assert!(matches!(event.kind, BusEventKind::WorkflowFailed { .. }));
        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Failed);
        assert!(loaded.error.unwrap().contains("not parseable"));

        // The refine checkpoint survived the failure.
        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Refine)
        );
    }

    #[tokio::test]
    async fn cancellation_lands_in_cancelled_state() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "prompt").unwrap();

        let agent = Arc::new(
            ScriptedAgent::new("fake").with_delay(Duration::from_secs(30)),
        );
        let runner = Arc::new(runner(single_agent_config(), agent, &store, &bus, &repo));
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let handle = {
            let runner = Arc::clone(&runner);
            let wf_id = wf.id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { runner.run(&wf_id, &cancel, control_rx).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let status = handle.await.unwrap().unwrap();
        assert_eq!(status, WorkflowStatus::Cancelled);
        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Cancelled);
    }

    #[tokio::test]
    async fn failed_execution_marks_workflow_failed() {
        let repo = init_repo();
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let wf = store.create_workflow("default", "prompt").unwrap();

        let agent = ScriptedAgent::new("fake");
        agent.push_response("<refined_prompt>refined</refined_prompt>");
        agent.push_response("analysis");
        agent.push_response(PLAN_JSON);
        agent.push_failure(AdapterErrorKind::Parse, "task agent exploded");
        let agent = Arc::new(agent);

        let runner = runner(single_agent_config(), agent, &store, &bus, &repo);
        let (_control, control_rx) = ExecutorControl::channel();
        let cancel = CancellationToken::new();

        let err = runner.run(&wf.id, &cancel, control_rx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::ExecutionFailed { failed: 1 }));

        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Failed);
        // Execute never checkpointed: a resume re-enters the Execute phase.
        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Plan)
        );
    }
}
