//! Cross-workflow sequencing with failure containment.
//!
//! Every tick, while enabled and the circuit is closed and nothing is
//! InProgress, the engine picks the workflow at the top of Todo across all
//! projects (project registration order, then position), moves it to
//! InProgress and hands it to the runner. Completion moves it to ToVerify
//! and resets the consecutive-failure counter; failure moves it back to
//! Refinement and increments the counter — at the threshold the circuit
//! breaker opens and the engine disables itself until reset.
//!
//! Only one workflow executes system-wide at a time, even across projects.
//! Engine state is persisted and survives restart.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::KanbanConfig;
use crate::errors::WorkflowError;
use crate::execute::ExecutorControl;
use crate::model::{KanbanColumn, WorkflowStatus};
use crate::runner::WorkflowRunner;
use crate::store::{EngineState, StateStore};

/// Seam between the engine and the runner, so the engine is testable without
/// spawning agents.
#[async_trait]
pub trait WorkflowLauncher: Send + Sync {
    async fn launch(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStatus, WorkflowError>;
}

#[async_trait]
impl WorkflowLauncher for WorkflowRunner {
    async fn launch(
        &self,
        workflow_id: &str,
        cancel: &CancellationToken,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let (_control, control_rx) = ExecutorControl::channel();
        self.run(workflow_id, cancel, control_rx).await
    }
}

/// Control channel payload for engine-level commands arriving mid-loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCommand {
    Enable,
    Disable,
    ResetCircuitBreaker,
}

pub struct KanbanEngine {
    store: StateStore,
    bus: EventBus,
    config: KanbanConfig,
    launcher: Arc<dyn WorkflowLauncher>,
    project_id: String,
}

impl KanbanEngine {
    pub fn new(
        store: StateStore,
        bus: EventBus,
        config: KanbanConfig,
        launcher: Arc<dyn WorkflowLauncher>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            launcher,
            project_id: "default".to_string(),
        }
    }

    /// Tick loop. Runs until cancelled; a disabled engine keeps ticking idly
    /// so re-enabling takes effect without a restart.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        mut commands: mpsc::UnboundedReceiver<EngineCommand>,
    ) -> anyhow::Result<()> {
        let tick = Duration::from_secs(self.config.tick_secs.max(1));
        loop {
            while let Ok(command) = commands.try_recv() {
                self.apply_command(command).await?;
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Err(e) = self.tick(cancel).await {
                tracing::error!(error = %e, "Kanban tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                command = commands.recv() => {
                    if let Some(command) = command {
                        self.apply_command(command).await?;
                    }
                }
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    async fn apply_command(&self, command: EngineCommand) -> anyhow::Result<()> {
        match command {
            EngineCommand::Enable => self.set_enabled(true).await,
            EngineCommand::Disable => self.set_enabled(false).await,
            EngineCommand::ResetCircuitBreaker => self.reset_circuit_breaker().await,
        }
    }

    /// One engine step: pick, execute, sort the outcome. Returns the executed
    /// workflow id, if any.
    pub async fn tick(&self, cancel: &CancellationToken) -> anyhow::Result<Option<String>> {
        let mut state = self.store.load_engine_state()?;
        if !state.enabled || state.circuit_open {
            return Ok(None);
        }

        let Some(workflow_id) = self.store.next_todo_workflow()? else {
            return Ok(None);
        };

        self.store
            .move_workflow_to_column(&workflow_id, KanbanColumn::InProgress)?;
        state.current_workflow_id = Some(workflow_id.clone());
        self.store.save_engine_state(&state)?;
        self.publish_moved(&workflow_id, KanbanColumn::Todo, KanbanColumn::InProgress)
            .await;
        self.publish(&workflow_id, BusEventKind::KanbanExecutionStarted).await;
        tracing::info!(workflow_id, "Kanban engine executing workflow");

        let result = self.launcher.launch(&workflow_id, cancel).await;
        let outcome = result.map_err(|e| e.to_string());

        let mut state = self.store.load_engine_state()?;
        state.current_workflow_id = None;

        match outcome {
            Ok(WorkflowStatus::Completed) => {
                self.store
                    .move_workflow_to_column(&workflow_id, KanbanColumn::ToVerify)?;
                state.consecutive_failures = 0;
                self.store.save_engine_state(&state)?;
                self.publish_moved(&workflow_id, KanbanColumn::InProgress, KanbanColumn::ToVerify)
                    .await;
                self.publish(&workflow_id, BusEventKind::KanbanExecutionCompleted)
                    .await;
            }
            Ok(WorkflowStatus::Cancelled) => {
                // A user cancellation is not an engine failure.
                self.store
                    .move_workflow_to_column(&workflow_id, KanbanColumn::Refinement)?;
                self.store.save_engine_state(&state)?;
                self.publish_moved(
                    &workflow_id,
                    KanbanColumn::InProgress,
                    KanbanColumn::Refinement,
                )
                .await;
            }
            Ok(status) => {
                let error = format!("workflow ended in unexpected status {:?}", status);
                self.fail_pick(&workflow_id, state, error).await?;
            }
            Err(error) => {
                self.fail_pick(&workflow_id, state, error).await?;
            }
        }
        Ok(Some(workflow_id))
    }

    /// Sort a failed pick: back to Refinement, count the failure, open the
    /// circuit at the threshold.
    async fn fail_pick(
        &self,
        workflow_id: &str,
        mut state: EngineState,
        error: String,
    ) -> anyhow::Result<()> {
        self.store
            .move_workflow_to_column(workflow_id, KanbanColumn::Refinement)?;
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());

        let tripped = state.consecutive_failures >= self.config.failure_threshold;
        if tripped {
            state.circuit_open = true;
            state.enabled = false;
        }
        self.store.save_engine_state(&state)?;

        self.publish_moved(workflow_id, KanbanColumn::InProgress, KanbanColumn::Refinement)
            .await;
        self.publish(workflow_id, BusEventKind::KanbanExecutionFailed { error })
            .await;

        if tripped {
            tracing::error!(
                consecutive_failures = state.consecutive_failures,
                "Circuit breaker opened, engine disabled"
            );
            self.publish_engine(BusEventKind::CircuitBreakerOpened {
                consecutive_failures: state.consecutive_failures,
            })
            .await;
            self.publish_engine(BusEventKind::KanbanEngineStateChanged {
                enabled: false,
                circuit_open: true,
            })
            .await;
        }
        Ok(())
    }

    pub async fn set_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        let mut state = self.store.load_engine_state()?;
        if state.enabled == enabled {
            return Ok(());
        }
        state.enabled = enabled;
        self.store.save_engine_state(&state)?;
        self.publish_engine(BusEventKind::KanbanEngineStateChanged {
            enabled,
            circuit_open: state.circuit_open,
        })
        .await;
        Ok(())
    }

    /// Close the circuit, zero the failure counter and re-enable picking.
    pub async fn reset_circuit_breaker(&self) -> anyhow::Result<()> {
        let mut state = self.store.load_engine_state()?;
        state.circuit_open = false;
        state.consecutive_failures = 0;
        state.enabled = true;
        self.store.save_engine_state(&state)?;
        tracing::info!("Circuit breaker reset, engine enabled");
        self.publish_engine(BusEventKind::KanbanEngineStateChanged {
            enabled: true,
            circuit_open: false,
        })
        .await;
        Ok(())
    }

    /// Manual column move. Users may move workflows at any time; the engine
    /// only considers Todo at selection time.
    pub async fn move_workflow(
        &self,
        workflow_id: &str,
        to: KanbanColumn,
    ) -> anyhow::Result<()> {
        let from = self
            .store
            .get_workflow(workflow_id)?
            .map(|wf| wf.kanban_column)
            .ok_or_else(|| anyhow::anyhow!("workflow {} not found", workflow_id))?;
        self.store.move_workflow_to_column(workflow_id, to)?;
        self.publish_moved(workflow_id, from, to).await;
        Ok(())
    }

    pub fn state(&self) -> anyhow::Result<EngineState> {
        self.store.load_engine_state()
    }

    async fn publish_moved(&self, workflow_id: &str, from: KanbanColumn, to: KanbanColumn) {
        self.publish(
            workflow_id,
            BusEventKind::KanbanWorkflowMoved { from, to },
        )
        .await;
    }

    async fn publish(&self, workflow_id: &str, kind: BusEventKind) {
        let project_id = self
            .store
            .get_workflow(workflow_id)
            .ok()
            .flatten()
            .map(|wf| wf.project_id)
            .unwrap_or_else(|| self.project_id.clone());
        self.bus
            .publish(BusEvent::for_workflow(workflow_id.to_string(), project_id, kind))
            .await;
    }

    async fn publish_engine(&self, kind: BusEventKind) {
        self.bus
            .publish(BusEvent::engine(self.project_id.clone(), kind))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventFilter;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Launcher returning scripted outcomes in order.
    struct FakeLauncher {
        outcomes: Mutex<VecDeque<Result<WorkflowStatus, WorkflowError>>>,
        launched: Mutex<Vec<String>>,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self {
                outcomes: Mutex::new(VecDeque::new()),
                launched: Mutex::new(Vec::new()),
            }
        }

        fn push(&self, outcome: Result<WorkflowStatus, WorkflowError>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn launched(&self) -> Vec<String> {
            self.launched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkflowLauncher for FakeLauncher {
        async fn launch(
            &self,
            workflow_id: &str,
            _cancel: &CancellationToken,
        ) -> Result<WorkflowStatus, WorkflowError> {
            self.launched.lock().unwrap().push(workflow_id.to_string());
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(WorkflowStatus::Completed))
        }
    }

    fn setup(threshold: u32) -> (StateStore, EventBus, Arc<FakeLauncher>, KanbanEngine) {
        let store = StateStore::open_in_memory().unwrap();
        let bus = EventBus::new();
        let launcher = Arc::new(FakeLauncher::new());
        let engine = KanbanEngine::new(
            store.clone(),
            bus.clone(),
            KanbanConfig {
                enabled: true,
                tick_secs: 1,
                failure_threshold: threshold,
            },
            launcher.clone(),
        );
        // Persisted engine state starts disabled; turn it on for tests.
        let mut state = store.load_engine_state().unwrap();
        state.enabled = true;
        store.save_engine_state(&state).unwrap();
        (store, bus, launcher, engine)
    }

    #[tokio::test]
    async fn tick_executes_top_of_todo_and_moves_to_verify() {
        let (store, _bus, launcher, engine) = setup(3);
        let wf = store.create_workflow("default", "a").unwrap();
        store.move_workflow_to_column(&wf.id, KanbanColumn::Todo).unwrap();

        let cancel = CancellationToken::new();
        let executed = engine.tick(&cancel).await.unwrap();
        assert_eq!(executed, Some(wf.id.clone()));
        assert_eq!(launcher.launched(), vec![wf.id.clone()]);

        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::ToVerify);
        let state = store.load_engine_state().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.current_workflow_id.is_none());
    }

    #[tokio::test]
    async fn tick_ignores_workflows_outside_todo() {
        let (store, _bus, launcher, engine) = setup(3);
        let wf = store.create_workflow("default", "a").unwrap();
        // Still in Refinement: not picked.
        let _ = wf;

        let cancel = CancellationToken::new();
        assert!(engine.tick(&cancel).await.unwrap().is_none());
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn disabled_engine_does_not_pick() {
        let (store, _bus, launcher, engine) = setup(3);
        let wf = store.create_workflow("default", "a").unwrap();
        store.move_workflow_to_column(&wf.id, KanbanColumn::Todo).unwrap();
        engine.set_enabled(false).await.unwrap();

        let cancel = CancellationToken::new();
        assert!(engine.tick(&cancel).await.unwrap().is_none());
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn failure_moves_to_refinement_and_counts() {
        let (store, _bus, launcher, engine) = setup(3);
        let wf = store.create_workflow("default", "a").unwrap();
        store.move_workflow_to_column(&wf.id, KanbanColumn::Todo).unwrap();
        launcher.push(Err(WorkflowError::ExecutionFailed { failed: 2 }));

        let cancel = CancellationToken::new();
        engine.tick(&cancel).await.unwrap();

        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::Refinement);
        let state = store.load_engine_state().unwrap();
        assert_eq!(state.consecutive_failures, 1);
        assert!(!state.circuit_open);
        assert!(state.last_failure_at.is_some());
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_failures() {
        let (store, bus, launcher, engine) = setup(3);
        let mut ids = Vec::new();
        for prompt in ["a", "b", "c", "d"] {
            let wf = store.create_workflow("default", prompt).unwrap();
            store.move_workflow_to_column(&wf.id, KanbanColumn::Todo).unwrap();
            ids.push(wf.id);
        }
        for _ in 0..3 {
            launcher.push(Err(WorkflowError::ExecutionFailed { failed: 1 }));
        }

        let mut breaker_events =
            bus.subscribe(EventFilter::for_kinds(vec!["circuit_breaker_opened"]));
        let cancel = CancellationToken::new();

        for _ in 0..3 {
            engine.tick(&cancel).await.unwrap();
        }

        let state = store.load_engine_state().unwrap();
        assert!(state.circuit_open);
        assert!(!state.enabled);
        assert_eq!(state.consecutive_failures, 3);

        let event = breaker_events.recv().await.unwrap();
        assert!(matches!(
            event.kind,
            BusEventKind::CircuitBreakerOpened {
                consecutive_failures: 3
            }
        ));

        // Each failed workflow resides in Refinement; the fourth stays put.
        for id in &ids[..3] {
            let wf = store.get_workflow(id).unwrap().unwrap();
            assert_eq!(wf.kanban_column, KanbanColumn::Refinement);
        }
        assert!(engine.tick(&cancel).await.unwrap().is_none());
        assert_eq!(launcher.launched().len(), 3);
    }

    #[tokio::test]
    async fn reset_closes_circuit_and_resumes_picking() {
        let (store, _bus, launcher, engine) = setup(1);
        let a = store.create_workflow("default", "a").unwrap();
        let b = store.create_workflow("default", "b").unwrap();
        store.move_workflow_to_column(&a.id, KanbanColumn::Todo).unwrap();
        store.move_workflow_to_column(&b.id, KanbanColumn::Todo).unwrap();
        launcher.push(Err(WorkflowError::ExecutionFailed { failed: 1 }));

        let cancel = CancellationToken::new();
        engine.tick(&cancel).await.unwrap();
        assert!(store.load_engine_state().unwrap().circuit_open);
        assert!(engine.tick(&cancel).await.unwrap().is_none());

        engine.reset_circuit_breaker().await.unwrap();
        let state = store.load_engine_state().unwrap();
        assert!(!state.circuit_open);
        assert!(state.enabled);
        assert_eq!(state.consecutive_failures, 0);

        // Picking resumes with the next workflow in Todo.
        let executed = engine.tick(&cancel).await.unwrap();
        assert_eq!(executed, Some(b.id));
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (store, _bus, launcher, engine) = setup(3);
        let a = store.create_workflow("default", "a").unwrap();
        let b = store.create_workflow("default", "b").unwrap();
        store.move_workflow_to_column(&a.id, KanbanColumn::Todo).unwrap();
        store.move_workflow_to_column(&b.id, KanbanColumn::Todo).unwrap();
        launcher.push(Err(WorkflowError::ExecutionFailed { failed: 1 }));
        launcher.push(Ok(WorkflowStatus::Completed));

        let cancel = CancellationToken::new();
        engine.tick(&cancel).await.unwrap();
        assert_eq!(store.load_engine_state().unwrap().consecutive_failures, 1);

        engine.tick(&cancel).await.unwrap();
        assert_eq!(store.load_engine_state().unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn cancellation_does_not_count_toward_breaker() {
        let (store, _bus, launcher, engine) = setup(1);
        let wf = store.create_workflow("default", "a").unwrap();
        store.move_workflow_to_column(&wf.id, KanbanColumn::Todo).unwrap();
        launcher.push(Ok(WorkflowStatus::Cancelled));

        let cancel = CancellationToken::new();
        engine.tick(&cancel).await.unwrap();

        let state = store.load_engine_state().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.circuit_open);
        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.kanban_column, KanbanColumn::Refinement);
    }

    #[tokio::test]
    async fn manual_move_publishes_event() {
        let (store, bus, _launcher, engine) = setup(3);
        let wf = store.create_workflow("default", "a").unwrap();
        let mut moves = bus.subscribe(EventFilter::for_kinds(vec!["kanban_workflow_moved"]));

        engine.move_workflow(&wf.id, KanbanColumn::Todo).await.unwrap();

        let event = moves.recv().await.unwrap();
        match event.kind {
            BusEventKind::KanbanWorkflowMoved { from, to } => {
                assert_eq!(from, KanbanColumn::Refinement);
                assert_eq!(to, KanbanColumn::Todo);
            }
            other => panic!("Expected KanbanWorkflowMoved, got {:?}", other),
        }
    }
}
