//! Typed events published on the bus.
//!
//! Every state-significant action in the orchestrator publishes one of these.
//! Events carry the workflow and project they concern plus an ISO-8601 UTC
//! timestamp; the payload shape is specific to the event kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{AgentEvent, KanbanColumn, WorkflowPhase, WorkflowStatus};

/// The kind-specific payload of a bus event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEventKind {
    WorkflowStarted {
        prompt: String,
    },
    WorkflowStateUpdated {
        status: WorkflowStatus,
        phase: WorkflowPhase,
    },
    WorkflowCompleted,
    WorkflowFailed {
        error: String,
    },
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelled,
    PhaseStarted {
        phase: WorkflowPhase,
    },
    PhaseCompleted {
        phase: WorkflowPhase,
    },
    TaskCreated {
        task_id: String,
        name: String,
    },
    TaskStarted {
        task_id: String,
        agent: String,
        attempt: u32,
    },
    TaskProgress {
        task_id: String,
        message: String,
    },
    TaskCompleted {
        task_id: String,
        tokens_in: u64,
        tokens_out: u64,
    },
    TaskFailed {
        task_id: String,
        error: String,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    TaskRetry {
        task_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    AgentEvent {
        event: AgentEvent,
    },
    KanbanWorkflowMoved {
        from: KanbanColumn,
        to: KanbanColumn,
    },
    KanbanExecutionStarted,
    KanbanExecutionCompleted,
    KanbanExecutionFailed {
        error: String,
    },
    KanbanEngineStateChanged {
        enabled: bool,
        circuit_open: bool,
    },
    CircuitBreakerOpened {
        consecutive_failures: u32,
    },
    ConfigLoaded,
    /// Degraded-but-continuing conditions, e.g. refiner fallback.
    Warning {
        message: String,
    },
}

impl BusEventKind {
    /// Stable name of the event kind, matching the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowStateUpdated { .. } => "workflow_state_updated",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowPaused => "workflow_paused",
            Self::WorkflowResumed => "workflow_resumed",
            Self::WorkflowCancelled => "workflow_cancelled",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseCompleted { .. } => "phase_completed",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskStarted { .. } => "task_started",
            Self::TaskProgress { .. } => "task_progress",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskSkipped { .. } => "task_skipped",
            Self::TaskRetry { .. } => "task_retry",
            Self::AgentEvent { .. } => "agent_event",
            Self::KanbanWorkflowMoved { .. } => "kanban_workflow_moved",
            Self::KanbanExecutionStarted => "kanban_execution_started",
            Self::KanbanExecutionCompleted => "kanban_execution_completed",
            Self::KanbanExecutionFailed { .. } => "kanban_execution_failed",
            Self::KanbanEngineStateChanged { .. } => "kanban_engine_state_changed",
            Self::CircuitBreakerOpened { .. } => "circuit_breaker_opened",
            Self::ConfigLoaded => "config_loaded",
            Self::Warning { .. } => "warning",
        }
    }
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// The workflow this event concerns; engine-level events carry none.
    pub workflow_id: Option<String>,
    pub project_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: BusEventKind,
}

impl BusEvent {
    pub fn new(
        workflow_id: impl Into<Option<String>>,
        project_id: impl Into<String>,
        kind: BusEventKind,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            project_id: project_id.into(),
            ts: Utc::now(),
            kind,
        }
    }

    pub fn for_workflow(
        workflow_id: impl Into<String>,
        project_id: impl Into<String>,
        kind: BusEventKind,
    ) -> Self {
        Self::new(Some(workflow_id.into()), project_id, kind)
    }

    pub fn engine(project_id: impl Into<String>, kind: BusEventKind) -> Self {
        Self::new(None, project_id, kind)
    }
}

/// Predicate applied to events before enqueueing for a subscriber.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Restrict to these kind names; None matches everything.
    pub kinds: Option<Vec<&'static str>>,
    /// Restrict to one workflow.
    pub workflow_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_workflow(workflow_id: impl Into<String>) -> Self {
        Self {
            kinds: None,
            workflow_id: Some(workflow_id.into()),
        }
    }

    pub fn for_kinds(kinds: Vec<&'static str>) -> Self {
        Self {
            kinds: Some(kinds),
            workflow_id: None,
        }
    }

    pub fn matches(&self, event: &BusEvent) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind.name()) {
                return false;
            }
        }
        if let Some(ref wf) = self.workflow_id {
            if event.workflow_id.as_deref() != Some(wf.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_snake_case_tag() {
        let event = BusEvent::for_workflow(
            "wf-1",
            "default",
            BusEventKind::PhaseStarted {
                phase: WorkflowPhase::Analyze,
            },
        );
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"phase_started\""));
        assert!(json.contains("\"workflow_id\":\"wf-1\""));
        assert!(json.contains("\"analyze\""));
    }

    #[test]
    fn kind_names_match_serialized_tags() {
        let kinds = vec![
            BusEventKind::WorkflowCompleted,
            BusEventKind::WorkflowFailed { error: "e".into() },
            BusEventKind::CircuitBreakerOpened {
                consecutive_failures: 3,
            },
            BusEventKind::ConfigLoaded,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert!(
                json.contains(&format!("\"type\":\"{}\"", kind.name())),
                "tag mismatch for {}",
                kind.name()
            );
        }
    }

    #[test]
    fn filter_matches_all_by_default() {
        let filter = EventFilter::all();
        let event = BusEvent::engine("default", BusEventKind::ConfigLoaded);
        assert!(filter.matches(&event));
    }

    #[test]
    fn filter_by_workflow() {
        let filter = EventFilter::for_workflow("wf-1");
        let matching = BusEvent::for_workflow("wf-1", "default", BusEventKind::WorkflowCompleted);
        let other = BusEvent::for_workflow("wf-2", "default", BusEventKind::WorkflowCompleted);
        let engine = BusEvent::engine("default", BusEventKind::ConfigLoaded);

        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other));
        assert!(!filter.matches(&engine));
    }

    #[test]
    fn filter_by_kind() {
        let filter = EventFilter::for_kinds(vec!["workflow_completed", "workflow_failed"]);
        let completed = BusEvent::for_workflow("wf-1", "default", BusEventKind::WorkflowCompleted);
        let started = BusEvent::for_workflow(
            "wf-1",
            "default",
            BusEventKind::WorkflowStarted { prompt: "p".into() },
        );
        assert!(filter.matches(&completed));
        assert!(!filter.matches(&started));
    }
}
