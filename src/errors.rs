//! Typed error hierarchy for the Quorum orchestrator.
//!
//! Four enums cover the orchestration subsystems:
//! - `AdapterError` — agent subprocess failures, classified for retry policy
//! - `ConsensusError` — analysis-round failures
//! - `PlanError` — task-graph construction failures
//! - `WorkflowError` — everything that reaches the workflow runner

use thiserror::Error;

/// Classification of an agent adapter failure.
///
/// `timeout`, `idle` and transient `invocation` failures are retryable under
/// the executor's retry policy; the rest are terminal for the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterErrorKind {
    /// Wall-clock limit exceeded.
    Timeout,
    /// No stdout byte within the configured idle window.
    Idle,
    /// Subprocess spawn or non-zero exit.
    Invocation,
    /// Output could not be parsed into the expected shape.
    Parse,
    /// Task modified paths outside its declared file scope.
    ScopeViolation,
    /// Cancelled via context propagation.
    Cancelled,
}

impl AdapterErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Idle | Self::Invocation)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Idle => "idle",
            Self::Invocation => "invocation",
            Self::Parse => "parse",
            Self::ScopeViolation => "scope_violation",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A failure from an agent adapter.
#[derive(Debug, Error)]
#[error("Agent '{agent}' failed ({}): {message}", .kind.as_str())]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub agent: String,
    pub message: String,
}

impl AdapterError {
    pub fn new(
        kind: AdapterErrorKind,
        agent: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            agent: agent.into(),
            message: message.into(),
        }
    }

    pub fn timeout(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Timeout, agent, message)
    }

    pub fn idle(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Idle, agent, message)
    }

    pub fn invocation(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Invocation, agent, message)
    }

    pub fn parse(agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Parse, agent, message)
    }

    pub fn cancelled(agent: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Cancelled, agent, "cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors from the iterative consensus protocol.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Round {round} returned {succeeded} successful agents, need at least {required}")]
    InsufficientAgents {
        round: u32,
        succeeded: usize,
        required: usize,
    },

    #[error("Consensus not reached after {rounds} rounds (best score {best_score:.2})")]
    MaxRoundsExhausted { rounds: u32, best_score: f64 },

    #[error("Moderator failed after trying {attempts} agent(s): {last_error}")]
    ModeratorUnavailable { attempts: usize, last_error: String },
}

/// Errors from plan validation and DAG construction.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Cycle detected in task dependencies. Involved tasks: {involved:?}")]
    CyclicDependency { involved: Vec<String> },

    #[error("Task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Planner produced no tasks")]
    EmptyPlan,

    #[error("Failed to parse planner output: {0}")]
    Parse(String),
}

/// Errors that reach the workflow runner.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("Workflow {workflow_id} is locked by pid {holder_pid} on {holder_host}")]
    LockConflict {
        workflow_id: String,
        holder_pid: u32,
        holder_host: String,
    },

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Phase {phase} timed out after {seconds}s")]
    PhaseTimeout { phase: String, seconds: u64 },

    #[error("Workflow timed out after {seconds}s")]
    WorkflowTimeout { seconds: u64 },

    #[error(
        "Zombie workflow detected (last heartbeat {age_seconds}s ago, resume {resumes} of {max_resumes})"
    )]
    ZombieDetected {
        age_seconds: i64,
        resumes: u32,
        max_resumes: u32,
    },

    #[error("{failed} task(s) failed during execution")]
    ExecutionFailed { failed: usize },

    #[error("Kanban circuit breaker is open; reset required before picking new work")]
    CircuitOpen,

    #[error("Workflow was cancelled")]
    Cancelled,

    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl WorkflowError {
    /// Whether the failure is terminal for the task but not for the workflow.
    pub fn is_task_local(&self) -> bool {
        matches!(self, Self::Adapter(e) if !e.is_retryable())
    }
}
