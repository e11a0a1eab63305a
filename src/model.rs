//! Core domain types: workflows, tasks, agent events, kanban columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lifecycle status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// The phase a workflow is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Refine,
    Analyze,
    Plan,
    Execute,
    Done,
    Failed,
    Cancelled,
}

impl WorkflowPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Analyze => "analyze",
            Self::Plan => "plan",
            Self::Execute => "execute",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Working phases in execution order.
    pub fn sequence() -> [WorkflowPhase; 4] {
        [Self::Refine, Self::Analyze, Self::Plan, Self::Execute]
    }

    /// The phase after this one, for working phases only.
    pub fn next(&self) -> Option<WorkflowPhase> {
        match self {
            Self::Refine => Some(Self::Analyze),
            Self::Analyze => Some(Self::Plan),
            Self::Plan => Some(Self::Execute),
            Self::Execute => Some(Self::Done),
            _ => None,
        }
    }
}

impl std::str::FromStr for WorkflowPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refine" => Ok(Self::Refine),
            "analyze" => Ok(Self::Analyze),
            "plan" => Ok(Self::Plan),
            "execute" => Ok(Self::Execute),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow phase: {}", s)),
        }
    }
}

/// A bucket in the cross-workflow kanban queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KanbanColumn {
    Refinement,
    Todo,
    InProgress,
    ToVerify,
    Done,
}

impl KanbanColumn {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refinement => "refinement",
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::ToVerify => "to_verify",
            Self::Done => "done",
        }
    }

    pub fn all() -> [KanbanColumn; 5] {
        [
            Self::Refinement,
            Self::Todo,
            Self::InProgress,
            Self::ToVerify,
            Self::Done,
        ]
    }
}

impl std::str::FromStr for KanbanColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "refinement" => Ok(Self::Refinement),
            "todo" => Ok(Self::Todo),
            "in_progress" => Ok(Self::InProgress),
            "to_verify" => Ok(Self::ToVerify),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid kanban column: {}", s)),
        }
    }
}

/// Root aggregate: one user-submitted unit of orchestrated work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub project_id: String,
    pub prompt: String,
    pub refined_prompt: Option<String>,
    pub status: WorkflowStatus,
    pub current_phase: WorkflowPhase,
    pub kanban_column: KanbanColumn,
    pub kanban_position: i64,
    pub workflow_branch: Option<String>,
    pub execution_id: Option<String>,
    /// Number of runner attempts, including zombie auto-resumes.
    pub resume_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Workflow {
    /// The long-lived branch holding the cumulative work of this workflow.
    pub fn branch_name(&self) -> String {
        format!("quorum/{}", self.id)
    }

    /// The effective prompt for downstream phases.
    pub fn effective_prompt(&self) -> &str {
        self.refined_prompt.as_deref().unwrap_or(&self.prompt)
    }
}

/// Status of a task in the Execute phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    Retrying,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// A dependency in this state no longer blocks dependents.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "retrying" => Ok(Self::Retrying),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// A unit of work emitted by the planner and scheduled by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable slug, unique within the workflow.
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    /// Self-contained prompt: all analysis context inlined.
    pub description: String,
    /// Paths the task may touch.
    pub scope: Vec<String>,
    /// Ids of tasks that must be terminal before this one starts.
    pub depends_on: Vec<String>,
    pub agent: String,
    pub model: Option<String>,
    /// How the agent knows the task is complete.
    pub done_criteria: String,
    pub status: TaskStatus,
    pub attempt: u32,
    /// Scheduling hint from the planner; not a correctness constraint.
    pub batch_index: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub error: Option<String>,
}

/// Kind of a single agent observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentEventKind {
    Started,
    Thinking,
    ToolUse,
    Chunk,
    Progress,
    Completed,
    Error,
}

impl AgentEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Thinking => "thinking",
            Self::ToolUse => "tool_use",
            Self::Chunk => "chunk",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    /// Transient events are persisted but never aggregated into status.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Chunk)
    }
}

/// A timestamped observation from an agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    /// Content-derived id; late-arriving copies merge idempotently.
    pub synthetic_id: String,
    pub kind: AgentEventKind,
    pub agent: String,
    pub workflow_id: String,
    pub execution_id: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(
        kind: AgentEventKind,
        agent: impl Into<String>,
        workflow_id: impl Into<String>,
        execution_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        let agent = agent.into();
        let workflow_id = workflow_id.into();
        let execution_id = execution_id.into();
        let ts = Utc::now();
        let synthetic_id = Self::derive_id(kind, &agent, &workflow_id, &execution_id, &payload, ts);
        Self {
            synthetic_id,
            kind,
            agent,
            workflow_id,
            execution_id,
            payload,
            ts,
        }
    }

    /// SHA-256 over the identifying content, hex-encoded and truncated.
    /// Identical events produced by replay hash to the same id.
    pub fn derive_id(
        kind: AgentEventKind,
        agent: &str,
        workflow_id: &str,
        execution_id: &str,
        payload: &Value,
        ts: DateTime<Utc>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(agent.as_bytes());
        hasher.update(b"|");
        hasher.update(workflow_id.as_bytes());
        hasher.update(b"|");
        hasher.update(execution_id.as_bytes());
        hasher.update(b"|");
        hasher.update(payload.to_string().as_bytes());
        hasher.update(b"|");
        hasher.update(ts.to_rfc3339().as_bytes());
        let digest = hasher.finalize();
        digest.iter().take(16).map(|b| format!("{:02x}", b)).collect()
    }
}
