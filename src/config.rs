//! Unified configuration for Quorum.
//!
//! Configuration is read from `<project>/.quorum/quorum.toml`, falling back to
//! `~/.config/quorum/quorum.toml`, then to built-in defaults. Validation runs
//! at load time; an invalid configuration is a `Validation` error and is never
//! retried.
//!
//! # Configuration File Format
//!
//! ```toml
//! [agents.claude]
//! command = "claude"
//! model = "sonnet"
//! phases = ["refine", "analyze", "moderate", "synthesize", "plan", "execute"]
//! rate_capacity = 4
//! rate_refill_per_sec = 0.5
//! idle_timeout_secs = 300
//! grace_period_secs = 10
//!
//! [analysis]
//! single_agent = false
//! moderator = "claude"
//! moderator_fallbacks = ["gemini"]
//! synthesizer = "claude"
//! consensus_threshold = 0.8
//! min_rounds = 1
//! max_rounds = 3
//! stagnation_threshold = 0.05
//! min_successful_agents = 2
//!
//! [execution]
//! max_parallel = 4
//! max_retries = 2
//! worktree_mode = "enabled"
//!
//! [git]
//! auto_push = false
//! auto_pr = false
//! auto_merge = false
//!
//! [kanban]
//! enabled = false
//! failure_threshold = 3
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::WorkflowError;

/// Phases an agent may participate in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPhase {
    Refine,
    Analyze,
    Moderate,
    Synthesize,
    Plan,
    Execute,
}

/// Per-agent configuration, one `[agents.<name>]` table each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable to spawn (e.g. "claude", "gemini").
    pub command: String,
    /// Default model passed per invocation.
    #[serde(default)]
    pub model: Option<String>,
    /// Phase participation.
    #[serde(default = "default_agent_phases")]
    pub phases: Vec<AgentPhase>,
    /// Token-bucket capacity (max concurrent invocations).
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,
    /// Token refill rate per second.
    #[serde(default = "default_rate_refill")]
    pub rate_refill_per_sec: f64,
    /// Kill the subprocess when stdout is silent this long.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Wait this long after a completion marker before force-kill.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_agent_phases() -> Vec<AgentPhase> {
    vec![
        AgentPhase::Refine,
        AgentPhase::Analyze,
        AgentPhase::Moderate,
        AgentPhase::Synthesize,
        AgentPhase::Plan,
        AgentPhase::Execute,
    ]
}

fn default_rate_capacity() -> u32 {
    4
}

fn default_rate_refill() -> f64 {
    0.5
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_grace_period() -> u64 {
    10
}

impl AgentConfig {
    pub fn participates_in(&self, phase: AgentPhase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Consensus-analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bypass the consensus loop: one agent, one V1 output.
    #[serde(default)]
    pub single_agent: bool,
    /// Moderator agent name. Must be unset when `single_agent` is true.
    #[serde(default)]
    pub moderator: Option<String>,
    /// Fallback moderators tried in order when the primary fails.
    #[serde(default)]
    pub moderator_fallbacks: Vec<String>,
    /// Synthesizer agent name (defaults to the moderator).
    #[serde(default)]
    pub synthesizer: Option<String>,
    /// Consensus score required to stop iterating.
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_min_rounds")]
    pub min_rounds: u32,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Score improvement below this is stagnation.
    #[serde(default = "default_stagnation_threshold")]
    pub stagnation_threshold: f64,
    /// A round with fewer successful agents is invalid.
    #[serde(default = "default_min_successful_agents")]
    pub min_successful_agents: usize,
}

fn default_consensus_threshold() -> f64 {
    0.8
}

fn default_min_rounds() -> u32 {
    1
}

fn default_max_rounds() -> u32 {
    3
}

fn default_stagnation_threshold() -> f64 {
    0.05
}

fn default_min_successful_agents() -> usize {
    1
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            single_agent: false,
            moderator: None,
            moderator_fallbacks: Vec::new(),
            synthesizer: None,
            consensus_threshold: default_consensus_threshold(),
            min_rounds: default_min_rounds(),
            max_rounds: default_max_rounds(),
            stagnation_threshold: default_stagnation_threshold(),
            min_successful_agents: default_min_successful_agents(),
        }
    }
}

/// Worktree isolation mode for task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorktreeMode {
    /// One worktree per task.
    #[default]
    Enabled,
    /// Shared working directory, no isolation.
    Disabled,
    /// Worktrees only when two or more tasks run concurrently.
    Parallel,
}

/// Executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub worktree_mode: WorktreeMode,
    /// Remove task worktrees after terminal state. Failed-task worktrees are
    /// preserved when false.
    #[serde(default)]
    pub auto_clean: bool,
    /// Watchdog: low-quality output tolerated this long before cancellation.
    #[serde(default = "default_watchdog_grace")]
    pub watchdog_grace_secs: u64,
    /// Watchdog: repetition ratio above this is pathological.
    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: f64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_watchdog_grace() -> u64 {
    120
}

fn default_repetition_threshold() -> f64 {
    0.6
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            worktree_mode: WorktreeMode::default(),
            auto_clean: false,
            watchdog_grace_secs: default_watchdog_grace(),
            repetition_threshold: default_repetition_threshold(),
        }
    }
}

/// PR merge strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl MergeStrategy {
    pub fn as_flag(&self) -> &'static str {
        match self {
            Self::Merge => "--merge",
            Self::Squash => "--squash",
            Self::Rebase => "--rebase",
        }
    }
}

/// Finalization settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default)]
    pub auto_push: bool,
    /// Requires `auto_push`.
    #[serde(default)]
    pub auto_pr: bool,
    /// Requires `auto_pr`. Off by default.
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
    /// PR target; repository default branch when unset.
    #[serde(default)]
    pub pr_base_branch: Option<String>,
}

/// Runner-level timeouts and liveness settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Wall-clock limit for a whole workflow (default 16 h).
    #[serde(default = "default_workflow_timeout")]
    pub timeout_secs: u64,
    /// Per-phase wall-clock limit.
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// A Running workflow with no heartbeat for this long is a zombie.
    #[serde(default = "default_zombie_threshold")]
    pub zombie_threshold_secs: u64,
    #[serde(default = "default_auto_resume")]
    pub auto_resume: bool,
    #[serde(default = "default_max_resumes")]
    pub max_resumes: u32,
    /// Lock TTL (default 1 h).
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_workflow_timeout() -> u64 {
    16 * 3600
}

fn default_phase_timeout() -> u64 {
    4 * 3600
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_zombie_threshold() -> u64 {
    120
}

fn default_auto_resume() -> bool {
    true
}

fn default_max_resumes() -> u32 {
    3
}

fn default_lock_ttl() -> u64 {
    3600
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_workflow_timeout(),
            phase_timeout_secs: default_phase_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            zombie_threshold_secs: default_zombie_threshold(),
            auto_resume: default_auto_resume(),
            max_resumes: default_max_resumes(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

/// Kanban engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_tick_secs() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for KanbanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tick_secs: default_tick_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    /// Preflight aborts below this fraction of free file descriptors.
    #[serde(default = "default_min_free_fd_pct")]
    pub min_free_fd_pct: f64,
    /// Preflight aborts below this many free megabytes.
    #[serde(default = "default_min_free_mem_mb")]
    pub min_free_mem_mb: u64,
    /// Crash dumps retained.
    #[serde(default = "default_max_crash_files")]
    pub max_crash_files: usize,
}

fn default_sample_interval() -> u64 {
    30
}

fn default_min_free_fd_pct() -> f64 {
    0.1
}

fn default_min_free_mem_mb() -> u64 {
    256
}

fn default_max_crash_files() -> usize {
    10
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            min_free_fd_pct: default_min_free_fd_pct(),
            min_free_mem_mb: default_min_free_mem_mb(),
            max_crash_files: default_max_crash_files(),
        }
    }
}

/// The unified Quorum configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Configured agents, keyed by registry name. BTreeMap for stable order.
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub kanban: KanbanConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

impl QuorumConfig {
    /// Load configuration for a project directory.
    ///
    /// Resolution order: `<project>/.quorum/quorum.toml`, then
    /// `~/.config/quorum/quorum.toml`, then defaults. The first file found
    /// wins; layers are not merged.
    pub fn load(project_dir: &Path) -> Result<Self, WorkflowError> {
        let project_file = project_dir.join(".quorum").join("quorum.toml");
        let user_file = dirs::config_dir().map(|d| d.join("quorum").join("quorum.toml"));

        let config = if project_file.exists() {
            Self::from_file(&project_file)?
        } else if let Some(path) = user_file.filter(|p| p.exists()) {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a specific configuration file.
    pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))
            .map_err(WorkflowError::Infrastructure)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| WorkflowError::Validation(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Validate cross-field invariants. Called by `load`; callers constructing
    /// configs programmatically should call it themselves.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.analysis.single_agent && self.analysis.moderator.is_some() {
            return Err(WorkflowError::Validation(
                "analysis.single_agent and analysis.moderator are mutually exclusive".to_string(),
            ));
        }
        if self.analysis.min_rounds < 1 {
            return Err(WorkflowError::Validation(
                "analysis.min_rounds must be at least 1".to_string(),
            ));
        }
        if self.analysis.max_rounds < self.analysis.min_rounds {
            return Err(WorkflowError::Validation(format!(
                "analysis.max_rounds ({}) must be >= analysis.min_rounds ({})",
                self.analysis.max_rounds, self.analysis.min_rounds
            )));
        }
        if !(0.0..=1.0).contains(&self.analysis.consensus_threshold) {
            return Err(WorkflowError::Validation(format!(
                "analysis.consensus_threshold must be in [0,1], got {}",
                self.analysis.consensus_threshold
            )));
        }
        if self.git.auto_pr && !self.git.auto_push {
            return Err(WorkflowError::Validation(
                "git.auto_pr requires git.auto_push".to_string(),
            ));
        }
        if self.git.auto_merge && !self.git.auto_pr {
            return Err(WorkflowError::Validation(
                "git.auto_merge requires git.auto_pr".to_string(),
            ));
        }
        if self.execution.max_parallel == 0 {
            return Err(WorkflowError::Validation(
                "execution.max_parallel must be at least 1".to_string(),
            ));
        }
        for name in self
            .analysis
            .moderator
            .iter()
            .chain(self.analysis.moderator_fallbacks.iter())
            .chain(self.analysis.synthesizer.iter())
        {
            if !self.agents.contains_key(name) {
                return Err(WorkflowError::Validation(format!(
                    "analysis references unknown agent '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Agents participating in the given phase, in stable name order.
    pub fn agents_for_phase(&self, phase: AgentPhase) -> Vec<&str> {
        self.agents
            .iter()
            .filter(|(_, cfg)| cfg.participates_in(phase))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Path helpers rooted at the project's `.quorum` directory.
    pub fn quorum_dir(project_dir: &Path) -> PathBuf {
        project_dir.join(".quorum")
    }

    pub fn db_path(project_dir: &Path) -> PathBuf {
        Self::quorum_dir(project_dir).join("quorum.db")
    }

    pub fn runs_dir(project_dir: &Path, workflow_id: &str) -> PathBuf {
        Self::quorum_dir(project_dir).join("runs").join(workflow_id)
    }

    pub fn issues_dir(project_dir: &Path, workflow_id: &str) -> PathBuf {
        Self::quorum_dir(project_dir).join("issues").join(workflow_id)
    }

    pub fn logs_dir(project_dir: &Path) -> PathBuf {
        Self::quorum_dir(project_dir).join("logs")
    }

    pub fn crash_dir(project_dir: &Path) -> PathBuf {
        Self::quorum_dir(project_dir).join("crash")
    }
}
