//! The agent contract and the registry exposing configured agents behind it.
//!
//! Agents are opaque: the orchestrator only sees `Agent`. The registry is a
//! factory keyed by agent name, built from configuration; rate limiting is
//! applied here so every call site gets it for free.

pub mod cli;
pub mod rate_limit;
pub mod stream;

pub use cli::CliAgent;
pub use rate_limit::RateLimiters;
pub use stream::Observation;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentPhase, QuorumConfig};
use crate::errors::AdapterError;

/// What an agent can do. Derived from its configured phase participation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentCapabilities {
    pub refine: bool,
    pub analyze: bool,
    pub moderate: bool,
    pub synthesize: bool,
    pub plan: bool,
    pub execute: bool,
    pub streaming: bool,
}

impl AgentCapabilities {
    pub fn from_phases(phases: &[AgentPhase]) -> Self {
        Self {
            refine: phases.contains(&AgentPhase::Refine),
            analyze: phases.contains(&AgentPhase::Analyze),
            moderate: phases.contains(&AgentPhase::Moderate),
            synthesize: phases.contains(&AgentPhase::Synthesize),
            plan: phases.contains(&AgentPhase::Plan),
            execute: phases.contains(&AgentPhase::Execute),
            streaming: true,
        }
    }

    pub fn supports(&self, phase: AgentPhase) -> bool {
        match phase {
            AgentPhase::Refine => self.refine,
            AgentPhase::Analyze => self.analyze,
            AgentPhase::Moderate => self.moderate,
            AgentPhase::Synthesize => self.synthesize,
            AgentPhase::Plan => self.plan,
            AgentPhase::Execute => self.execute,
        }
    }
}

/// Requested output format for an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    StreamJson,
    Text,
}

/// One agent invocation.
#[derive(Clone, Default)]
pub struct AgentRequest {
    pub prompt: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub attachments: Vec<PathBuf>,
    pub output_format: OutputFormat,
    pub workdir: Option<PathBuf>,
    pub phase: Option<AgentPhase>,
    /// Live observation stream; None when the caller only wants the result.
    pub events: Option<mpsc::UnboundedSender<Observation>>,
}

impl AgentRequest {
    pub fn prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_phase(mut self, phase: AgentPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_events(mut self, tx: mpsc::UnboundedSender<Observation>) -> Self {
        self.events = Some(tx);
        self
    }
}

/// Result of an agent invocation.
#[derive(Debug, Clone, Default)]
pub struct AgentResponse {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration: Duration,
    /// Every raw stream-json frame, in order, for verbatim replay.
    pub raw_frames: Vec<Value>,
}

/// The closed capability set every agent implements.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    /// Cheap liveness probe.
    async fn ping(&self, cancel: &CancellationToken) -> Result<(), AdapterError>;

    /// Run one invocation to completion.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: AgentRequest,
    ) -> Result<AgentResponse, AdapterError>;
}

/// Factory registry keyed by agent name.
#[derive(Clone)]
pub struct AgentRegistry {
    agents: BTreeMap<String, Arc<dyn Agent>>,
    limiters: RateLimiters,
}

impl AgentRegistry {
    /// Build CLI agents for every configured backend.
    pub fn from_config(config: &QuorumConfig) -> Self {
        let limiters = RateLimiters::new();
        let mut agents: BTreeMap<String, Arc<dyn Agent>> = BTreeMap::new();
        for (name, agent_config) in &config.agents {
            limiters.register(name, agent_config.rate_capacity, agent_config.rate_refill_per_sec);
            agents.insert(
                name.clone(),
                Arc::new(CliAgent::new(name.clone(), agent_config.clone())) as Arc<dyn Agent>,
            );
        }
        Self { agents, limiters }
    }

    /// Registry over pre-built agents (tests, vendor adapters).
    pub fn from_agents(agents: Vec<Arc<dyn Agent>>) -> Self {
        let limiters = RateLimiters::new();
        let agents = agents
            .into_iter()
            .map(|agent| (agent.name().to_string(), agent))
            .collect();
        Self { agents, limiters }
    }

    /// Register an additional agent, replacing any with the same name.
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Agents capable of the given phase, in stable name order.
    pub fn with_capability(&self, phase: AgentPhase) -> Vec<Arc<dyn Agent>> {
        self.agents
            .values()
            .filter(|agent| agent.capabilities().supports(phase))
            .cloned()
            .collect()
    }

    pub fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    /// Execute through the rate limiter. Blocks on the agent's token bucket
    /// before the subprocess launches; cancellable throughout.
    pub async fn execute(
        &self,
        name: &str,
        cancel: &CancellationToken,
        request: AgentRequest,
    ) -> Result<AgentResponse, AdapterError> {
        let agent = self.get(name).ok_or_else(|| {
            AdapterError::invocation(name, format!("agent '{}' is not registered", name))
        })?;
        self.limiters.acquire(name, cancel).await?;
        agent.execute(cancel, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAgent;

    #[test]
    fn capabilities_from_phases() {
        let caps = AgentCapabilities::from_phases(&[AgentPhase::Analyze, AgentPhase::Execute]);
        assert!(caps.analyze);
        assert!(caps.execute);
        assert!(!caps.refine);
        assert!(caps.supports(AgentPhase::Analyze));
        assert!(!caps.supports(AgentPhase::Plan));
    }

    #[tokio::test]
    async fn registry_lookup_and_capability_filter() {
        let claude = Arc::new(
            ScriptedAgent::new("claude").with_phases(vec![AgentPhase::Analyze, AgentPhase::Execute]),
        );
        let gemini = Arc::new(ScriptedAgent::new("gemini").with_phases(vec![AgentPhase::Analyze]));
        let registry = AgentRegistry::from_agents(vec![claude, gemini]);

        assert!(registry.get("claude").is_some());
        assert!(registry.get("missing").is_none());

        let analysts = registry.with_capability(AgentPhase::Analyze);
        assert_eq!(analysts.len(), 2);
        let executors = registry.with_capability(AgentPhase::Execute);
        assert_eq!(executors.len(), 1);
        assert_eq!(executors[0].name(), "claude");
    }

    #[tokio::test]
    async fn execute_unknown_agent_is_invocation_error() {
        let registry = AgentRegistry::from_agents(vec![]);
        let cancel = CancellationToken::new();
        let err = registry
            .execute("ghost", &cancel, AgentRequest::prompt("hi"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Invocation);
    }

    #[tokio::test]
    async fn execute_routes_through_scripted_agent() {
        let agent = Arc::new(ScriptedAgent::new("claude").with_response("canned output"));
        let registry = AgentRegistry::from_agents(vec![agent]);
        let cancel = CancellationToken::new();

        let response = registry
            .execute("claude", &cancel, AgentRequest::prompt("hello"))
            .await
            .unwrap();
        assert_eq!(response.text, "canned output");
    }
}
