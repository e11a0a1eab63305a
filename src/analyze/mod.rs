//! Iterative multi-agent analysis with semantic consensus.
//!
//! Every agent with `analyze` capability produces a V1 analysis in parallel;
//! the moderator scores agreement and enumerates divergences; agents then
//! revise their analyses against their peers' outputs until the consensus
//! threshold is met, the rounds budget is exhausted (forced consolidation),
//! or the score stops improving. A synthesizer consolidates all rounds into
//! the single analysis artifact the planner consumes.
//!
//! Every V-round artifact is persisted before the next round starts, so a
//! crashed workflow resumes without repeating completed rounds.

mod moderator;

pub use moderator::{
    CategoryScores, Decision, Divergence, Impact, Moderation, Moderator, ModeratorAttempt, decide,
};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, AgentRequest};
use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::{AgentPhase, AnalysisConfig};
use crate::errors::{ConsensusError, WorkflowError};
use crate::store::StateStore;

const ANALYZE_TEMPLATE: &str = r#"You are one of several independent analysts examining a coding task.

Produce a thorough analysis of the task below, structured as:
## Claims
What is true about the codebase and the task.
## Risks
What could go wrong, edge cases, compatibility concerns.
## Recommendations
Concrete implementation approach, files to touch, order of work.

Be specific and self-contained. Other analysts are working independently; do
not hedge toward consensus.

## Task
"#;

const REVISE_TEMPLATE: &str = r#"You are revising your analysis of a coding task after seeing your peers' work.

Address the divergences the moderator identified. Keep what you are confident
about, adopt peer points that are better than yours, and say explicitly where
you still disagree and why. Produce the same Claims / Risks / Recommendations
structure.
"#;

const SYNTHESIZE_TEMPLATE: &str = r#"You are consolidating multiple rounds of multi-agent analysis into one final artifact.

Merge the analyses below into a single coherent analysis with the structure:
## Claims
## Risks
## Recommendations

Resolve disagreements explicitly, preferring positions supported by more than
one agent or by concrete evidence. The output must be self-contained: a
planner will read it without access to the originals.
"#;

/// One agent's output for one V-round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent: String,
    pub round: u32,
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// All artifacts of one V-round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundArtifact {
    pub round: u32,
    pub outputs: Vec<AgentOutput>,
    pub moderation: Option<Moderation>,
}

/// The checkpointed result of the Analyze phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisArtifacts {
    pub single_agent: bool,
    pub rounds: Vec<RoundArtifact>,
    pub moderator_attempts: Vec<ModeratorAttempt>,
    pub consolidated: String,
    /// Set when max_rounds was exhausted below the threshold.
    pub forced_consolidation: bool,
    /// Set when the loop stopped on score stagnation.
    pub stagnated: bool,
}

pub struct Analyzer {
    registry: AgentRegistry,
    config: AnalysisConfig,
    bus: EventBus,
    /// When present, intermediate round artifacts are checkpointed here.
    store: Option<StateStore>,
}

impl Analyzer {
    pub fn new(registry: AgentRegistry, config: AnalysisConfig, bus: EventBus) -> Self {
        Self {
            registry,
            config,
            bus,
            store: None,
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Run the full analysis protocol for a prompt.
    pub async fn analyze(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        project_id: &str,
        prompt: &str,
    ) -> Result<AnalysisArtifacts, WorkflowError> {
        if self.config.single_agent {
            return self.analyze_single(cancel, workflow_id, prompt).await;
        }

        let moderator = Moderator::new(self.registry.clone(), self.config.clone());
        let mut artifacts = AnalysisArtifacts::default();
        let mut previous_score: Option<f64> = None;
        let mut best_score: f64 = 0.0;
        let mut round: u32 = 0;

        loop {
            round += 1;

            let outputs = self
                .run_round(cancel, workflow_id, prompt, round, &artifacts)
                .await?;

            artifacts.rounds.push(RoundArtifact {
                round,
                outputs,
                moderation: None,
            });
            self.persist(workflow_id, &artifacts)?;

            let round_outputs = artifacts
                .rounds
                .last()
                .map(|r| r.outputs.clone())
                .unwrap_or_default();
            let moderation = moderator
                .moderate(
                    cancel,
                    round,
                    prompt,
                    &round_outputs,
                    &mut artifacts.moderator_attempts,
                )
                .await
                .map_err(WorkflowError::Consensus)?;

            let score = moderation.score;
            best_score = best_score.max(score);
            tracing::info!(
                workflow_id,
                round,
                score,
                divergences = moderation.divergences.len(),
                "Consensus round scored"
            );

            if let Some(last) = artifacts.rounds.last_mut() {
                last.moderation = Some(moderation);
            }
            self.persist(workflow_id, &artifacts)?;

            match decide(&self.config, round, score, previous_score) {
                Decision::Proceed => break,
                Decision::ProceedForced => {
                    tracing::warn!(workflow_id, round, best_score, "Forced consolidation");
                    artifacts.forced_consolidation = true;
                    break;
                }
                Decision::ProceedStagnated => {
                    tracing::info!(workflow_id, round, "Consensus stagnated, proceeding");
                    artifacts.stagnated = true;
                    break;
                }
                Decision::Continue => {
                    previous_score = Some(score);
                }
            }
        }

        artifacts.consolidated = self
            .synthesize(cancel, workflow_id, project_id, prompt, &artifacts)
            .await;
        self.persist(workflow_id, &artifacts)?;
        Ok(artifacts)
    }

    /// Single-agent bypass: one agent, one output, used directly as the
    /// consolidated analysis. Mutually exclusive with moderation, enforced at
    /// config load.
    async fn analyze_single(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        prompt: &str,
    ) -> Result<AnalysisArtifacts, WorkflowError> {
        let analysts = self.registry.with_capability(AgentPhase::Analyze);
        let agent = analysts.first().ok_or_else(|| {
            WorkflowError::Validation("no agent with analyze capability".to_string())
        })?;

        let request = AgentRequest::prompt(format!("{}{}", ANALYZE_TEMPLATE, prompt))
            .with_phase(AgentPhase::Analyze);
        let response = self
            .registry
            .execute(agent.name(), cancel, request)
            .await
            .map_err(WorkflowError::Adapter)?;

        tracing::info!(workflow_id, agent = agent.name(), "Single-agent analysis complete");
        let output = AgentOutput {
            agent: agent.name().to_string(),
            round: 1,
            text: response.text.clone(),
            tokens_in: response.tokens_in,
            tokens_out: response.tokens_out,
        };
        let artifacts = AnalysisArtifacts {
            single_agent: true,
            rounds: vec![RoundArtifact {
                round: 1,
                outputs: vec![output],
                moderation: None,
            }],
            consolidated: response.text,
            ..Default::default()
        };
        self.persist(workflow_id, &artifacts)?;
        Ok(artifacts)
    }

    /// Fan out one round across all analyze-capable agents. A round with
    /// fewer than `min_successful_agents` successes is retried once, then the
    /// workflow fails.
    async fn run_round(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        prompt: &str,
        round: u32,
        artifacts: &AnalysisArtifacts,
    ) -> Result<Vec<AgentOutput>, WorkflowError> {
        let analysts = self.registry.with_capability(AgentPhase::Analyze);
        if analysts.is_empty() {
            return Err(WorkflowError::Validation(
                "no agent with analyze capability".to_string(),
            ));
        }

        for attempt in 0..2 {
            let futures = analysts.iter().map(|agent| {
                let registry = self.registry.clone();
                let name = agent.name().to_string();
                let prompt = self.round_prompt(prompt, round, &name, artifacts);
                let cancel = cancel.clone();
                async move {
                    let request = AgentRequest::prompt(prompt).with_phase(AgentPhase::Analyze);
                    let result = registry.execute(&name, &cancel, request).await;
                    (name, result)
                }
            });

            let mut outputs = Vec::new();
            let mut failures = 0usize;
            for (name, result) in join_all(futures).await {
                match result {
                    Ok(response) => outputs.push(AgentOutput {
                        agent: name,
                        round,
                        text: response.text,
                        tokens_in: response.tokens_in,
                        tokens_out: response.tokens_out,
                    }),
                    Err(e) => {
                        if e.kind == crate::errors::AdapterErrorKind::Cancelled {
                            return Err(WorkflowError::Cancelled);
                        }
                        tracing::warn!(workflow_id, agent = name.as_str(), round, error = %e, "Analyst failed");
                        failures += 1;
                    }
                }
            }

            if outputs.len() >= self.config.min_successful_agents {
                return Ok(outputs);
            }

            if attempt == 0 {
                tracing::warn!(
                    workflow_id,
                    round,
                    succeeded = outputs.len(),
                    failures,
                    required = self.config.min_successful_agents,
                    "Round below minimum successful agents, retrying once"
                );
            } else {
                return Err(WorkflowError::Consensus(ConsensusError::InsufficientAgents {
                    round,
                    succeeded: outputs.len(),
                    required: self.config.min_successful_agents,
                }));
            }
        }
        unreachable!("round retry loop returns within two attempts")
    }

    /// Build the per-agent prompt for a round. Round 1 is the plain analysis
    /// template; later rounds carry the agent's own prior output, all peers'
    /// outputs and the moderator's divergence list.
    fn round_prompt(
        &self,
        prompt: &str,
        round: u32,
        agent: &str,
        artifacts: &AnalysisArtifacts,
    ) -> String {
        if round == 1 {
            return format!("{}{}", ANALYZE_TEMPLATE, prompt);
        }

        let previous = artifacts
            .rounds
            .last()
            .expect("revision rounds follow a completed round");

        let own = previous
            .outputs
            .iter()
            .find(|output| output.agent == agent)
            .map(|output| output.text.as_str())
            .unwrap_or("(you produced no output last round)");

        let mut peers = String::new();
        for output in &previous.outputs {
            if output.agent != agent {
                peers.push_str(&format!("\n## Peer analysis ({})\n{}\n", output.agent, output.text));
            }
        }

        let mut divergences = String::new();
        if let Some(ref moderation) = previous.moderation {
            for divergence in &moderation.divergences {
                divergences.push_str(&format!(
                    "- [{}] {}\n",
                    match divergence.impact {
                        Impact::High => "high",
                        Impact::Medium => "medium",
                        Impact::Low => "low",
                    },
                    divergence.description
                ));
            }
        }

        format!(
            "{}\n## Task\n{}\n\n## Your previous analysis\n{}\n{}\n## Moderator divergences\n{}",
            REVISE_TEMPLATE, prompt, own, peers, divergences
        )
    }

    /// Consolidate all rounds. Falls back to concatenating the final round's
    /// outputs when the synthesizer fails, with a warning event.
    async fn synthesize(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        project_id: &str,
        prompt: &str,
        artifacts: &AnalysisArtifacts,
    ) -> String {
        let synthesizer = self
            .config
            .synthesizer
            .clone()
            .or_else(|| self.config.moderator.clone())
            .or_else(|| {
                self.registry
                    .with_capability(AgentPhase::Synthesize)
                    .first()
                    .map(|agent| agent.name().to_string())
            });

        let fallback = || {
            artifacts
                .rounds
                .last()
                .map(|round| {
                    round
                        .outputs
                        .iter()
                        .map(|output| format!("## {}\n{}", output.agent, output.text))
                        .collect::<Vec<_>>()
                        .join("\n\n")
                })
                .unwrap_or_default()
        };

        let Some(synthesizer) = synthesizer else {
            return fallback();
        };

        let mut sections = String::new();
        for round in &artifacts.rounds {
            for output in &round.outputs {
                sections.push_str(&format!(
                    "\n## Round {} — {}\n{}\n",
                    round.round, output.agent, output.text
                ));
            }
        }
        let request = AgentRequest::prompt(format!(
            "{}\n## Task\n{}\n{}",
            SYNTHESIZE_TEMPLATE, prompt, sections
        ))
        .with_phase(AgentPhase::Synthesize);

        match self.registry.execute(&synthesizer, cancel, request).await {
            Ok(response) => response.text,
            Err(e) => {
                tracing::warn!(workflow_id, error = %e, "Synthesizer failed, concatenating outputs");
                self.bus
                    .publish(BusEvent::for_workflow(
                        workflow_id,
                        project_id,
                        BusEventKind::Warning {
                            message: format!("synthesizer failed: {}", e),
                        },
                    ))
                    .await;
                fallback()
            }
        }
    }

    /// Persist intermediate artifacts with `complete: false`; the runner
    /// writes the completing checkpoint at the phase boundary.
    fn persist(&self, workflow_id: &str, artifacts: &AnalysisArtifacts) -> Result<(), WorkflowError> {
        if let Some(ref store) = self.store {
            let value = serde_json::json!({
                "complete": false,
                "artifacts": serde_json::to_value(artifacts)
                    .map_err(|e| WorkflowError::Infrastructure(e.into()))?,
            });
            store
                .append_checkpoint(workflow_id, crate::model::WorkflowPhase::Analyze, &value)
                .map_err(WorkflowError::Infrastructure)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAgent;
    use std::sync::Arc;

    fn multi_config() -> AnalysisConfig {
        AnalysisConfig {
            moderator: Some("mod".into()),
            synthesizer: Some("mod".into()),
            consensus_threshold: 0.8,
            min_rounds: 1,
            max_rounds: 3,
            stagnation_threshold: 0.05,
            min_successful_agents: 2,
            ..Default::default()
        }
    }

    fn moderator_scoring(scores: &[f64]) -> ScriptedAgent {
        let agent = ScriptedAgent::new("mod").with_phases(vec![
            AgentPhase::Moderate,
            AgentPhase::Synthesize,
        ]);
        for score in scores {
            agent.push_response(format!(r#"{{"consensus_score": {}}}"#, score));
        }
        // Whatever comes after the scores is the synthesis call.
        agent.push_response("consolidated analysis");
        agent
    }

    fn analyst(name: &str) -> ScriptedAgent {
        ScriptedAgent::new(name)
            .with_phases(vec![AgentPhase::Analyze])
            .with_response(format!("analysis from {}", name))
    }

    #[tokio::test]
    async fn consensus_reached_in_two_rounds() {
        let config = AnalysisConfig {
            min_rounds: 2,
            ..multi_config()
        };
        let a = Arc::new(analyst("a"));
        let b = Arc::new(analyst("b"));
        let moderator = Arc::new(moderator_scoring(&[0.60, 0.85]));
        let registry = AgentRegistry::from_agents(vec![a.clone(), b.clone(), moderator]);
        let analyzer = Analyzer::new(registry, config, EventBus::new());
        let cancel = CancellationToken::new();

        let artifacts = analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap();

        // Two rounds, each with two outputs and a moderation.
        assert_eq!(artifacts.rounds.len(), 2);
        assert_eq!(artifacts.rounds[0].outputs.len(), 2);
        assert_eq!(artifacts.rounds[1].outputs.len(), 2);
        assert!(artifacts.rounds[0].moderation.is_some());
        assert!(artifacts.rounds[1].moderation.is_some());
        assert!(!artifacts.forced_consolidation);
        assert_eq!(artifacts.consolidated, "consolidated analysis");
        // Two moderator artifacts, both successful.
        assert_eq!(artifacts.moderator_attempts.len(), 2);
        assert!(artifacts.moderator_attempts.iter().all(|a| a.success));
        // Each analyst ran twice.
        assert_eq!(a.call_count(), 2);
        assert_eq!(b.call_count(), 2);
    }

    #[tokio::test]
    async fn max_rounds_exhaustion_forces_consolidation() {
        let a = Arc::new(analyst("a"));
        let b = Arc::new(analyst("b"));
        // Scores keep improving a little, never reaching 0.8.
        let moderator = Arc::new(moderator_scoring(&[0.50, 0.56, 0.62]));
        let registry = AgentRegistry::from_agents(vec![a, b, moderator]);
        let analyzer = Analyzer::new(registry, multi_config(), EventBus::new());
        let cancel = CancellationToken::new();

        let artifacts = analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap();

        assert_eq!(artifacts.rounds.len(), 3);
        assert!(artifacts.forced_consolidation);
        assert!(!artifacts.consolidated.is_empty());
    }

    #[tokio::test]
    async fn stagnation_stops_the_loop() {
        let a = Arc::new(analyst("a"));
        let b = Arc::new(analyst("b"));
        // 0.50 then 0.51: improvement below the 0.05 stagnation threshold.
        let moderator = Arc::new(moderator_scoring(&[0.50, 0.51]));
        let registry = AgentRegistry::from_agents(vec![a, b, moderator]);
        let config = AnalysisConfig {
            max_rounds: 5,
            ..multi_config()
        };
        let analyzer = Analyzer::new(registry, config, EventBus::new());
        let cancel = CancellationToken::new();

        let artifacts = analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap();
        assert_eq!(artifacts.rounds.len(), 2);
        assert!(artifacts.stagnated);
        assert!(!artifacts.forced_consolidation);
    }

    #[tokio::test]
    async fn insufficient_agents_fails_after_retry() {
        let a = Arc::new(analyst("a"));
        // b fails all four calls (two per round attempt).
        let b = ScriptedAgent::new("b").with_phases(vec![AgentPhase::Analyze]);
        for _ in 0..4 {
            b.push_failure(crate::errors::AdapterErrorKind::Invocation, "down");
        }
        let b = Arc::new(b);
        let moderator = Arc::new(moderator_scoring(&[0.9]));
        let registry = AgentRegistry::from_agents(vec![a, b.clone(), moderator]);
        let analyzer = Analyzer::new(registry, multi_config(), EventBus::new());
        let cancel = CancellationToken::new();

        let err = analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap_err();
        match err {
            WorkflowError::Consensus(ConsensusError::InsufficientAgents {
                succeeded,
                required,
                ..
            }) => {
                assert_eq!(succeeded, 1);
                assert_eq!(required, 2);
            }
            other => panic!("Expected InsufficientAgents, got {:?}", other),
        }
        // The failing agent was invoked twice: original round + one retry.
        assert_eq!(b.call_count(), 2);
    }

    #[tokio::test]
    async fn single_agent_mode_bypasses_consensus() {
        let a = Arc::new(analyst("a").with_response("solo analysis"));
        let registry = AgentRegistry::from_agents(vec![a.clone()]);
        let config = AnalysisConfig {
            single_agent: true,
            ..Default::default()
        };
        let analyzer = Analyzer::new(registry, config, EventBus::new());
        let cancel = CancellationToken::new();

        let artifacts = analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap();
        assert!(artifacts.single_agent);
        assert_eq!(artifacts.rounds.len(), 1);
        assert_eq!(artifacts.consolidated, "solo analysis");
        assert!(artifacts.moderator_attempts.is_empty());
        assert_eq!(a.call_count(), 1);
    }

    #[tokio::test]
    async fn revision_prompt_carries_peers_and_divergences() {
        let config = AnalysisConfig {
            min_rounds: 2,
            ..multi_config()
        };
        let a = Arc::new(analyst("a"));
        let b = Arc::new(analyst("b"));
        let moderator = ScriptedAgent::new("mod").with_phases(vec![
            AgentPhase::Moderate,
            AgentPhase::Synthesize,
        ]);
        moderator.push_response(
            r#"{"consensus_score": 0.5, "divergences": [{"description": "storage layer choice", "impact": "high"}]}"#,
        );
        moderator.push_response(r#"{"consensus_score": 0.9}"#);
        moderator.push_response("final");
        let registry = AgentRegistry::from_agents(vec![a.clone(), b, Arc::new(moderator)]);
        let analyzer = Analyzer::new(registry, config, EventBus::new());
        let cancel = CancellationToken::new();

        analyzer.analyze(&cancel, "wf-1", "default", "task").await.unwrap();

        let second_prompt = &a.prompts()[1];
        assert!(second_prompt.contains("Your previous analysis"));
        assert!(second_prompt.contains("analysis from a"));
        assert!(second_prompt.contains("Peer analysis (b)"));
        assert!(second_prompt.contains("storage layer choice"));
    }

    #[tokio::test]
    async fn rounds_are_persisted_before_loop_continues() {
        let store = StateStore::open_in_memory().unwrap();
        let wf = store.create_workflow("default", "task").unwrap();

        let a = Arc::new(analyst("a"));
        let b = Arc::new(analyst("b"));
        let moderator = Arc::new(moderator_scoring(&[0.9]));
        let registry = AgentRegistry::from_agents(vec![a, b, moderator]);
        let analyzer = Analyzer::new(registry, multi_config(), EventBus::new())
            .with_store(store.clone());
        let cancel = CancellationToken::new();

        analyzer.analyze(&cancel, &wf.id, "default", "task").await.unwrap();

        let checkpoint = store
            .get_checkpoint(&wf.id, crate::model::WorkflowPhase::Analyze)
            .unwrap()
            .unwrap();
        // Intermediate persists are not a resume boundary.
        assert_eq!(checkpoint["complete"], false);
        let artifacts: AnalysisArtifacts =
            serde_json::from_value(checkpoint["artifacts"].clone()).unwrap();
        assert_eq!(artifacts.rounds.len(), 1);
        assert!(!artifacts.consolidated.is_empty());
    }
}
