//! Semantic consensus moderation.
//!
//! The moderator is an agent invoked to score agreement across the current
//! round's outputs and enumerate weighted divergences. Scoring is LLM-based
//! and therefore only statistically deterministic; the raw moderator output
//! is recorded verbatim so a rerun with a cached response is bit-for-bit
//! reproducible.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::AgentOutput;
use crate::agents::{AgentRegistry, AgentRequest};
use crate::config::{AgentPhase, AnalysisConfig};
use crate::errors::ConsensusError;
use crate::util::parse_loose_json;

/// Impact weight of one divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    High,
    Medium,
    Low,
}

/// One point of disagreement between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Divergence {
    pub description: String,
    pub impact: Impact,
}

/// Per-category consensus breakdown.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CategoryScores {
    #[serde(default)]
    pub claims: f64,
    #[serde(default)]
    pub risks: f64,
    #[serde(default)]
    pub recommendations: f64,
}

/// A successful moderation of one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Moderation {
    pub agent: String,
    /// Overall consensus score, clamped to [0, 1].
    pub score: f64,
    pub categories: CategoryScores,
    pub divergences: Vec<Divergence>,
    /// Verbatim moderator output.
    pub raw: String,
}

/// Record of one moderator invocation, successful or not. Every attempt is
/// kept for traceability; only the successful one sets the round result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorAttempt {
    pub round: u32,
    pub agent: String,
    pub success: bool,
    /// Raw output on success, error text on failure.
    pub detail: String,
}

/// Shape of the JSON the moderator is asked to return.
#[derive(Debug, Deserialize)]
struct ModeratorResponse {
    consensus_score: f64,
    #[serde(default)]
    categories: CategoryScores,
    #[serde(default)]
    divergences: Vec<Divergence>,
}

const MODERATOR_TEMPLATE: &str = r#"You are a consensus moderator for a multi-agent analysis round.

Compare the agent analyses below and produce a consensus assessment. You MUST
respond with valid JSON only (no markdown, no explanation) matching:
{
  "consensus_score": 0.0,
  "categories": { "claims": 0.0, "risks": 0.0, "recommendations": 0.0 },
  "divergences": [
    { "description": "What the agents disagree about", "impact": "high" | "medium" | "low" }
  ]
}

Scores are in [0,1]; 1.0 means full agreement. List every material
disagreement as a divergence with its impact on the final plan.
"#;

pub struct Moderator {
    registry: AgentRegistry,
    config: AnalysisConfig,
}

impl Moderator {
    pub fn new(registry: AgentRegistry, config: AnalysisConfig) -> Self {
        Self { registry, config }
    }

    /// Agents to try, in order: configured moderator, then fallbacks.
    fn chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        if let Some(ref primary) = self.config.moderator {
            chain.push(primary.clone());
        }
        for fallback in &self.config.moderator_fallbacks {
            if !chain.contains(fallback) {
                chain.push(fallback.clone());
            }
        }
        if chain.is_empty() {
            // No explicit configuration: any agent with moderate capability.
            chain = self
                .registry
                .with_capability(AgentPhase::Moderate)
                .iter()
                .map(|agent| agent.name().to_string())
                .collect();
        }
        chain
    }

    /// Score one round. Tries the fallback chain in order, recording every
    /// attempt into `attempts`.
    pub async fn moderate(
        &self,
        cancel: &CancellationToken,
        round: u32,
        prompt: &str,
        outputs: &[AgentOutput],
        attempts: &mut Vec<ModeratorAttempt>,
    ) -> Result<Moderation, ConsensusError> {
        let chain = self.chain();
        if chain.is_empty() {
            return Err(ConsensusError::ModeratorUnavailable {
                attempts: 0,
                last_error: "no moderator configured and no agent with moderate capability".into(),
            });
        }

        let moderation_prompt = build_moderation_prompt(prompt, outputs);
        let mut last_error = String::new();

        for agent_name in &chain {
            let request = AgentRequest::prompt(moderation_prompt.clone())
                .with_phase(AgentPhase::Moderate);
            match self.registry.execute(agent_name, cancel, request).await {
                Ok(response) => match parse_moderation(agent_name, &response.text) {
                    Ok(moderation) => {
                        attempts.push(ModeratorAttempt {
                            round,
                            agent: agent_name.clone(),
                            success: true,
                            detail: response.text.clone(),
                        });
                        return Ok(moderation);
                    }
                    Err(parse_error) => {
                        tracing::warn!(
                            agent = agent_name.as_str(),
                            round,
                            "Moderator output unparseable, trying next"
                        );
                        last_error = parse_error.clone();
                        attempts.push(ModeratorAttempt {
                            round,
                            agent: agent_name.clone(),
                            success: false,
                            detail: parse_error,
                        });
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        agent = agent_name.as_str(),
                        round,
                        error = %e,
                        "Moderator invocation failed, trying next"
                    );
                    last_error = e.to_string();
                    attempts.push(ModeratorAttempt {
                        round,
                        agent: agent_name.clone(),
                        success: false,
                        detail: e.to_string(),
                    });
                }
            }
        }

        Err(ConsensusError::ModeratorUnavailable {
            attempts: chain.len(),
            last_error,
        })
    }
}

fn build_moderation_prompt(prompt: &str, outputs: &[AgentOutput]) -> String {
    let mut sections = String::new();
    for output in outputs {
        sections.push_str(&format!(
            "\n## Analysis from {}\n{}\n",
            output.agent, output.text
        ));
    }
    format!(
        "{}\n## Original Task\n{}\n{}\nRespond with JSON only.",
        MODERATOR_TEMPLATE, prompt, sections
    )
}

fn parse_moderation(agent: &str, raw: &str) -> Result<Moderation, String> {
    let response: ModeratorResponse = parse_loose_json(raw)
        .map_err(|e| format!("moderator JSON parse failed: {}", e))?;
    Ok(Moderation {
        agent: agent.to_string(),
        score: response.consensus_score.clamp(0.0, 1.0),
        categories: response.categories,
        divergences: response.divergences,
        raw: raw.to_string(),
    })
}

/// What the consensus loop should do after a scored round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Threshold met at or past min_rounds.
    Proceed,
    /// max_rounds exhausted; proceed flagged as forced consolidation.
    ProceedForced,
    /// Score stopped improving; proceed with the current state.
    ProceedStagnated,
    /// Run another refinement round.
    Continue,
}

impl Decision {
    pub fn proceeds(&self) -> bool {
        !matches!(self, Self::Continue)
    }
}

/// The round decision rule.
///
/// Stagnation is only consulted once `round >= min_rounds`; before that the
/// loop always continues toward the configured minimum.
pub fn decide(config: &AnalysisConfig, round: u32, score: f64, previous: Option<f64>) -> Decision {
    if score >= config.consensus_threshold && round >= config.min_rounds {
        return Decision::Proceed;
    }
    if round >= config.max_rounds {
        return Decision::ProceedForced;
    }
    if round >= config.min_rounds {
        if let Some(previous_score) = previous {
            if score - previous_score < config.stagnation_threshold {
                return Decision::ProceedStagnated;
            }
        }
    }
    Decision::Continue
}
