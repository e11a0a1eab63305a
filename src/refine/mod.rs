//! Prompt refinement: rewrite the user prompt for downstream clarity without
//! expanding its scope.
//!
//! Refinement is strictly best-effort. Any failure — no capable agent, a
//! subprocess error, a response missing the marker tags — falls back to the
//! original prompt and publishes a warning event. The original prompt is
//! never overwritten.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, AgentRequest};
use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::AgentPhase;

const REFINE_TEMPLATE: &str = r#"You are a prompt refiner for a multi-agent coding workflow.

Rewrite the user's request so that downstream analysis agents receive a clear,
unambiguous task description. STRICT RULES:
1. Preserve the original scope exactly. Do not add features, constraints, or
   technologies the user did not ask for.
2. Do not remove anything the user asked for.
3. Keep concrete identifiers (file names, endpoints, versions) verbatim.
4. Output ONLY the rewritten request between the markers below, nothing else.

<refined_prompt>
...rewritten request...
</refined_prompt>

USER REQUEST:
"#;

/// Outcome of the refine phase, checkpointed as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineArtifacts {
    pub original: String,
    /// None when refinement fell back to the original.
    pub refined: Option<String>,
    /// The agent that produced the rewrite.
    pub agent: Option<String>,
}

impl RefineArtifacts {
    pub fn effective_prompt(&self) -> &str {
        self.refined.as_deref().unwrap_or(&self.original)
    }
}

pub struct Refiner {
    registry: AgentRegistry,
    bus: EventBus,
}

impl Refiner {
    pub fn new(registry: AgentRegistry, bus: EventBus) -> Self {
        Self { registry, bus }
    }

    /// Refine the prompt, falling back to the original on any failure.
    pub async fn refine(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        project_id: &str,
        prompt: &str,
    ) -> RefineArtifacts {
        let candidates = self.registry.with_capability(AgentPhase::Refine);
        let Some(agent) = candidates.first() else {
            self.warn(workflow_id, project_id, "no agent with refine capability")
                .await;
            return RefineArtifacts {
                original: prompt.to_string(),
                refined: None,
                agent: None,
            };
        };

        let request = AgentRequest::prompt(format!("{}{}", REFINE_TEMPLATE, prompt))
            .with_phase(AgentPhase::Refine);

        match self.registry.execute(agent.name(), cancel, request).await {
            Ok(response) => match extract_refined(&response.text) {
                Some(refined) if !refined.trim().is_empty() => {
                    tracing::info!(workflow_id, agent = agent.name(), "Prompt refined");
                    RefineArtifacts {
                        original: prompt.to_string(),
                        refined: Some(refined),
                        agent: Some(agent.name().to_string()),
                    }
                }
                _ => {
                    self.warn(
                        workflow_id,
                        project_id,
                        "refiner response missing refined_prompt markers",
                    )
                    .await;
                    RefineArtifacts {
                        original: prompt.to_string(),
                        refined: None,
                        agent: Some(agent.name().to_string()),
                    }
                }
            },
            Err(e) => {
                self.warn(workflow_id, project_id, &format!("refiner failed: {}", e))
                    .await;
                RefineArtifacts {
                    original: prompt.to_string(),
                    refined: None,
                    agent: Some(agent.name().to_string()),
                }
            }
        }
    }

    async fn warn(&self, workflow_id: &str, project_id: &str, message: &str) {
        tracing::warn!(workflow_id, message, "Refinement fell back to original prompt");
        self.bus
            .publish(BusEvent::for_workflow(
                workflow_id,
                project_id,
                BusEventKind::Warning {
                    message: format!("refine: {}", message),
                },
            ))
            .await;
    }
}

/// Extract the text between the refined_prompt markers.
fn extract_refined(text: &str) -> Option<String> {
    let start = text.find("<refined_prompt>")? + "<refined_prompt>".len();
    let end = text[start..].find("</refined_prompt>")? + start;
    Some(text[start..end].trim().to_string())
}
