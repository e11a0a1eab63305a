//! Task planning: convert the consolidated analysis into an executable DAG
//! of self-contained tasks.
//!
//! Two modes: single-agent (one planner produces the full task list) and
//! multi-agent (N agents propose plans, a synthesizer consolidates). Either
//! way the planner validates its own output — unknown dependency ids,
//! duplicate ids and cycles are rejected before anything reaches the
//! executor.

mod dag;

pub use dag::{TaskGraph, TaskIndex};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, AgentRequest};
use crate::config::AgentPhase;
use crate::errors::{PlanError, WorkflowError};
use crate::ids::task_id;
use crate::util::parse_loose_json;

const PLANNER_TEMPLATE: &str = r#"You are a software engineering planner. Decompose the analyzed task into an executable task list.

You MUST respond with valid JSON only (no markdown, no explanation) matching:
{
  "reasoning": "Brief explanation of the decomposition",
  "tasks": [
    {
      "id": "task-00-short-slug",
      "name": "Short task name",
      "description": "Complete, self-contained prompt for the agent. Repeat any analysis context the agent needs verbatim; it cannot see the analysis.",
      "files": ["paths/this/task/may_touch.rs"],
      "depends_on": ["task-00-short-slug"],
      "agent": "claude",
      "model": null,
      "done_criteria": "How the agent knows the task is complete"
    }
  ]
}

Rules:
- Each description must stand alone: inline all context the task needs.
- depends_on lists ids of tasks that must finish first. No cycles.
- files is the complete set of paths the task may modify.
- For simple work, return a single task. Do not over-decompose.
"#;

const PLAN_SYNTHESIS_TEMPLATE: &str = r#"You are consolidating several proposed task plans into one canonical plan.

Merge the proposals below into a single JSON plan using the same schema they
use. Prefer decompositions that more than one proposal agrees on; keep the
best-written descriptions; ensure file scopes do not overlap between tasks
that could run in parallel. Respond with JSON only.
"#;

fn default_agent() -> String {
    String::new()
}

/// A task as emitted by the planner, before ids and batches are finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<DependencyRef>,
    #[serde(default = "default_agent")]
    pub agent: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub done_criteria: Option<String>,
}

/// Planner output may reference dependencies by id or by 0-based index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    Id(String),
    Index(i64),
}

/// Raw shape of a planner response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    #[serde(default)]
    pub reasoning: String,
    pub tasks: Vec<PlannedTask>,
}

/// One finalized task, ready for persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: String,
    pub name: String,
    pub description: String,
    pub scope: Vec<String>,
    pub depends_on: Vec<String>,
    pub agent: String,
    pub model: Option<String>,
    pub done_criteria: String,
    pub batch_index: u32,
}

/// The checkpointed result of the Plan phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanArtifacts {
    pub reasoning: String,
    pub tasks: Vec<PlanTask>,
    /// Proposals kept for traceability in multi-agent mode.
    #[serde(default)]
    pub proposals: Vec<ProposalArtifact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalArtifact {
    pub agent: String,
    pub raw: String,
}

pub struct Planner {
    registry: AgentRegistry,
    /// Multi-agent planning when more than one plan-capable agent exists and
    /// a synthesizer is available.
    multi_agent: bool,
    default_agent: Option<String>,
}

impl Planner {
    pub fn new(registry: AgentRegistry) -> Self {
        Self {
            registry,
            multi_agent: false,
            default_agent: None,
        }
    }

    pub fn with_multi_agent(mut self, multi_agent: bool) -> Self {
        self.multi_agent = multi_agent;
        self
    }

    /// Agent assigned to tasks whose plan did not name one.
    pub fn with_default_agent(mut self, agent: impl Into<String>) -> Self {
        self.default_agent = Some(agent.into());
        self
    }

    /// Produce and validate the plan for a consolidated analysis.
    pub async fn plan(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        prompt: &str,
        analysis: &str,
    ) -> Result<PlanArtifacts, WorkflowError> {
        let planners = self.registry.with_capability(AgentPhase::Plan);
        if planners.is_empty() {
            return Err(WorkflowError::Validation(
                "no agent with plan capability".to_string(),
            ));
        }

        let planning_prompt = format!(
            "{}\n## Task\n{}\n\n## Consolidated Analysis\n{}\n\nRespond with JSON only.",
            PLANNER_TEMPLATE, prompt, analysis
        );

        if self.multi_agent && planners.len() > 1 {
            self.plan_multi(cancel, workflow_id, &planning_prompt).await
        } else {
            let agent = planners[0].name().to_string();
            let request = AgentRequest::prompt(planning_prompt).with_phase(AgentPhase::Plan);
            let response = self
                .registry
                .execute(&agent, cancel, request)
                .await
                .map_err(WorkflowError::Adapter)?;
            let plan = parse_plan(&response.text)?;
            let artifacts = self.finalize(plan, Vec::new())?;
            tracing::info!(workflow_id, tasks = artifacts.tasks.len(), "Plan produced");
            Ok(artifacts)
        }
    }

    /// N proposals, consolidated by the synthesizer into the canonical list.
    async fn plan_multi(
        &self,
        cancel: &CancellationToken,
        workflow_id: &str,
        planning_prompt: &str,
    ) -> Result<PlanArtifacts, WorkflowError> {
        let planners = self.registry.with_capability(AgentPhase::Plan);

        let futures = planners.iter().map(|agent| {
            let registry = self.registry.clone();
            let name = agent.name().to_string();
            let prompt = planning_prompt.to_string();
            let cancel = cancel.clone();
            async move {
                let request = AgentRequest::prompt(prompt).with_phase(AgentPhase::Plan);
                let result = registry.execute(&name, &cancel, request).await;
                (name, result)
            }
        });

        let mut proposals = Vec::new();
        for (agent, result) in join_all(futures).await {
            match result {
                Ok(response) => proposals.push(ProposalArtifact {
                    agent,
                    raw: response.text,
                }),
                Err(e) => {
                    tracing::warn!(workflow_id, agent = agent.as_str(), error = %e, "Plan proposal failed");
                }
            }
        }
        if proposals.is_empty() {
            return Err(WorkflowError::Plan(PlanError::Parse(
                "every plan proposal failed".to_string(),
            )));
        }

        let synthesizer = self
            .registry
            .with_capability(AgentPhase::Synthesize)
            .first()
            .map(|agent| agent.name().to_string());

        let plan = match synthesizer {
            Some(synthesizer) => {
                let mut sections = String::new();
                for proposal in &proposals {
                    sections.push_str(&format!(
                        "\n## Proposal from {}\n{}\n",
                        proposal.agent, proposal.raw
                    ));
                }
                let request = AgentRequest::prompt(format!(
                    "{}{}\nRespond with JSON only.",
                    PLAN_SYNTHESIS_TEMPLATE, sections
                ))
                .with_phase(AgentPhase::Synthesize);
                let response = self
                    .registry
                    .execute(&synthesizer, cancel, request)
                    .await
                    .map_err(WorkflowError::Adapter)?;
                parse_plan(&response.text)?
            }
            // No synthesizer: first parseable proposal wins.
            None => {
                let mut parsed = None;
                for proposal in &proposals {
                    if let Ok(plan) = parse_plan(&proposal.raw) {
                        parsed = Some(plan);
                        break;
                    }
                }
                parsed.ok_or_else(|| {
                    WorkflowError::Plan(PlanError::Parse(
                        "no proposal parsed as a valid plan".to_string(),
                    ))
                })?
            }
        };

        let artifacts = self.finalize(plan, proposals)?;
        tracing::info!(workflow_id, tasks = artifacts.tasks.len(), "Multi-agent plan produced");
        Ok(artifacts)
    }

    /// Resolve ids and dependency references, validate the DAG, assign batch
    /// indices.
    fn finalize(
        &self,
        plan: PlanResponse,
        proposals: Vec<ProposalArtifact>,
    ) -> Result<PlanArtifacts, WorkflowError> {
        if plan.tasks.is_empty() {
            return Err(WorkflowError::Plan(PlanError::EmptyPlan));
        }

        // Assign ids first so index references can resolve to them.
        let ids: Vec<String> = plan
            .tasks
            .iter()
            .enumerate()
            .map(|(i, task)| {
                task.id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| task_id(i, &task.name))
            })
            .collect();

        let mut resolved: Vec<(String, Vec<String>)> = Vec::with_capacity(plan.tasks.len());
        for (i, task) in plan.tasks.iter().enumerate() {
            let mut deps = Vec::new();
            for dep in &task.depends_on {
                let dep_id = match dep {
                    DependencyRef::Id(id) => id.clone(),
                    DependencyRef::Index(index) => {
                        let index = usize::try_from(*index).map_err(|_| {
                            WorkflowError::Plan(PlanError::UnknownDependency {
                                task: ids[i].clone(),
                                dependency: index.to_string(),
                            })
                        })?;
                        ids.get(index)
                            .cloned()
                            .ok_or_else(|| {
                                WorkflowError::Plan(PlanError::UnknownDependency {
                                    task: ids[i].clone(),
                                    dependency: index.to_string(),
                                })
                            })?
                    }
                };
                deps.push(dep_id);
            }
            resolved.push((ids[i].clone(), deps));
        }

        let graph = TaskGraph::build(&resolved).map_err(WorkflowError::Plan)?;
        let batch_indices = graph.batch_indices();

        let tasks = plan
            .tasks
            .into_iter()
            .zip(resolved)
            .map(|(task, (id, depends_on))| {
                let agent = if task.agent.is_empty() {
                    self.default_agent.clone().unwrap_or_default()
                } else {
                    task.agent
                };
                PlanTask {
                    batch_index: batch_indices.get(&id).copied().unwrap_or(0),
                    name: task.name,
                    description: task.description,
                    scope: task.files,
                    depends_on,
                    agent,
                    model: task.model,
                    done_criteria: task
                        .done_criteria
                        .unwrap_or_else(|| "All described changes are implemented".to_string()),
                    id,
                }
            })
            .collect();

        Ok(PlanArtifacts {
            reasoning: plan.reasoning,
            tasks,
            proposals,
        })
    }
}

fn parse_plan(raw: &str) -> Result<PlanResponse, WorkflowError> {
    parse_loose_json::<PlanResponse>(raw)
        .map_err(|e| WorkflowError::Plan(PlanError::Parse(e)))
}
