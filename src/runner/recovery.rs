//! Zombie recovery: find Running workflows whose heartbeat went silent and
//! either re-queue or fail them.
//!
//! Runs once at startup, before the kanban engine starts ticking. A zombie
//! under the resume budget goes back to the queue with its resume counter
//! bumped; the next pick re-executes it from its last checkpoint boundary. A
//! zombie over budget is marked Failed.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::bus::{BusEvent, BusEventKind, EventBus};
use crate::config::WorkflowConfig;
use crate::model::{KanbanColumn, WorkflowPhase, WorkflowStatus};
use crate::store::StateStore;

/// What the recovery pass did.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    /// Workflows re-queued for automatic resume.
    pub resumed: Vec<String>,
    /// Workflows failed with ZombieDetected.
    pub failed: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.failed.is_empty()
    }
}

/// Scan for zombies and apply the auto-resume policy.
pub async fn recover_zombies(
    store: &StateStore,
    bus: &EventBus,
    config: &WorkflowConfig,
) -> Result<RecoveryReport> {
    let threshold = Duration::seconds(config.zombie_threshold_secs as i64);
    let zombies = store.scan_zombies(threshold)?;
    let mut report = RecoveryReport::default();

    for workflow_id in zombies {
        let Some(mut workflow) = store.get_workflow(&workflow_id)? else {
            continue;
        };
        let age_seconds = workflow
            .last_heartbeat_at
            .map(|ts| (Utc::now() - ts).num_seconds())
            .unwrap_or(i64::MAX);

        if config.auto_resume && workflow.resume_count < config.max_resumes {
            workflow.resume_count += 1;
            workflow.status = WorkflowStatus::Pending;
            store.save_workflow(&workflow)?;
            // Re-queue: back to Todo so the engine's next tick picks it up
            // and re-executes from the last checkpoint boundary.
            let from = workflow.kanban_column;
            store.move_workflow_to_column(&workflow.id, KanbanColumn::Todo)?;
            tracing::warn!(
                workflow_id = %workflow.id,
                age_seconds,
                resume = workflow.resume_count,
                "Zombie workflow re-queued for auto-resume"
            );
            bus.publish(BusEvent::for_workflow(
                workflow.id.clone(),
                workflow.project_id.clone(),
                BusEventKind::KanbanWorkflowMoved {
                    from,
                    to: KanbanColumn::Todo,
                },
            ))
            .await;
            report.resumed.push(workflow.id);
        } else {
            workflow.status = WorkflowStatus::Failed;
            workflow.current_phase = WorkflowPhase::Failed;
            workflow.error = Some(format!(
                "zombie detected: last heartbeat {}s ago, resume budget exhausted ({}/{})",
                age_seconds, workflow.resume_count, config.max_resumes
            ));
            store.save_workflow(&workflow)?;
            tracing::error!(
                workflow_id = %workflow.id,
                age_seconds,
                "Zombie workflow failed, resume budget exhausted"
            );
            bus.publish(BusEvent::for_workflow(
                workflow.id.clone(),
                workflow.project_id.clone(),
                BusEventKind::WorkflowFailed {
                    error: workflow.error.clone().unwrap_or_default(),
                },
            ))
            .await;
            report.failed.push(workflow.id);
        }
    }
    Ok(report)
}
