//! Kanban board persistence: column placement, engine state, work selection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use std::str::FromStr;

use super::StateStore;
use crate::model::{KanbanColumn, Workflow};

/// Persisted engine state, single row. Survives restarts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineState {
    pub enabled: bool,
    pub circuit_open: bool,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub current_workflow_id: Option<String>,
}

/// One column of a project board, ordered by position.
#[derive(Debug, Clone)]
pub struct BoardColumn {
    pub column: KanbanColumn,
    pub workflows: Vec<Workflow>,
}

/// Full board for one project.
#[derive(Debug, Clone)]
pub struct BoardView {
    pub project_id: String,
    pub columns: Vec<BoardColumn>,
}

impl StateStore {
    // ── Column placement ──────────────────────────────────────────────

    /// Move a workflow to the end of a column, renumbering the source column
    /// so positions stay dense.
    pub fn move_workflow_to_column(&self, workflow_id: &str, column: KanbanColumn) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let (project_id, old_column): (String, String) = tx
            .query_row(
                "SELECT project_id, kanban_column FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Workflow not found for move")?;

        let position: i64 = tx.query_row(
            "SELECT COALESCE(MAX(kanban_position), -1) + 1 FROM workflows
             WHERE project_id = ?1 AND kanban_column = ?2",
            params![project_id, column.as_str()],
            |row| row.get(0),
        )?;

        tx.execute(
            "UPDATE workflows SET kanban_column = ?2, kanban_position = ?3, updated_at = ?4
             WHERE id = ?1",
            params![
                workflow_id,
                column.as_str(),
                position,
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to move workflow")?;

        // Close the gap left in the source column.
        renumber_column(&tx, &project_id, &old_column)?;
        tx.commit()?;
        Ok(())
    }

    /// Ordered board view for a project: all five columns, always present.
    pub fn get_board(&self, project_id: &str) -> Result<BoardView> {
        let workflows = self.list_workflows(project_id)?;
        let columns = KanbanColumn::all()
            .into_iter()
            .map(|column| {
                let mut in_column: Vec<Workflow> = workflows
                    .iter()
                    .filter(|w| w.kanban_column == column)
                    .cloned()
                    .collect();
                in_column.sort_by_key(|w| w.kanban_position);
                BoardColumn {
                    column,
                    workflows: in_column,
                }
            })
            .collect();
        Ok(BoardView {
            project_id: project_id.to_string(),
            columns,
        })
    }

    /// The next workflow to execute: top of Todo across all projects, in
    /// project registration order then position. None while anything is
    /// InProgress (at most one workflow executes system-wide).
    pub fn next_todo_workflow(&self) -> Result<Option<String>> {
        let conn = self.lock();

        let in_progress: i64 = conn.query_row(
            "SELECT COUNT(*) FROM workflows WHERE kanban_column = 'in_progress'",
            [],
            |row| row.get(0),
        )?;
        if in_progress > 0 {
            return Ok(None);
        }

        conn.query_row(
            "SELECT w.id FROM workflows w
             JOIN projects p ON p.id = w.project_id
             WHERE w.kanban_column = 'todo'
             ORDER BY p.registered_at, p.id, w.kanban_position
             LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to select next todo workflow")
    }

    // ── Engine state ──────────────────────────────────────────────────

    pub fn load_engine_state(&self) -> Result<EngineState> {
        let conn = self.lock();
        conn.query_row(
            "SELECT enabled, circuit_open, consecutive_failures, last_failure_at,
                    current_workflow_id
             FROM kanban_engine WHERE id = 1",
            [],
            |row| {
                Ok(EngineState {
                    enabled: row.get::<_, i64>(0)? != 0,
                    circuit_open: row.get::<_, i64>(1)? != 0,
                    consecutive_failures: row.get::<_, i64>(2)? as u32,
                    last_failure_at: row
                        .get::<_, Option<String>>(3)?
                        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                        .map(|t| t.with_timezone(&Utc)),
                    current_workflow_id: row.get(4)?,
                })
            },
        )
        .context("Failed to load kanban engine state")
    }

    pub fn save_engine_state(&self, state: &EngineState) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE kanban_engine SET enabled = ?1, circuit_open = ?2,
                 consecutive_failures = ?3, last_failure_at = ?4, current_workflow_id = ?5
             WHERE id = 1",
            params![
                state.enabled as i64,
                state.circuit_open as i64,
                state.consecutive_failures as i64,
                state.last_failure_at.map(|t| t.to_rfc3339()),
                state.current_workflow_id,
            ],
        )
        .context("Failed to save kanban engine state")?;
        Ok(())
    }
}

fn renumber_column(
    tx: &rusqlite::Transaction<'_>,
    project_id: &str,
    column: &str,
) -> Result<()> {
    // Validates the stored column string while renumbering.
    KanbanColumn::from_str(column)
        .map_err(|e| anyhow::anyhow!(e))
        .context("Corrupt kanban column in store")?;

    let ids: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM workflows WHERE project_id = ?1 AND kanban_column = ?2
             ORDER BY kanban_position",
        )?;
        let rows = stmt.query_map(params![project_id, column], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };
    for (position, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE workflows SET kanban_position = ?2 WHERE id = ?1",
            params![id, position as i64],
        )?;
    }
    Ok(())
}
