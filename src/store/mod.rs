//! Durable, crash-safe persistence for workflows, tasks, checkpoints,
//! agent events, locks, heartbeats and kanban engine state.
//!
//! Backed by SQLite through rusqlite. A single connection serves both reads
//! and writes behind a mutex; every multi-statement mutation runs inside a
//! transaction, so no write is ever partially visible. Schema changes are a
//! numbered, forward-only migration list applied in order at open — a failing
//! migration leaves the database at the last successful version.

mod locks;
mod kanban;

pub use kanban::{BoardColumn, BoardView, EngineState};
pub use locks::{LockOutcome, LockToken};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::model::{
    AgentEvent, KanbanColumn, Task, TaskStatus, Workflow, WorkflowPhase, WorkflowStatus,
};

/// Ordered, forward-only schema migrations. Never reorder or edit an entry;
/// append a new version instead.
const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "
        CREATE TABLE projects (
            id TEXT PRIMARY KEY,
            registered_at TEXT NOT NULL
        );

        CREATE TABLE workflows (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            prompt TEXT NOT NULL,
            refined_prompt TEXT,
            status TEXT NOT NULL DEFAULT 'pending',
            current_phase TEXT NOT NULL DEFAULT 'refine',
            kanban_column TEXT NOT NULL DEFAULT 'refinement',
            kanban_position INTEGER NOT NULL DEFAULT 0,
            workflow_branch TEXT,
            execution_id TEXT,
            resume_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            last_heartbeat_at TEXT,
            error TEXT,
            agent_events_blob TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE tasks (
            id TEXT NOT NULL,
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            description TEXT NOT NULL,
            scope_json TEXT NOT NULL DEFAULT '[]',
            deps_json TEXT NOT NULL DEFAULT '[]',
            agent TEXT NOT NULL,
            model TEXT,
            done_criteria TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            attempt INTEGER NOT NULL DEFAULT 0,
            batch_index INTEGER,
            started_at TEXT,
            completed_at TEXT,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            PRIMARY KEY (workflow_id, id)
        );

        CREATE TABLE checkpoints (
            workflow_id TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
            phase TEXT NOT NULL,
            artifacts_blob TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (workflow_id, phase)
        );

        CREATE TABLE locks (
            workflow_id TEXT PRIMARY KEY,
            holder_pid INTEGER NOT NULL,
            holder_host TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            ttl_seconds INTEGER NOT NULL
        );

        CREATE TABLE heartbeats (
            workflow_id TEXT PRIMARY KEY REFERENCES workflows(id) ON DELETE CASCADE,
            execution_id TEXT NOT NULL,
            ts TEXT NOT NULL
        );

        CREATE TABLE kanban_engine (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            enabled INTEGER NOT NULL DEFAULT 0,
            circuit_open INTEGER NOT NULL DEFAULT 0,
            consecutive_failures INTEGER NOT NULL DEFAULT 0,
            last_failure_at TEXT,
            current_workflow_id TEXT
        );
        INSERT INTO kanban_engine (id) VALUES (1);

        CREATE INDEX idx_workflows_column ON workflows(project_id, kanban_column, kanban_position);
        CREATE INDEX idx_workflows_status ON workflows(status);
        CREATE INDEX idx_tasks_workflow ON tasks(workflow_id);
        ",
    ),
];

/// Shared handle to the state database. Cheap to clone.
#[derive(Clone)]
pub struct StateStore {
    conn: Arc<Mutex<Connection>>,
}

impl StateStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        Self::init(conn)
    }

    /// In-memory database, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("Failed to enable foreign keys")?;
        // Returns the new mode as a row, so pragma_update rather than batch.
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.run_migrations().context("Failed to run migrations")?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.lock();
        let current: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("Failed to read schema version")?;

        for (version, sql) in MIGRATIONS {
            if *version <= current {
                continue;
            }
            conn.execute_batch(&format!(
                "BEGIN; {} PRAGMA user_version = {}; COMMIT;",
                sql, version
            ))
            .with_context(|| format!("Migration {} failed", version))?;
            tracing::info!(version, "Applied schema migration");
        }
        Ok(())
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.lock();
        conn.query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("Failed to read schema version")
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        // A poisoned mutex means a writer panicked mid-operation; the
        // transaction it held has rolled back, so the data is consistent.
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ── Workflow CRUD ─────────────────────────────────────────────────

    /// Allocate a workflow id, persist the initial row (status Pending,
    /// column Refinement, position last) and return it.
    pub fn create_workflow(&self, project_id: &str, prompt: &str) -> Result<Workflow> {
        let id = crate::ids::workflow_id();
        let now = Utc::now();
        let conn = self.lock();

        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO projects (id, registered_at) VALUES (?1, ?2)",
            params![project_id, now.to_rfc3339()],
        )
        .context("Failed to register project")?;

        let position: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(kanban_position), -1) + 1 FROM workflows
                 WHERE project_id = ?1 AND kanban_column = 'refinement'",
                params![project_id],
                |row| row.get(0),
            )
            .context("Failed to compute kanban position")?;

        tx.execute(
            "INSERT INTO workflows (id, project_id, prompt, status, current_phase,
                 kanban_column, kanban_position, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 'refine', 'refinement', ?4, ?5, ?5)",
            params![id, project_id, prompt, position, now.to_rfc3339()],
        )
        .context("Failed to insert workflow")?;
        tx.commit()?;
        drop(conn);

        self.get_workflow(&id)?
            .context("Workflow not found after insert")
    }

    pub fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS),
            params![id],
            map_workflow_row,
        )
        .optional()
        .context("Failed to query workflow")
    }

    /// Full upsert of every mutable column, in one statement.
    ///
    /// `last_heartbeat_at` is deliberately excluded: the heartbeat task owns
    /// that column, and writing a stale in-memory copy here would race it.
    pub fn save_workflow(&self, wf: &Workflow) -> Result<()> {
        let conn = self.lock();
        let updated = conn
            .execute(
                "UPDATE workflows SET
                     refined_prompt = ?2, status = ?3, current_phase = ?4,
                     kanban_column = ?5, kanban_position = ?6, workflow_branch = ?7,
                     execution_id = ?8, resume_count = ?9, updated_at = ?10, error = ?11
                 WHERE id = ?1",
                params![
                    wf.id,
                    wf.refined_prompt,
                    wf.status.as_str(),
                    wf.current_phase.as_str(),
                    wf.kanban_column.as_str(),
                    wf.kanban_position,
                    wf.workflow_branch,
                    wf.execution_id,
                    wf.resume_count,
                    Utc::now().to_rfc3339(),
                    wf.error,
                ],
            )
            .context("Failed to save workflow")?;
        anyhow::ensure!(updated == 1, "Workflow {} not found on save", wf.id);
        Ok(())
    }

    pub fn list_workflows(&self, project_id: &str) -> Result<Vec<Workflow>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM workflows WHERE project_id = ?1
                 ORDER BY kanban_column, kanban_position",
                WORKFLOW_COLUMNS
            ))
            .context("Failed to prepare list_workflows")?;
        let rows = stmt
            .query_map(params![project_id], map_workflow_row)
            .context("Failed to query workflows")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read workflow rows")
    }

    /// Destroy a workflow and everything hanging off it.
    pub fn purge_workflow(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM locks WHERE workflow_id = ?1", params![id])?;
        let count = tx
            .execute("DELETE FROM workflows WHERE id = ?1", params![id])
            .context("Failed to delete workflow")?;
        tx.commit()?;
        Ok(count > 0)
    }

    // ── Task CRUD ─────────────────────────────────────────────────────

    pub fn upsert_task(&self, task: &Task) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO tasks (id, workflow_id, name, description, scope_json, deps_json,
                 agent, model, done_criteria, status, attempt, batch_index, started_at,
                 completed_at, tokens_in, tokens_out, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT (workflow_id, id) DO UPDATE SET
                 name = excluded.name, description = excluded.description,
                 scope_json = excluded.scope_json, deps_json = excluded.deps_json,
                 agent = excluded.agent, model = excluded.model,
                 done_criteria = excluded.done_criteria, status = excluded.status,
                 attempt = excluded.attempt, batch_index = excluded.batch_index,
                 started_at = excluded.started_at, completed_at = excluded.completed_at,
                 tokens_in = excluded.tokens_in, tokens_out = excluded.tokens_out,
                 error = excluded.error",
            params![
                task.id,
                task.workflow_id,
                task.name,
                task.description,
                serde_json::to_string(&task.scope)?,
                serde_json::to_string(&task.depends_on)?,
                task.agent,
                task.model,
                task.done_criteria,
                task.status.as_str(),
                task.attempt,
                task.batch_index,
                task.started_at.map(|t| t.to_rfc3339()),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.tokens_in as i64,
                task.tokens_out as i64,
                task.error,
            ],
        )
        .context("Failed to upsert task")?;
        Ok(())
    }

    pub fn get_tasks(&self, workflow_id: &str) -> Result<Vec<Task>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, workflow_id, name, description, scope_json, deps_json, agent, model,
                        done_criteria, status, attempt, batch_index, started_at, completed_at,
                        tokens_in, tokens_out, error
                 FROM tasks WHERE workflow_id = ?1 ORDER BY batch_index, id",
            )
            .context("Failed to prepare get_tasks")?;
        let rows = stmt
            .query_map(params![workflow_id], map_task_row)
            .context("Failed to query tasks")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read task rows")
    }

    pub fn get_task(&self, workflow_id: &str, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, workflow_id, name, description, scope_json, deps_json, agent, model,
                    done_criteria, status, attempt, batch_index, started_at, completed_at,
                    tokens_in, tokens_out, error
             FROM tasks WHERE workflow_id = ?1 AND id = ?2",
            params![workflow_id, task_id],
            map_task_row,
        )
        .optional()
        .context("Failed to query task")
    }

    // ── Checkpoints ───────────────────────────────────────────────────

    /// Idempotent per (workflow, phase): re-appending replaces the artifacts
    /// without duplicating the row.
    pub fn append_checkpoint(
        &self,
        workflow_id: &str,
        phase: WorkflowPhase,
        artifacts: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO checkpoints (workflow_id, phase, artifacts_blob, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workflow_id, phase) DO UPDATE SET
                 artifacts_blob = excluded.artifacts_blob",
            params![
                workflow_id,
                phase.as_str(),
                artifacts.to_string(),
                Utc::now().to_rfc3339()
            ],
        )
        .context("Failed to append checkpoint")?;
        Ok(())
    }

    pub fn get_checkpoint(
        &self,
        workflow_id: &str,
        phase: WorkflowPhase,
    ) -> Result<Option<serde_json::Value>> {
        let conn = self.lock();
        let blob: Option<String> = conn
            .query_row(
                "SELECT artifacts_blob FROM checkpoints WHERE workflow_id = ?1 AND phase = ?2",
                params![workflow_id, phase.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query checkpoint")?;
        match blob {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("Corrupt checkpoint blob")?,
            )),
            None => Ok(None),
        }
    }

    /// The latest *complete* checkpointed working phase, in phase order.
    ///
    /// Checkpoint blobs carry a `complete` flag; phases persist intermediate
    /// artifacts (V-rounds) with `complete: false`, which do not count as a
    /// resumable boundary — resume replays from phase boundaries, never
    /// mid-phase.
    pub fn latest_checkpoint_phase(&self, workflow_id: &str) -> Result<Option<WorkflowPhase>> {
        let mut latest = None;
        for phase in WorkflowPhase::sequence() {
            match self.get_checkpoint(workflow_id, phase)? {
                Some(blob) if blob.get("complete").and_then(|c| c.as_bool()) == Some(true) => {
                    latest = Some(phase);
                }
                _ => break,
            }
        }
        Ok(latest)
    }

    // ── Agent events ──────────────────────────────────────────────────

    /// Append events to the workflow's event log, deduplicated by synthetic
    /// id, ordered by timestamp. Append-only: existing events are never
    /// removed.
    pub fn append_agent_events(&self, workflow_id: &str, events: &[AgentEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;

        let blob: String = tx
            .query_row(
                "SELECT agent_events_blob FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .context("Workflow not found for event append")?;
        let mut existing: Vec<AgentEvent> =
            serde_json::from_str(&blob).context("Corrupt agent_events_blob")?;

        let known: std::collections::HashSet<String> =
            existing.iter().map(|e| e.synthetic_id.clone()).collect();
        for event in events {
            if !known.contains(&event.synthetic_id) {
                existing.push(event.clone());
            }
        }
        existing.sort_by(|a, b| a.ts.cmp(&b.ts));

        tx.execute(
            "UPDATE workflows SET agent_events_blob = ?2 WHERE id = ?1",
            params![workflow_id, serde_json::to_string(&existing)?],
        )
        .context("Failed to write agent events")?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_agent_events(&self, workflow_id: &str) -> Result<Vec<AgentEvent>> {
        let conn = self.lock();
        let blob: String = conn
            .query_row(
                "SELECT agent_events_blob FROM workflows WHERE id = ?1",
                params![workflow_id],
                |row| row.get(0),
            )
            .context("Workflow not found")?;
        serde_json::from_str(&blob).context("Corrupt agent_events_blob")
    }
}

const WORKFLOW_COLUMNS: &str = "id, project_id, prompt, refined_prompt, status, current_phase,
    kanban_column, kanban_position, workflow_branch, execution_id, resume_count,
    created_at, updated_at, last_heartbeat_at, error";

fn map_workflow_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Workflow> {
    let status: String = row.get(4)?;
    let phase: String = row.get(5)?;
    let column: String = row.get(6)?;
    Ok(Workflow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        prompt: row.get(2)?,
        refined_prompt: row.get(3)?,
        status: WorkflowStatus::from_str(&status).unwrap_or(WorkflowStatus::Failed),
        current_phase: WorkflowPhase::from_str(&phase).unwrap_or(WorkflowPhase::Failed),
        kanban_column: KanbanColumn::from_str(&column).unwrap_or(KanbanColumn::Refinement),
        kanban_position: row.get(7)?,
        workflow_branch: row.get(8)?,
        execution_id: row.get(9)?,
        resume_count: row.get::<_, i64>(10)? as u32,
        created_at: parse_ts(row.get::<_, String>(11)?),
        updated_at: parse_ts(row.get::<_, String>(12)?),
        last_heartbeat_at: row.get::<_, Option<String>>(13)?.map(parse_ts),
        error: row.get(14)?,
    })
}

fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let scope_json: String = row.get(4)?;
    let deps_json: String = row.get(5)?;
    let status: String = row.get(9)?;
    Ok(Task {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        scope: serde_json::from_str(&scope_json).unwrap_or_default(),
        depends_on: serde_json::from_str(&deps_json).unwrap_or_default(),
        agent: row.get(6)?,
        model: row.get(7)?,
        done_criteria: row.get(8)?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Failed),
        attempt: row.get::<_, i64>(10)? as u32,
        batch_index: row.get::<_, Option<i64>>(11)?.map(|b| b as u32),
        started_at: row.get::<_, Option<String>>(12)?.map(parse_ts),
        completed_at: row.get::<_, Option<String>>(13)?.map(parse_ts),
        tokens_in: row.get::<_, i64>(14)? as u64,
        tokens_out: row.get::<_, i64>(15)? as u64,
        error: row.get(16)?,
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AgentEventKind;
    use serde_json::json;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    fn make_task(store: &StateStore, wf_id: &str, id: &str, deps: Vec<String>) -> Task {
        let task = Task {
            id: id.to_string(),
            workflow_id: wf_id.to_string(),
            name: format!("Task {}", id),
            description: "do the thing".to_string(),
            scope: vec!["src/".to_string()],
            depends_on: deps,
            agent: "claude".to_string(),
            model: None,
            done_criteria: "the thing is done".to_string(),
            status: TaskStatus::Pending,
            attempt: 0,
            batch_index: Some(0),
            started_at: None,
            completed_at: None,
            tokens_in: 0,
            tokens_out: 0,
            error: None,
        };
        store.upsert_task(&task).unwrap();
        task
    }

    #[test]
    fn create_workflow_initial_state() {
        let store = store();
        let wf = store.create_workflow("default", "Add JWT middleware").unwrap();

        assert!(wf.id.starts_with("wf-"));
        assert_eq!(wf.status, WorkflowStatus::Pending);
        assert_eq!(wf.current_phase, WorkflowPhase::Refine);
        assert_eq!(wf.kanban_column, KanbanColumn::Refinement);
        assert_eq!(wf.kanban_position, 0);
        assert!(wf.refined_prompt.is_none());
    }

    #[test]
    fn create_workflow_positions_are_dense() {
        let store = store();
        let a = store.create_workflow("default", "first").unwrap();
        let b = store.create_workflow("default", "second").unwrap();
        assert_eq!(a.kanban_position, 0);
        assert_eq!(b.kanban_position, 1);
    }

    #[test]
    fn save_and_reload_workflow() {
        let store = store();
        let mut wf = store.create_workflow("default", "prompt").unwrap();

        wf.refined_prompt = Some("refined prompt".to_string());
        wf.status = WorkflowStatus::Running;
        wf.current_phase = WorkflowPhase::Analyze;
        wf.workflow_branch = Some(wf.branch_name());
        store.save_workflow(&wf).unwrap();

        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert_eq!(loaded.refined_prompt.as_deref(), Some("refined prompt"));
        assert_eq!(loaded.status, WorkflowStatus::Running);
        assert_eq!(loaded.current_phase, WorkflowPhase::Analyze);
        assert_eq!(loaded.workflow_branch, Some(wf.branch_name()));
    }

    #[test]
    fn save_unknown_workflow_fails() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();
        let mut ghost = wf.clone();
        ghost.id = "wf-00000000-000000-none".to_string();
        assert!(store.save_workflow(&ghost).is_err());
    }

    #[test]
    fn get_workflow_not_found() {
        let store = store();
        assert!(store.get_workflow("wf-nope").unwrap().is_none());
    }

    #[test]
    fn purge_workflow_cascades() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();
        make_task(&store, &wf.id, "task-01-a", vec![]);
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &json!({"refined": null}))
            .unwrap();

        assert!(store.purge_workflow(&wf.id).unwrap());
        assert!(store.get_workflow(&wf.id).unwrap().is_none());
        assert!(store.get_tasks(&wf.id).unwrap().is_empty());
        // Second purge is a no-op
        assert!(!store.purge_workflow(&wf.id).unwrap());
    }

    #[test]
    fn task_upsert_round_trips() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();
        let mut task = make_task(&store, &wf.id, "task-01-auth", vec!["task-00-base".into()]);

        task.status = TaskStatus::Completed;
        task.attempt = 2;
        task.tokens_in = 1200;
        task.tokens_out = 800;
        store.upsert_task(&task).unwrap();

        let loaded = store.get_task(&wf.id, "task-01-auth").unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.attempt, 2);
        assert_eq!(loaded.depends_on, vec!["task-00-base".to_string()]);
        assert_eq!(loaded.tokens_in, 1200);
        assert_eq!(loaded.scope, vec!["src/".to_string()]);
    }

    #[test]
    fn checkpoint_is_idempotent_per_phase() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();

        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &json!({"v": 1}))
            .unwrap();
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &json!({"v": 2}))
            .unwrap();

        let cp = store.get_checkpoint(&wf.id, WorkflowPhase::Refine).unwrap().unwrap();
        assert_eq!(cp["v"], 2);
    }

    #[test]
    fn latest_checkpoint_phase_respects_order() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();
        assert!(store.latest_checkpoint_phase(&wf.id).unwrap().is_none());

        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &json!({"complete": true}))
            .unwrap();
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Analyze, &json!({"complete": true}))
            .unwrap();
        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Analyze)
        );

        // A gap stops the scan: Plan missing means Execute doesn't count.
        store
            .append_checkpoint(&wf.id, WorkflowPhase::Execute, &json!({"complete": true}))
            .unwrap();
        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Analyze)
        );
    }

    #[test]
    fn incomplete_checkpoint_is_not_a_resume_boundary() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();

        store
            .append_checkpoint(&wf.id, WorkflowPhase::Refine, &json!({"complete": true}))
            .unwrap();
        // Mid-phase artifact: V-rounds persisted before the phase finished.
        store
            .append_checkpoint(
                &wf.id,
                WorkflowPhase::Analyze,
                &json!({"complete": false, "artifacts": {"rounds": []}}),
            )
            .unwrap();

        assert_eq!(
            store.latest_checkpoint_phase(&wf.id).unwrap(),
            Some(WorkflowPhase::Refine)
        );
    }

    #[test]
    fn agent_events_deduplicate_by_synthetic_id() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();

        let event = AgentEvent::new(
            AgentEventKind::Completed,
            "claude",
            &wf.id,
            "exec-1",
            json!({"text": "done"}),
        );
        store.append_agent_events(&wf.id, &[event.clone()]).unwrap();
        // Replay from persistence: same synthetic id, must not duplicate
        store.append_agent_events(&wf.id, &[event.clone()]).unwrap();

        let events = store.get_agent_events(&wf.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].synthetic_id, event.synthetic_id);
    }

    #[test]
    fn agent_events_are_ordered_by_timestamp() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();

        let mut first = AgentEvent::new(
            AgentEventKind::Started,
            "claude",
            &wf.id,
            "exec-1",
            json!({}),
        );
        let mut second = AgentEvent::new(
            AgentEventKind::Completed,
            "claude",
            &wf.id,
            "exec-1",
            json!({"text": "done"}),
        );
        first.ts = Utc::now() - chrono::Duration::seconds(10);
        second.ts = Utc::now();

        // Append out of order
        store
            .append_agent_events(&wf.id, &[second.clone(), first.clone()])
            .unwrap();

        let events = store.get_agent_events(&wf.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, AgentEventKind::Started);
        assert_eq!(events[1].kind, AgentEventKind::Completed);
    }

    #[test]
    fn migrations_are_recorded() {
        let store = store();
        assert_eq!(store.schema_version().unwrap(), 1);
    }
}
