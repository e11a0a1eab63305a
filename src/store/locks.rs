//! Per-workflow exclusion locks with stale detection, heartbeats and the
//! zombie scan.
//!
//! A lock row is stale only when its wall-clock age exceeds the TTL *and* the
//! holder process is absent on this host. Live peers on the same host can
//! never have their locks stolen; crashed holders are recovered from.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};

use super::StateStore;

/// Proof of lock ownership, required for release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub workflow_id: String,
    pub holder_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone)]
pub enum LockOutcome {
    Acquired(LockToken),
    Held {
        holder_pid: u32,
        holder_host: String,
        acquired_at: DateTime<Utc>,
    },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Whether a process with the given pid exists on this host.
///
/// `kill(pid, 0)` probes without signalling; EPERM still means the process
/// exists, it just belongs to another user.
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

impl StateStore {
    /// Atomically acquire the per-workflow lock.
    ///
    /// On conflict the holder is inspected: a row whose age exceeds its TTL
    /// and whose pid is absent on the same host is deleted and the insert is
    /// retried once. Anything else reports `Held`.
    pub fn acquire_lock(&self, workflow_id: &str, ttl: Duration) -> Result<LockOutcome> {
        let pid = std::process::id();
        let host = hostname();

        for attempt in 0..2 {
            let now = Utc::now();
            let conn = self.lock();
            let tx = conn.unchecked_transaction()?;

            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO locks
                         (workflow_id, holder_pid, holder_host, acquired_at, ttl_seconds)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![workflow_id, pid, host, now.to_rfc3339(), ttl.num_seconds()],
                )
                .context("Failed to insert lock row")?;

            if inserted == 1 {
                tx.commit()?;
                return Ok(LockOutcome::Acquired(LockToken {
                    workflow_id: workflow_id.to_string(),
                    holder_pid: pid,
                    acquired_at: now,
                }));
            }

            let holder: Option<(i64, String, String, i64)> = tx
                .query_row(
                    "SELECT holder_pid, holder_host, acquired_at, ttl_seconds
                     FROM locks WHERE workflow_id = ?1",
                    params![workflow_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()
                .context("Failed to read lock holder")?;

            let Some((holder_pid, holder_host, acquired_raw, ttl_seconds)) = holder else {
                // Holder released between insert and read; retry.
                tx.commit()?;
                continue;
            };

            let acquired_at = DateTime::parse_from_rfc3339(&acquired_raw)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or(now);
            let age = now - acquired_at;
            let expired = age > Duration::seconds(ttl_seconds);
            let same_host = holder_host == host;
            let absent = same_host && !pid_alive(holder_pid as u32);

            if expired && absent && attempt == 0 {
                tracing::warn!(
                    workflow_id,
                    holder_pid,
                    age_seconds = age.num_seconds(),
                    "Breaking stale lock from dead process"
                );
                tx.execute(
                    "DELETE FROM locks WHERE workflow_id = ?1 AND holder_pid = ?2",
                    params![workflow_id, holder_pid],
                )
                .context("Failed to break stale lock")?;
                tx.commit()?;
                continue;
            }

            tx.commit()?;
            return Ok(LockOutcome::Held {
                holder_pid: holder_pid as u32,
                holder_host,
                acquired_at,
            });
        }

        // Both attempts conflicted with a live holder.
        let conn = self.lock();
        let holder: Option<(i64, String, String)> = conn
            .query_row(
                "SELECT holder_pid, holder_host, acquired_at FROM locks WHERE workflow_id = ?1",
                params![workflow_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match holder {
            Some((pid, host, acquired_raw)) => Ok(LockOutcome::Held {
                holder_pid: pid as u32,
                holder_host: host,
                acquired_at: DateTime::parse_from_rfc3339(&acquired_raw)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }),
            None => anyhow::bail!("Lock acquisition raced twice for {}", workflow_id),
        }
    }

    /// Idempotent release. Releasing a lock held by someone else is a no-op
    /// with a warning.
    pub fn release_lock(&self, token: &LockToken) -> Result<()> {
        let conn = self.lock();
        let deleted = conn
            .execute(
                "DELETE FROM locks WHERE workflow_id = ?1 AND holder_pid = ?2",
                params![token.workflow_id, token.holder_pid],
            )
            .context("Failed to release lock")?;
        if deleted == 0 {
            tracing::warn!(
                workflow_id = token.workflow_id,
                "Released a lock this process did not hold"
            );
        }
        Ok(())
    }

    /// Record a liveness pulse for a running workflow.
    pub fn write_heartbeat(
        &self,
        workflow_id: &str,
        execution_id: &str,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        let tx = conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO heartbeats (workflow_id, execution_id, ts) VALUES (?1, ?2, ?3)
             ON CONFLICT (workflow_id) DO UPDATE SET
                 execution_id = excluded.execution_id, ts = excluded.ts",
            params![workflow_id, execution_id, ts.to_rfc3339()],
        )
        .context("Failed to write heartbeat")?;
        tx.execute(
            "UPDATE workflows SET last_heartbeat_at = ?2 WHERE id = ?1",
            params![workflow_id, ts.to_rfc3339()],
        )
        .context("Failed to update workflow heartbeat")?;
        tx.commit()?;
        Ok(())
    }

    /// Running workflows whose last heartbeat is older than the threshold.
    pub fn scan_zombies(&self, threshold: Duration) -> Result<Vec<String>> {
        let cutoff = (Utc::now() - threshold).to_rfc3339();
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM workflows
                 WHERE status = 'running'
                   AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)
                 ORDER BY id",
            )
            .context("Failed to prepare zombie scan")?;
        let rows = stmt
            .query_map(params![cutoff], |row| row.get::<_, String>(0))
            .context("Failed to scan zombies")?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to read zombie rows")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkflowStatus;

    fn store() -> StateStore {
        StateStore::open_in_memory().unwrap()
    }

    #[test]
    fn acquire_then_conflict() {
        let store = store();
        let outcome = store.acquire_lock("wf-1", Duration::hours(1)).unwrap();
        assert!(outcome.is_acquired());

        // Same process re-acquiring conflicts: the row already exists and the
        // holder (this process) is alive.
        let second = store.acquire_lock("wf-1", Duration::hours(1)).unwrap();
        match second {
            LockOutcome::Held { holder_pid, .. } => {
                assert_eq!(holder_pid, std::process::id());
            }
            LockOutcome::Acquired(_) => panic!("Expected Held"),
        }
    }

    #[test]
    fn release_then_reacquire() {
        let store = store();
        let LockOutcome::Acquired(token) = store.acquire_lock("wf-1", Duration::hours(1)).unwrap()
        else {
            panic!("Expected acquisition");
        };
        store.release_lock(&token).unwrap();
        assert!(store.acquire_lock("wf-1", Duration::hours(1)).unwrap().is_acquired());
    }

    #[test]
    fn release_is_idempotent() {
        let store = store();
        let LockOutcome::Acquired(token) = store.acquire_lock("wf-1", Duration::hours(1)).unwrap()
        else {
            panic!("Expected acquisition");
        };
        store.release_lock(&token).unwrap();
        // Second release is a soft no-op.
        store.release_lock(&token).unwrap();
    }

    #[test]
    fn stale_lock_from_dead_process_is_broken() {
        let store = store();
        // Plant a lock row with an expired TTL and a pid that cannot exist.
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO locks (workflow_id, holder_pid, holder_host, acquired_at, ttl_seconds)
                 VALUES ('wf-1', 999999999, ?1, ?2, 1)",
                params![
                    super::hostname(),
                    (Utc::now() - Duration::hours(2)).to_rfc3339()
                ],
            )
            .unwrap();
        }

        let outcome = store.acquire_lock("wf-1", Duration::hours(1)).unwrap();
        assert!(outcome.is_acquired());
    }

    #[test]
    fn expired_lock_with_live_holder_is_not_broken() {
        let store = store();
        // Expired TTL but the holder pid is this very process — still alive.
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO locks (workflow_id, holder_pid, holder_host, acquired_at, ttl_seconds)
                 VALUES ('wf-1', ?1, ?2, ?3, 1)",
                params![
                    std::process::id(),
                    super::hostname(),
                    (Utc::now() - Duration::hours(2)).to_rfc3339()
                ],
            )
            .unwrap();
        }

        let outcome = store.acquire_lock("wf-1", Duration::hours(1)).unwrap();
        assert!(!outcome.is_acquired());
    }

    #[test]
    fn fresh_lock_from_dead_process_is_not_broken() {
        let store = store();
        // Dead pid but TTL not yet exceeded: both conditions are required.
        {
            let conn = store.lock();
            conn.execute(
                "INSERT INTO locks (workflow_id, holder_pid, holder_host, acquired_at, ttl_seconds)
                 VALUES ('wf-1', 999999999, ?1, ?2, 3600)",
                params![super::hostname(), Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let outcome = store.acquire_lock("wf-1", Duration::hours(1)).unwrap();
        assert!(!outcome.is_acquired());
    }

    #[test]
    fn heartbeat_updates_workflow_row() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();

        store.write_heartbeat(&wf.id, "exec-1", Utc::now()).unwrap();
        let loaded = store.get_workflow(&wf.id).unwrap().unwrap();
        assert!(loaded.last_heartbeat_at.is_some());
    }

    #[test]
    fn zombie_scan_finds_stale_running_workflows() {
        let store = store();
        let mut wf = store.create_workflow("default", "prompt").unwrap();
        wf.status = WorkflowStatus::Running;
        store.save_workflow(&wf).unwrap();

        // Heartbeat three minutes old, threshold two minutes.
        store
            .write_heartbeat(&wf.id, "exec-1", Utc::now() - Duration::minutes(3))
            .unwrap();

        let zombies = store.scan_zombies(Duration::minutes(2)).unwrap();
        assert_eq!(zombies, vec![wf.id.clone()]);

        // A fresh heartbeat takes it off the list.
        store.write_heartbeat(&wf.id, "exec-1", Utc::now()).unwrap();
        assert!(store.scan_zombies(Duration::minutes(2)).unwrap().is_empty());
    }

    #[test]
    fn zombie_scan_ignores_non_running_workflows() {
        let store = store();
        let wf = store.create_workflow("default", "prompt").unwrap();
        // Pending workflow with no heartbeat is not a zombie.
        assert!(store.scan_zombies(Duration::minutes(2)).unwrap().is_empty());
        let _ = wf;
    }

    #[test]
    fn running_workflow_without_heartbeat_is_a_zombie() {
        let store = store();
        let mut wf = store.create_workflow("default", "prompt").unwrap();
        wf.status = WorkflowStatus::Running;
        store.save_workflow(&wf).unwrap();

        let zombies = store.scan_zombies(Duration::minutes(2)).unwrap();
        assert_eq!(zombies, vec![wf.id]);
    }
}
