//! Git isolation for workflows and tasks.
//!
//! A workflow owns the long-lived branch `quorum/<workflow-id>`. Each task
//! gets its own worktree on the task branch `<workflow-branch>__<task-id>`;
//! successful task branches merge locally into the workflow branch, failed
//! ones never touch it. Push, PR creation and PR merge happen only during
//! finalization and their failures never roll back local commits.
//!
//! Branch and worktree plumbing shells out to `git`; change inspection for
//! file-scope enforcement walks the diff through git2.

use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::MergeStrategy;

/// A task's isolated checkout.
#[derive(Debug, Clone)]
pub struct TaskWorktree {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Clone)]
pub struct WorktreeManager {
    project_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("Failed to run git {}", args.join(" ")))
    }

    async fn git_ok(&self, args: &[&str]) -> Result<()> {
        let output = self.git(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }
        Ok(())
    }

    pub async fn current_branch(&self) -> Result<String> {
        let output = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if !output.status.success() {
            anyhow::bail!("Failed to determine current branch");
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Make git ignore the `.quorum` state directory (db, logs, run
    /// artifacts, worktrees) so orchestrator bookkeeping never shows up in
    /// task diffs or commits.
    fn ensure_state_dir_ignored(&self) -> Result<()> {
        let quorum_dir = self.project_dir.join(".quorum");
        std::fs::create_dir_all(&quorum_dir)
            .with_context(|| format!("Failed to create {}", quorum_dir.display()))?;
        let gitignore = quorum_dir.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "*\n").context("Failed to write .quorum/.gitignore")?;
        }
        Ok(())
    }

    /// Create the workflow branch (if missing) and check it out.
    pub async fn ensure_workflow_branch(&self, branch: &str) -> Result<()> {
        self.ensure_state_dir_ignored()?;
        let exists = self
            .git(&["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .await?
            .status
            .success();

        if exists {
            self.git_ok(&["checkout", branch]).await?;
        } else {
            self.git_ok(&["checkout", "-b", branch]).await?;
        }
        tracing::info!(branch, "Workflow branch ready");
        Ok(())
    }

    /// Branch name for a task: `<workflow-branch>__<task-id>`.
    pub fn task_branch(workflow_branch: &str, task_id: &str) -> String {
        format!("{}__{}", workflow_branch, task_id)
    }

    /// Create the task worktree on a fresh task branch off the workflow
    /// branch.
    pub async fn create_task_worktree(
        &self,
        workflow_branch: &str,
        task_id: &str,
    ) -> Result<TaskWorktree> {
        let branch = Self::task_branch(workflow_branch, task_id);
        let path = self
            .project_dir
            .join(".quorum")
            .join("worktrees")
            .join(task_id);

        let parent = path
            .parent()
            .context("Worktree path has no parent directory")?;
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create worktrees directory")?;

        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;

        let output = self
            .git(&["worktree", "add", "-b", &branch, path_str, workflow_branch])
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("git worktree add failed: {}", stderr.trim());
        }

        tracing::debug!(task_id, branch = branch.as_str(), "Task worktree created");
        Ok(TaskWorktree { path, branch })
    }

    pub async fn remove_worktree(&self, path: &Path) -> Result<()> {
        let path_str = path
            .to_str()
            .context("Worktree path contains invalid UTF-8")?;
        self.git_ok(&["worktree", "remove", "--force", path_str])
            .await
    }

    /// Delete a task branch after its worktree is gone.
    pub async fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["branch", "-D", branch]).await
    }

    /// Paths modified (added, changed, deleted, untracked) in a checkout
    /// relative to its HEAD, repo-relative.
    pub fn changed_paths(&self, checkout: &Path) -> Result<Vec<PathBuf>> {
        let repo = Repository::open(checkout).context("Failed to open git checkout")?;
        let head_tree = repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_tree().ok());

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);

        let diff = repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff checkout")?;

        let mut paths = Vec::new();
        diff.foreach(
            &mut |delta, _progress| {
                let file = match delta.status() {
                    Delta::Deleted => delta.old_file(),
                    _ => delta.new_file(),
                };
                if let Some(path) = file.path() {
                    // Orchestrator bookkeeping is never a task change.
                    if !path.starts_with(".quorum") {
                        paths.push(path.to_path_buf());
                    }
                }
                true
            },
            None,
            None,
            None,
        )
        .context("Failed to walk diff")?;

        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Stage and commit everything in a checkout. Returns false when there
    /// was nothing to commit.
    pub async fn commit_all(&self, checkout: &Path, message: &str) -> Result<bool> {
        let status = Command::new("git")
            .args(["status", "--porcelain"])
            .current_dir(checkout)
            .output()
            .await
            .context("Failed to run git status")?;
        if status.stdout.is_empty() {
            return Ok(false);
        }

        let add = Command::new("git")
            .args(["add", "-A"])
            .current_dir(checkout)
            .output()
            .await
            .context("Failed to run git add")?;
        if !add.status.success() {
            anyhow::bail!(
                "git add failed: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            );
        }

        let commit = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(checkout)
            .output()
            .await
            .context("Failed to run git commit")?;
        if !commit.status.success() {
            anyhow::bail!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit.stderr).trim()
            );
        }
        Ok(true)
    }

    /// Merge a task branch into the workflow branch with `--no-ff`.
    ///
    /// Checks out the target in the main working directory, so callers must
    /// serialise merges per workflow (the executor does, via the workflow
    /// lock). On conflict the merge is aborted, the original branch restored,
    /// and Ok(false) returned.
    pub async fn merge_task_branch(&self, task_branch: &str, workflow_branch: &str) -> Result<bool> {
        let original_branch = self.current_branch().await?;

        self.git_ok(&["checkout", workflow_branch])
            .await
            .context("Failed to checkout workflow branch for merge")?;

        let output = self
            .git(&[
                "merge",
                "--no-ff",
                "-m",
                &format!("Merge {}", task_branch),
                task_branch,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                task_branch,
                workflow_branch,
                error = stderr.trim(),
                "Task branch merge failed"
            );
            if let Err(e) = self.git_ok(&["merge", "--abort"]).await {
                tracing::error!(error = %e, "merge --abort failed");
            }
            if original_branch != workflow_branch {
                if let Err(e) = self.git_ok(&["checkout", &original_branch]).await {
                    tracing::error!(error = %e, "checkout recovery failed");
                }
            }
            return Ok(false);
        }
        Ok(true)
    }

    // ── Finalization ──────────────────────────────────────────────────

    pub async fn push_branch(&self, branch: &str) -> Result<()> {
        self.git_ok(&["push", "-u", "origin", branch]).await
    }

    /// Create a PR via `gh`, returning its URL.
    pub async fn create_pull_request(
        &self,
        title: &str,
        body: &str,
        base: Option<&str>,
    ) -> Result<String> {
        let mut args = vec!["pr", "create", "--title", title, "--body", body];
        if let Some(base) = base {
            args.extend_from_slice(&["--base", base]);
        }

        let output = Command::new("gh")
            .args(&args)
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh pr create failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Merge the open PR for a branch with the configured strategy.
    pub async fn merge_pull_request(&self, branch: &str, strategy: MergeStrategy) -> Result<()> {
        let output = Command::new("gh")
            .args(["pr", "merge", branch, strategy.as_flag()])
            .current_dir(&self.project_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("Failed to run gh pr merge")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("gh pr merge failed: {}", stderr.trim());
        }
        Ok(())
    }
}

/// Changed paths outside a task's declared scope.
///
/// A path is in scope when it equals a scope entry or sits under a scope
/// entry treated as a directory prefix. An empty scope declares nothing, so
/// every change is a violation.
pub fn paths_outside_scope(changed: &[PathBuf], scope: &[String]) -> Vec<PathBuf> {
    changed
        .iter()
        .filter(|path| {
            !scope.iter().any(|entry| {
                let entry = entry.trim_end_matches('/');
                if entry.is_empty() {
                    return false;
                }
                let entry_path = Path::new(entry);
                *path == entry_path || path.starts_with(entry_path)
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    async fn init_repo() -> (WorktreeManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let run = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.name", "test"]);
        run(&["config", "user.email", "test@test.com"]);
        fs::write(dir.path().join("README.md"), "# test\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        (WorktreeManager::new(dir.path()), dir)
    }

    #[tokio::test]
    async fn ensure_workflow_branch_creates_and_reuses() {
        let (manager, _dir) = init_repo().await;

        manager.ensure_workflow_branch("quorum/wf-1").await.unwrap();
        assert_eq!(manager.current_branch().await.unwrap(), "quorum/wf-1");

        // Second call is a plain checkout, not a failure.
        manager.ensure_workflow_branch("quorum/wf-1").await.unwrap();
        assert_eq!(manager.current_branch().await.unwrap(), "quorum/wf-1");
    }

    #[tokio::test]
    async fn task_worktree_lifecycle() {
        let (manager, dir) = init_repo().await;
        manager.ensure_workflow_branch("quorum/wf-1").await.unwrap();

        let worktree = manager
            .create_task_worktree("quorum/wf-1", "task-00-auth")
            .await
            .unwrap();
        assert!(worktree.path.exists());
        assert_eq!(worktree.branch, "quorum/wf-1__task-00-auth");

        // Work in the worktree, commit, merge back.
        fs::write(worktree.path.join("auth.rs"), "fn auth() {}\n").unwrap();
        let committed = manager
            .commit_all(&worktree.path, "add auth module")
            .await
            .unwrap();
        assert!(committed);

        let merged = manager
            .merge_task_branch(&worktree.branch, "quorum/wf-1")
            .await
            .unwrap();
        assert!(merged);
        assert!(dir.path().join("auth.rs").exists());

        manager.remove_worktree(&worktree.path).await.unwrap();
        assert!(!worktree.path.exists());
        manager.delete_branch(&worktree.branch).await.unwrap();
    }

    #[tokio::test]
    async fn commit_all_reports_nothing_to_commit() {
        let (manager, dir) = init_repo().await;
        let committed = manager.commit_all(dir.path(), "noop").await.unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn state_dir_is_invisible_to_diffs_and_commits() {
        let (manager, dir) = init_repo().await;
        manager.ensure_workflow_branch("quorum/wf-1").await.unwrap();

        // Orchestrator bookkeeping lands under .quorum mid-run.
        let runs = dir.path().join(".quorum/runs/wf-1");
        fs::create_dir_all(&runs).unwrap();
        fs::write(runs.join("00-prompt.md"), "# Prompt\n").unwrap();

        let changed = manager.changed_paths(dir.path()).unwrap();
        assert!(changed.is_empty(), "unexpected changes: {:?}", changed);

        let committed = manager.commit_all(dir.path(), "noop").await.unwrap();
        assert!(!committed);
    }

    #[tokio::test]
    async fn changed_paths_sees_new_modified_and_untracked() {
        let (manager, dir) = init_repo().await;

        fs::write(dir.path().join("README.md"), "# changed\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/new.rs"), "fn new() {}\n").unwrap();

        let changed = manager.changed_paths(dir.path()).unwrap();
        assert!(changed.contains(&PathBuf::from("README.md")));
        assert!(changed.contains(&PathBuf::from("src/new.rs")));
    }

    #[tokio::test]
    async fn merge_conflict_restores_original_branch() {
        let (manager, dir) = init_repo().await;
        manager.ensure_workflow_branch("quorum/wf-1").await.unwrap();

        let worktree = manager
            .create_task_worktree("quorum/wf-1", "task-00-conflict")
            .await
            .unwrap();

        // Conflicting edits to the same file on both branches.
        fs::write(worktree.path.join("README.md"), "# from task\n").unwrap();
        manager.commit_all(&worktree.path, "task edit").await.unwrap();

        fs::write(dir.path().join("README.md"), "# from workflow\n").unwrap();
        manager.commit_all(dir.path(), "workflow edit").await.unwrap();

        let merged = manager
            .merge_task_branch(&worktree.branch, "quorum/wf-1")
            .await
            .unwrap();
        assert!(!merged);
        // Back on the workflow branch with no in-progress merge.
        assert_eq!(manager.current_branch().await.unwrap(), "quorum/wf-1");
        let contents = fs::read_to_string(dir.path().join("README.md")).unwrap();
        assert_eq!(contents, "# from workflow\n");
    }

    #[test]
    fn scope_check_prefix_and_exact() {
        let changed = vec![
            PathBuf::from("src/api/auth.rs"),
            PathBuf::from("src/lib.rs"),
            PathBuf::from("docs/readme.md"),
        ];
        let scope = vec!["src/api/".to_string(), "src/lib.rs".to_string()];

        let outside = paths_outside_scope(&changed, &scope);
        assert_eq!(outside, vec![PathBuf::from("docs/readme.md")]);
    }

    #[test]
    fn empty_scope_flags_everything() {
        let changed = vec![PathBuf::from("a.rs")];
        let outside = paths_outside_scope(&changed, &[]);
        assert_eq!(outside.len(), 1);
    }

    #[test]
    fn scope_does_not_match_sibling_prefix() {
        // "src/api" must not whitelist "src/api_v2".
        let changed = vec![PathBuf::from("src/api_v2/handler.rs")];
        let scope = vec!["src/api".to_string()];
        let outside = paths_outside_scope(&changed, &scope);
        assert_eq!(outside.len(), 1);
    }
}
