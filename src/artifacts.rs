//! On-disk run artifacts.
//!
//! Each workflow writes numbered markdown files under
//! `<project>/.quorum/runs/<workflow-id>/`; the `NN-` prefix keeps a stable
//! reading order. Issue drafts land under
//! `<project>/.quorum/issues/<workflow-id>/{draft,published}/`.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::analyze::AnalysisArtifacts;
use crate::execute::ExecuteArtifacts;
use crate::ids::slugify;
use crate::plan::PlanArtifacts;
use crate::refine::RefineArtifacts;

/// Writer for one workflow's run directory. Tracks the file counter so
/// artifacts stay numbered in write order.
pub struct RunArtifacts {
    dir: PathBuf,
    counter: u32,
}

impl RunArtifacts {
    pub fn new(project_dir: &Path, workflow_id: &str) -> Result<Self> {
        let dir = crate::config::QuorumConfig::runs_dir(project_dir, workflow_id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        // Continue numbering after existing files on resume.
        let counter = std::fs::read_dir(&dir)
            .map(|entries| entries.count() as u32)
            .unwrap_or(0);
        Ok(Self { dir, counter })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&mut self, slug: &str, content: &str) -> Result<PathBuf> {
        let path = self.dir.join(format!("{:02}-{}.md", self.counter, slug));
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.counter += 1;
        Ok(path)
    }

    pub fn write_prompt(&mut self, prompt: &str) -> Result<PathBuf> {
        self.write("prompt", &format!("# Prompt\n\n{}\n", prompt))
    }

    pub fn write_refinement(&mut self, artifacts: &RefineArtifacts) -> Result<PathBuf> {
        let body = match &artifacts.refined {
            Some(refined) => format!(
                "# Refined Prompt\n\nAgent: {}\n\n{}\n",
                artifacts.agent.as_deref().unwrap_or("(none)"),
                refined
            ),
            None => "# Refined Prompt\n\nRefinement fell back to the original prompt.\n".to_string(),
        };
        self.write("refined-prompt", &body)
    }

    pub fn write_analysis(&mut self, artifacts: &AnalysisArtifacts) -> Result<PathBuf> {
        let mut body = String::from("# Analysis\n");
        for round in &artifacts.rounds {
            for output in &round.outputs {
                body.push_str(&format!(
                    "\n## Round {} — {}\n\n{}\n",
                    round.round, output.agent, output.text
                ));
            }
            if let Some(ref moderation) = round.moderation {
                body.push_str(&format!(
                    "\n## Round {} — consensus {:.2} ({} divergences)\n",
                    round.round,
                    moderation.score,
                    moderation.divergences.len()
                ));
            }
        }
        if artifacts.forced_consolidation {
            body.push_str("\n> Forced consolidation: max rounds exhausted below threshold.\n");
        }
        body.push_str(&format!("\n## Consolidated\n\n{}\n", artifacts.consolidated));
        self.write("analysis", &body)
    }

    pub fn write_plan(&mut self, artifacts: &PlanArtifacts) -> Result<PathBuf> {
        let mut body = format!("# Plan\n\n{}\n", artifacts.reasoning);
        for task in &artifacts.tasks {
            body.push_str(&format!(
                "\n## {} ({})\n\nAgent: {} · Batch: {} · Depends on: {}\n\n{}\n",
                task.name,
                task.id,
                task.agent,
                task.batch_index,
                if task.depends_on.is_empty() {
                    "-".to_string()
                } else {
                    task.depends_on.join(", ")
                },
                task.description
            ));
        }
        self.write("plan", &body)
    }

    pub fn write_execution(&mut self, artifacts: &ExecuteArtifacts) -> Result<PathBuf> {
        let mut body = format!(
            "# Execution\n\nCompleted: {}\nFailed: {}\nSkipped: {}\n",
            artifacts.completed, artifacts.failed, artifacts.skipped
        );
        if artifacts.cancelled {
            body.push_str("Cancelled: yes\n");
        }
        if artifacts.finalization.pushed {
            body.push_str("Pushed: yes\n");
        }
        if let Some(ref url) = artifacts.finalization.pr_url {
            body.push_str(&format!("PR: {}\n", url));
        }
        for error in &artifacts.finalization.errors {
            body.push_str(&format!("Finalization error: {}\n", error));
        }
        self.write("execution", &body)
    }
}

/// Write an issue markdown file for a workflow, draft or published.
pub fn write_issue(
    project_dir: &Path,
    workflow_id: &str,
    published: bool,
    title: &str,
    body: &str,
) -> Result<PathBuf> {
    let state = if published { "published" } else { "draft" };
    let dir = crate::config::QuorumConfig::issues_dir(project_dir, workflow_id).join(state);
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let count = std::fs::read_dir(&dir).map(|entries| entries.count()).unwrap_or(0);
    let path = dir.join(format!("{:02}-{}.md", count, slugify(title, 40)));
    std::fs::write(&path, format!("# {}\n\n{}\n", title, body))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
