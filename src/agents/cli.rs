//! Reference `Agent` implementation driving an external CLI subprocess.
//!
//! The prompt is written to stdin; stdout is consumed line by line as
//! stream-json frames. Two liveness mechanisms apply:
//!
//! - **Idle timeout** — no stdout byte for the configured window kills the
//!   process and classifies the failure as `idle`, distinct from wall-clock
//!   timeouts.
//! - **Completion grace** — once the result frame has arrived but the process
//!   has not exited, we wait the grace period before force-kill so output
//!   already produced is not lost to a CLI that hangs during shutdown.
//!
//! Cancellation sends SIGTERM, waits the grace period, then SIGKILLs.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::stream::{self, LineResult};
use super::{Agent, AgentCapabilities, AgentRequest, AgentResponse, OutputFormat};
use crate::config::AgentConfig;
use crate::errors::AdapterError;

pub struct CliAgent {
    name: String,
    config: AgentConfig,
}

impl CliAgent {
    pub fn new(name: String, config: AgentConfig) -> Self {
        Self { name, config }
    }

    fn build_command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("--print");
        match request.output_format {
            OutputFormat::StreamJson => {
                cmd.args(["--output-format", "stream-json", "--verbose"]);
            }
            OutputFormat::Text => {
                cmd.args(["--output-format", "text"]);
            }
        }
        if let Some(model) = request.model.as_deref().or(self.config.model.as_deref()) {
            cmd.args(["--model", model]);
        }
        if let Some(effort) = request.reasoning_effort.as_deref() {
            cmd.args(["--reasoning-effort", effort]);
        }
        for attachment in &request.attachments {
            cmd.arg("--attach").arg(attachment);
        }
        for arg in &self.config.extra_args {
            cmd.arg(arg);
        }
        if let Some(workdir) = &request.workdir {
            cmd.current_dir(workdir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            let grace = Duration::from_secs(self.config.grace_period_secs);
            if tokio::time::timeout(grace, child.wait()).await.is_ok() {
                return;
            }
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::from_phases(&self.config.phases)
    }

    async fn ping(&self, cancel: &CancellationToken) -> Result<(), AdapterError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::invocation(&self.name, format!("spawn failed: {}", e)))?;

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(AdapterError::cancelled(&self.name))
            }
            status = tokio::time::timeout(Duration::from_secs(10), child.wait()) => {
                match status {
                    Ok(Ok(exit)) if exit.success() => Ok(()),
                    Ok(Ok(exit)) => Err(AdapterError::invocation(
                        &self.name,
                        format!("ping exited with {}", exit),
                    )),
                    Ok(Err(e)) => Err(AdapterError::invocation(&self.name, e.to_string())),
                    Err(_) => {
                        let _ = child.kill().await;
                        Err(AdapterError::timeout(&self.name, "ping timed out"))
                    }
                }
            }
        }
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: AgentRequest,
    ) -> Result<AgentResponse, AdapterError> {
        let start = Instant::now();
        let mut cmd = self.build_command(&request);

        let mut child = cmd
            .spawn()
            .map_err(|e| AdapterError::invocation(&self.name, format!("spawn failed: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.prompt.as_bytes())
                .await
                .map_err(|e| AdapterError::invocation(&self.name, format!("stdin write: {}", e)))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AdapterError::invocation(&self.name, format!("stdin close: {}", e)))?;
        }

        // Collect stderr concurrently so a chatty process cannot deadlock on
        // a full pipe.
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut content = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    content.push_str(&line);
                    content.push('\n');
                }
                content
            })
        });

        let stdout = child.stdout.take().ok_or_else(|| {
            AdapterError::invocation(&self.name, "child stdout unavailable")
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let idle_window = Duration::from_secs(self.config.idle_timeout_secs);
        let grace_window = Duration::from_secs(self.config.grace_period_secs);

        let mut accumulated = String::new();
        let mut raw_frames = Vec::new();
        let mut final_result: Option<LineResult> = None;

        loop {
            // After the completion marker, only the grace period remains.
            let window = if final_result.is_some() {
                grace_window
            } else {
                idle_window
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.terminate(&mut child).await;
                    return Err(AdapterError::cancelled(&self.name));
                }
                line = tokio::time::timeout(window, lines.next_line()) => {
                    match line {
                        Err(_) if final_result.is_some() => {
                            // Completion marker seen; the CLI is hanging in
                            // shutdown. Kill it and keep the output.
                            tracing::warn!(agent = %self.name, "Force-killing agent after completion grace period");
                            self.terminate(&mut child).await;
                            break;
                        }
                        Err(_) => {
                            self.terminate(&mut child).await;
                            return Err(AdapterError::idle(
                                &self.name,
                                format!("no output for {}s", self.config.idle_timeout_secs),
                            ));
                        }
                        Ok(Ok(Some(line))) => {
                            let parsed = stream::parse_line(&line);
                            if let Some(frame) = parsed.raw_frame {
                                raw_frames.push(frame);
                            }
                            if let Some(text) = parsed.text {
                                accumulated.push_str(&text);
                                accumulated.push('\n');
                            }
                            if let Some(ref tx) = request.events {
                                for observation in parsed.observations {
                                    if tx.send(observation).is_err() {
                                        break;
                                    }
                                }
                            }
                            if parsed.result.is_some() {
                                final_result = parsed.result;
                            }
                        }
                        Ok(Ok(None)) => break,
                        Ok(Err(e)) => {
                            self.terminate(&mut child).await;
                            return Err(AdapterError::invocation(&self.name, e.to_string()));
                        }
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| AdapterError::invocation(&self.name, e.to_string()))?;

        let stderr_content = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let duration = start.elapsed();

        match final_result {
            Some(result) if result.is_error => Err(AdapterError::invocation(
                &self.name,
                result.text.unwrap_or_else(|| "agent reported an error".to_string()),
            )),
            Some(result) => Ok(AgentResponse {
                text: result.text.unwrap_or(accumulated),
                tokens_in: result.usage.input_tokens,
                tokens_out: result.usage.output_tokens,
                duration,
                raw_frames,
            }),
            None if status.success() => Ok(AgentResponse {
                text: accumulated,
                tokens_in: 0,
                tokens_out: 0,
                duration,
                raw_frames,
            }),
            None => Err(AdapterError::invocation(
                &self.name,
                if stderr_content.is_empty() {
                    format!("process exited with {}", status)
                } else {
                    stderr_content.trim().to_string()
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentPhase;
    use std::os::unix::fs::PermissionsExt;
    use tokio::sync::mpsc;

    /// Write an executable fake CLI that ignores its arguments, consumes
    /// stdin, and runs the given script body.
    fn fake_cli(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("fake-agent");
        std::fs::write(&path, format!("#!/bin/sh\ncat >/dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn agent_for(command: &std::path::Path, idle_secs: u64, grace_secs: u64) -> CliAgent {
        CliAgent::new(
            "fake".to_string(),
            AgentConfig {
                command: command.to_string_lossy().to_string(),
                model: None,
                phases: vec![AgentPhase::Execute],
                rate_capacity: 4,
                rate_refill_per_sec: 1.0,
                idle_timeout_secs: idle_secs,
                grace_period_secs: grace_secs,
                extra_args: vec![],
            },
        )
    }

    #[tokio::test]
    async fn spawn_failure_is_invocation_error() {
        let agent = agent_for(std::path::Path::new("/nonexistent/agent-binary"), 5, 1);
        let cancel = CancellationToken::new();
        let err = agent
            .execute(&cancel, AgentRequest::prompt("hello"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Invocation);
    }

    #[tokio::test]
    async fn result_frame_wins_over_accumulated_text() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
echo '{"type":"result","subtype":"success","result":"final answer","is_error":false,"usage":{"input_tokens":10,"output_tokens":5}}'"#,
        );
        let agent = agent_for(&cli, 5, 1);
        let cancel = CancellationToken::new();

        let response = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap();
        assert_eq!(response.text, "final answer");
        assert_eq!(response.tokens_in, 10);
        assert_eq!(response.tokens_out, 5);
        assert_eq!(response.raw_frames.len(), 2);
    }

    #[tokio::test]
    async fn plain_text_output_is_accumulated_on_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, "echo working on it\necho done");
        let agent = agent_for(&cli, 5, 1);
        let cancel = CancellationToken::new();

        let response = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap();
        assert!(response.text.contains("working on it"));
        assert!(response.text.contains("done"));
    }

    #[tokio::test]
    async fn error_result_frame_is_invocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            &dir,
            r#"echo '{"type":"result","subtype":"error","result":"rate limited","is_error":true}'"#,
        );
        let agent = agent_for(&cli, 5, 1);
        let cancel = CancellationToken::new();

        let err = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Invocation);
        assert!(err.message.contains("rate limited"));
    }

    #[tokio::test]
    async fn nonzero_exit_without_result_is_invocation_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, "echo oops >&2\nexit 3");
        let agent = agent_for(&cli, 5, 1);
        let cancel = CancellationToken::new();

        let err = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Invocation);
        assert!(err.message.contains("oops"));
    }

    #[tokio::test]
    async fn silent_process_hits_idle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, "sleep 30");
        let agent = agent_for(&cli, 1, 1);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let err = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Idle);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn completion_marker_then_hang_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        // Emits the result frame, then hangs instead of exiting.
        let cli = fake_cli(
            &dir,
            r#"echo '{"type":"result","subtype":"success","result":"kept","is_error":false}'
sleep 30"#,
        );
        let agent = agent_for(&cli, 10, 1);
        let cancel = CancellationToken::new();

        let start = Instant::now();
        let response = agent.execute(&cancel, AgentRequest::prompt("go")).await.unwrap();
        assert_eq!(response.text, "kept");
        // Bounded by the grace period, not the 30s sleep or idle window.
        assert!(start.elapsed() < Duration::from_secs(8));
    }

    #[tokio::test]
    async fn cancellation_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(&dir, "sleep 30");
        let agent = agent_for(&cli, 60, 1);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        let handle =
            tokio::spawn(async move { agent.execute(&cancel_clone, AgentRequest::prompt("x")).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, crate::errors::AdapterErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn observations_flow_through_events_channel() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Edit","input":{},"id":"1"}]}}'
echo '{"type":"result","subtype":"success","result":"ok","is_error":false}'"#,
        );
        let agent = agent_for(&cli, 5, 1);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        agent
            .execute(&cancel, AgentRequest::prompt("x").with_events(tx))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(observation) = rx.try_recv() {
            kinds.push(observation.kind);
        }
        assert_eq!(
            kinds,
            vec![
                crate::model::AgentEventKind::ToolUse,
                crate::model::AgentEventKind::Completed
            ]
        );
    }
}
