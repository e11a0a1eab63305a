//! Test support: an in-process `Agent` with scripted responses.
//!
//! Used by unit and integration tests to drive the full pipeline without
//! spawning subprocesses. Not compiled out of the crate because the
//! integration tests in `tests/` need it; production code never references
//! this module.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::agents::{Agent, AgentCapabilities, AgentRequest, AgentResponse, Observation};
use crate::config::AgentPhase;
use crate::errors::{AdapterError, AdapterErrorKind};
use crate::model::AgentEventKind;

enum Outcome {
    Ok(String),
    Err(AdapterErrorKind, String),
}

/// An agent that replays canned outcomes in order, falling back to a default
/// response once the script is exhausted.
pub struct ScriptedAgent {
    name: String,
    phases: Vec<AgentPhase>,
    script: Mutex<VecDeque<Outcome>>,
    default_response: String,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phases: vec![
                AgentPhase::Refine,
                AgentPhase::Analyze,
                AgentPhase::Moderate,
                AgentPhase::Synthesize,
                AgentPhase::Plan,
                AgentPhase::Execute,
            ],
            script: Mutex::new(VecDeque::new()),
            default_response: "ok".to_string(),
            delay: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_phases(mut self, phases: Vec<AgentPhase>) -> Self {
        self.phases = phases;
        self
    }

    /// Set the response returned when the script queue is empty.
    pub fn with_response(mut self, text: impl Into<String>) -> Self {
        self.default_response = text.into();
        self
    }

    /// Simulate slow agents.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue one successful response.
    pub fn push_response(&self, text: impl Into<String>) {
        self.lock_script().push_back(Outcome::Ok(text.into()));
    }

    /// Queue one failure.
    pub fn push_failure(&self, kind: AdapterErrorKind, message: impl Into<String>) {
        self.lock_script().push_back(Outcome::Err(kind, message.into()));
    }

    /// Builder form of `push_response`.
    pub fn then_response(self, text: impl Into<String>) -> Self {
        self.push_response(text);
        self
    }

    /// Builder form of `push_failure`.
    pub fn then_failure(self, kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        self.push_failure(kind, message);
        self
    }

    /// Every prompt this agent has received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        match self.prompts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.prompts().len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Outcome>> {
        match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> AgentCapabilities {
        AgentCapabilities::from_phases(&self.phases)
    }

    async fn ping(&self, _cancel: &CancellationToken) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: AgentRequest,
    ) -> Result<AgentResponse, AdapterError> {
        match self.prompts.lock() {
            Ok(mut guard) => guard.push(request.prompt.clone()),
            Err(poisoned) => poisoned.into_inner().push(request.prompt.clone()),
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdapterError::cancelled(&self.name)),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(AdapterError::cancelled(&self.name));
        }

        let outcome = self.lock_script().pop_front();
        let text = match outcome {
            Some(Outcome::Ok(text)) => text,
            Some(Outcome::Err(kind, message)) => {
                return Err(AdapterError::new(kind, &self.name, message));
            }
            None => self.default_response.clone(),
        };

        if let Some(ref tx) = request.events {
            let _ = tx.send(Observation {
                kind: AgentEventKind::Started,
                payload: json!({}),
            });
            let _ = tx.send(Observation {
                kind: AgentEventKind::Chunk,
                payload: json!({ "text": text }),
            });
            let _ = tx.send(Observation {
                kind: AgentEventKind::Completed,
                payload: json!({ "text": text }),
            });
        }

        Ok(AgentResponse {
            text,
            tokens_in: 100,
            tokens_out: 50,
            duration: self.delay.unwrap_or(Duration::from_millis(1)),
            raw_frames: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn scripted_outcomes_replay_in_order() {
        let agent = ScriptedAgent::new("fake")
            .then_failure(AdapterErrorKind::Timeout, "slow")
            .then_response("second try");
        let cancel = CancellationToken::new();

        let err = agent
            .execute(&cancel, AgentRequest::prompt("a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Timeout);

        let ok = agent.execute(&cancel, AgentRequest::prompt("b")).await.unwrap();
        assert_eq!(ok.text, "second try");

        // Script exhausted: default response.
        let fallback = agent.execute(&cancel, AgentRequest::prompt("c")).await.unwrap();
        assert_eq!(fallback.text, "ok");

        assert_eq!(agent.prompts(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancellation_interrupts_delay() {
        let agent = Arc::new(ScriptedAgent::new("slow").with_delay(Duration::from_secs(30)));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let agent_clone = Arc::clone(&agent);

        let handle = tokio::spawn(async move {
            agent_clone
                .execute(&cancel_clone, AgentRequest::prompt("x"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err.kind, AdapterErrorKind::Cancelled);
    }
}
