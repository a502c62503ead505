//! Routes messages to agents and drives each turn to completion.

mod tool_phase;
mod turn;

pub use turn::{TurnOutcome, TurnState};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, ModelService};
use crate::error::SwarmError;
use crate::thread::{Thread, ThreadPersistence, ThreadStore, USER_SENDER};
use crate::types::Message;

/// Default bound on a single model call.
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(120);

/// Coordinates agents, their threads and the model service.
pub struct Orchestrator {
    threads: Arc<ThreadStore>,
    model: Arc<dyn ModelService>,
    agents: Vec<Arc<Agent>>,
    flows: Vec<(String, String)>,
    model_timeout: Duration,
    persistence: Option<Arc<dyn ThreadPersistence>>,
}

impl Orchestrator {
    pub fn new(threads: Arc<ThreadStore>, model: Arc<dyn ModelService>) -> Self {
        Self {
            threads,
            model,
            agents: Vec::new(),
            flows: Vec::new(),
            model_timeout: DEFAULT_MODEL_TIMEOUT,
            persistence: None,
        }
    }

    /// Register an agent. Names must be unique and may not be `user`.
    pub fn with_agent(mut self, agent: Agent) -> Result<Self, SwarmError> {
        let name = agent.name().trim();
        if name.is_empty() || name == USER_SENDER {
            return Err(SwarmError::Configuration(format!(
                "invalid agent name '{name}'"
            )));
        }
        if self.agent(name).is_some() {
            return Err(SwarmError::Configuration(format!(
                "duplicate agent name '{name}'"
            )));
        }
        self.agents.push(Arc::new(agent));
        Ok(self)
    }

    /// Allow `sender` to message `recipient` through a
    /// `send_message_to_<recipient>` tool. Flows are directional.
    pub fn with_flow(
        mut self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Result<Self, SwarmError> {
        let (sender, recipient) = (sender.into(), recipient.into());
        for name in [&sender, &recipient] {
            if self.agent(name).is_none() {
                return Err(SwarmError::Configuration(format!(
                    "flow names unknown agent '{name}'"
                )));
            }
        }
        if sender == recipient {
            return Err(SwarmError::Configuration(format!(
                "agent '{sender}' cannot message itself"
            )));
        }
        if !self.has_flow(&sender, &recipient) {
            self.flows.push((sender, recipient));
        }
        Ok(self)
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    /// Save each touched thread after every turn.
    pub fn with_persistence(mut self, persistence: Arc<dyn ThreadPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn threads(&self) -> &Arc<ThreadStore> {
        &self.threads
    }

    pub fn agent(&self, name: &str) -> Option<&Arc<Agent>> {
        self.agents.iter().find(|agent| agent.name() == name)
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<Agent>> {
        self.agents.iter()
    }

    pub fn has_flow(&self, sender: &str, recipient: &str) -> bool {
        self.flows
            .iter()
            .any(|(from, to)| from == sender && to == recipient)
    }

    /// Recipients `sender` may message, in registration order.
    pub fn recipients_of<'a>(&'a self, sender: &'a str) -> impl Iterator<Item = &'a Arc<Agent>> + 'a {
        self.agents
            .iter()
            .filter(move |agent| self.has_flow(sender, agent.name()))
    }

    /// Restore persisted threads into the store. Returns how many were loaded.
    pub async fn load_threads(&self) -> Result<usize, SwarmError> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let persistence = Arc::clone(persistence);
        let snapshot = tokio::task::spawn_blocking(move || persistence.load())
            .await
            .map_err(|e| SwarmError::InvalidState(format!("thread loading task failed: {e}")))??;
        Ok(self.threads.restore(snapshot).await)
    }

    /// Deliver a user message to `recipient` and return its final answer.
    pub async fn route(
        &self,
        message: impl Into<String>,
        recipient: &str,
    ) -> Result<String, SwarmError> {
        self.route_message(Message::user(message), recipient, &CancellationToken::new())
            .await
            .map(|outcome| outcome.answer)
    }

    /// Deliver a prepared user message, with cancellation.
    pub async fn route_message(
        &self,
        message: Message,
        recipient: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, SwarmError> {
        self.run_turn(USER_SENDER.to_string(), recipient.to_string(), message, cancel, Vec::new())
            .await
    }

    /// Deliver a message from one agent to another over a configured flow.
    pub async fn send(
        &self,
        sender: &str,
        recipient: &str,
        message: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, SwarmError> {
        if !self.has_flow(sender, recipient) {
            return Err(SwarmError::InvalidArgument(format!(
                "no communication flow from '{sender}' to '{recipient}'"
            )));
        }
        let message = Message::user(message).with_name(sender);
        self.run_turn(sender.to_string(), recipient.to_string(), message, cancel, Vec::new())
            .await
    }

    /// Stop every tool server used by any agent. Errors are collected.
    pub async fn shutdown(&self) -> Vec<(String, SwarmError)> {
        let mut seen: Vec<&Arc<crate::mcp::ToolServerRegistry>> = Vec::new();
        let mut errors = Vec::new();
        for registry in self.agents.iter().filter_map(|agent| agent.tools()) {
            if seen.iter().any(|known| Arc::ptr_eq(known, registry)) {
                continue;
            }
            seen.push(registry);
            errors.extend(registry.stop_all().await);
        }
        errors
    }

    async fn persist(&self, thread: &Thread) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let record = thread.record().await;
        let persistence = Arc::clone(persistence);
        let saved = tokio::task::spawn_blocking(move || persistence.save_thread(&record)).await;
        match saved {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(thread = %thread.key(), error = %e, "failed to persist thread");
            }
            Err(e) => {
                tracing::warn!(thread = %thread.key(), error = %e, "thread persistence task failed");
            }
        }
    }
}
