//! One turn: the model/tool round trip on a single thread.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Orchestrator;
use crate::agent::{Agent, ModelRequest, ModelResponse};
use crate::citation::{render_block, CitationEntry, CitationKind};
use crate::error::SwarmError;
use crate::thread::{Thread, ThreadKey};
use crate::types::{Message, ToolCall};
use crate::util::timeout::cancellable;

/// Where a turn is in its round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnState {
    AwaitingModel,
    AwaitingToolResults(Vec<ToolCall>),
    Done(String),
}

/// Result of a completed turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn_id: Uuid,
    pub thread: ThreadKey,
    pub answer: String,
    /// Every message the turn appended, in production order.
    pub produced: Vec<Message>,
    pub tool_rounds: usize,
}

struct TurnLog<'t> {
    thread: &'t Thread,
    produced: Vec<Message>,
}

impl TurnLog<'_> {
    async fn push(&mut self, message: Message) {
        self.thread.append(message.clone()).await;
        self.produced.push(message);
    }

    /// Close out calls the turn is abandoning so the history never ends
    /// in tool calls without results.
    async fn answer_unresolved(&mut self, calls: &[ToolCall], error: &SwarmError) {
        for call in calls {
            self.push(Message::tool_result(&call.id, format!("Error: {error}"), true))
                .await;
        }
    }
}

impl Orchestrator {
    /// Run a turn on `(sender, recipient)`. `chain` holds the threads of
    /// enclosing turns so a delegation cycle fails instead of deadlocking
    /// on a turn lock already held further up.
    pub(super) fn run_turn<'a>(
        &'a self,
        sender: String,
        recipient: String,
        message: Message,
        cancel: &'a CancellationToken,
        chain: Vec<ThreadKey>,
    ) -> BoxFuture<'a, Result<TurnOutcome, SwarmError>> {
        Box::pin(async move {
            let agent = self.agent(&recipient).cloned().ok_or_else(|| {
                SwarmError::InvalidArgument(format!("unknown agent '{recipient}'"))
            })?;
            let key = ThreadKey::new(&sender, &recipient);
            if chain.contains(&key) {
                return Err(SwarmError::InvalidState(format!(
                    "cyclic delegation through thread {key}"
                )));
            }

            let thread = self.threads.get_or_create(&sender, &recipient).await;
            let _turn = if chain.is_empty() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(SwarmError::Cancelled(format!("waiting for thread {key}")));
                    }
                    guard = thread.begin_turn() => guard,
                }
            } else {
                // Nested turns never wait: two top-level turns delegating in
                // opposite directions would each hold the lock the other needs.
                thread.try_begin_turn().ok_or_else(|| {
                    SwarmError::InvalidState(format!("thread {key} is busy with another turn"))
                })?
            };

            let turn_id = Uuid::new_v4();
            tracing::debug!(%turn_id, thread = %key, "turn started");

            let mut chain = chain;
            chain.push(key.clone());
            let mut log = TurnLog {
                thread: &thread,
                produced: Vec::new(),
            };
            let result = self.drive(&agent, &mut log, message, cancel, &chain).await;
            self.persist(&thread).await;

            match result {
                Ok((answer, tool_rounds)) => {
                    tracing::debug!(%turn_id, thread = %key, tool_rounds, "turn finished");
                    Ok(TurnOutcome {
                        turn_id,
                        thread: key,
                        answer,
                        produced: log.produced,
                        tool_rounds,
                    })
                }
                Err(e) => {
                    tracing::warn!(%turn_id, thread = %key, error = %e, "turn failed");
                    Err(e)
                }
            }
        })
    }

    async fn drive(
        &self,
        agent: &Arc<Agent>,
        log: &mut TurnLog<'_>,
        message: Message,
        cancel: &CancellationToken,
        chain: &[ThreadKey],
    ) -> Result<(String, usize), SwarmError> {
        log.push(message).await;

        let mut rounds = 0usize;
        let mut state = TurnState::AwaitingModel;
        loop {
            state = match state {
                TurnState::AwaitingModel => {
                    let response = self.model_phase(agent, log.thread, cancel).await?;
                    let next = if response.is_final() {
                        TurnState::Done(response.content.clone())
                    } else {
                        TurnState::AwaitingToolResults(response.tool_calls.clone())
                    };
                    for message in response_messages(agent, response) {
                        log.push(message).await;
                    }
                    next
                }
                TurnState::AwaitingToolResults(calls) => {
                    rounds += 1;
                    if rounds > agent.max_tool_rounds() {
                        let e = SwarmError::InvalidState(format!(
                            "agent '{}' exceeded {} tool rounds",
                            agent.name(),
                            agent.max_tool_rounds()
                        ));
                        log.answer_unresolved(&calls, &e).await;
                        return Err(e);
                    }
                    for (position, call) in calls.iter().enumerate() {
                        match self.tool_phase(agent, call, cancel, chain).await {
                            Ok(result) => log.push(result).await,
                            Err(e) => {
                                log.answer_unresolved(&calls[position..], &e).await;
                                return Err(e);
                            }
                        }
                    }
                    TurnState::AwaitingModel
                }
                TurnState::Done(answer) => return Ok((answer, rounds)),
            };
        }
    }

    async fn model_phase(
        &self,
        agent: &Agent,
        thread: &Thread,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, SwarmError> {
        let request = ModelRequest {
            agent: agent.name().to_string(),
            instructions: agent.system_prompt(),
            messages: thread.history().await,
            tools: self.tool_definitions(agent),
            files: agent.files().to_vec(),
        };

        let response = cancellable(
            cancel,
            self.model_timeout,
            "model call",
            self.model.respond(&request),
        )
        .await;
        match response {
            Ok(response) => Ok(response),
            Err(e @ (SwarmError::Cancelled(_) | SwarmError::ModelService(_))) => Err(e),
            Err(e) => Err(SwarmError::ModelService(e.to_string())),
        }
    }
}

/// Messages recorded for one model response: search hits first (they were
/// gathered before the answer was written), then the answer, then its
/// direct file citations.
fn response_messages(agent: &Agent, response: ModelResponse) -> Vec<Message> {
    let display_name = |file_id: &str, reported: Option<String>| {
        reported
            .filter(|name| !name.is_empty())
            .or_else(|| agent.file_name(file_id).map(str::to_string))
            .unwrap_or_else(|| file_id.to_string())
    };

    let mut messages = Vec::new();

    let hits: Vec<CitationEntry> = response
        .search_hits
        .into_iter()
        .enumerate()
        .map(|(position, hit)| {
            let name = display_name(&hit.file_id, hit.filename);
            let mut entry = CitationEntry::new(hit.file_id, name, position as u64);
            if let Some(text) = hit.text {
                entry = entry.with_text(text);
            }
            if let Some(id) = hit.tool_call_id {
                entry = entry.with_tool_call_id(id);
            }
            entry
        })
        .collect();
    if !hits.is_empty() {
        messages.push(
            Message::assistant(render_block(CitationKind::SearchResultCitation, &hits))
                .with_name(agent.name()),
        );
    }

    let answer = if response.tool_calls.is_empty() {
        Message::assistant(response.content)
    } else {
        Message::assistant_with_tool_calls(response.content, response.tool_calls)
    };
    messages.push(answer.with_name(agent.name()));

    let direct: Vec<CitationEntry> = response
        .file_annotations
        .into_iter()
        .map(|annotation| {
            let name = display_name(&annotation.file_id, annotation.filename);
            CitationEntry::new(annotation.file_id, name, annotation.index)
        })
        .collect();
    if !direct.is_empty() {
        messages.push(
            Message::assistant(render_block(
                CitationKind::DirectAttachmentCitation,
                &direct,
            ))
            .with_name(agent.name()),
        );
    }

    messages
}
