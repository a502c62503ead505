//! End-to-end turns through the orchestrator with a scripted model.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{http_server_config, mock_tool_server, swarm_config, ScriptedModel};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use swarmkit::agent::{Agent, ModelRequest, ModelResponse, ModelService};
use swarmkit::citation::{self, CitationKind};
use swarmkit::error::SwarmError;
use swarmkit::mcp::{CollisionPolicy, ToolServerRegistry};
use swarmkit::orchestrator::Orchestrator;
use swarmkit::thread::{FileThreadPersistence, ThreadKey, ThreadStore};
use swarmkit::types::{FileRef, Message, Role};

fn roles(messages: &[Message]) -> Vec<Role> {
    messages.iter().map(|m| m.role).collect()
}

async fn search_registry() -> (wiremock::MockServer, Arc<ToolServerRegistry>) {
    search_registry_with(&[("search", "Search docs"), ("explode", "Always fails")]).await
}

async fn search_registry_with(
    tools: &'static [(&'static str, &'static str)],
) -> (wiremock::MockServer, Arc<ToolServerRegistry>) {
    let server = mock_tool_server("docs", tools).await;
    let config = swarm_config(vec![http_server_config("docs", &server)]);
    let registry = ToolServerRegistry::from_config(&config, CollisionPolicy::default()).unwrap();
    assert!(registry.start().await.all_started());
    (server, Arc::new(registry))
}

#[tokio::test]
async fn plain_answer_is_recorded_on_the_user_thread() {
    let model = Arc::new(ScriptedModel::new().with_response(ModelResponse::text("Hello!")));
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model.clone())
        .with_agent(Agent::builder().name("Greeter").instructions("Be brief.").build())
        .unwrap();

    let answer = orchestrator.route("Hi", "Greeter").await.unwrap();
    assert_eq!(answer, "Hello!");

    let history = threads.history(&ThreadKey::new("user", "Greeter")).await.unwrap();
    assert_eq!(roles(&history), vec![Role::User, Role::Assistant]);
    assert_eq!(history[1].name.as_deref(), Some("Greeter"));

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].instructions.as_deref(), Some("Be brief."));
    assert_eq!(requests[0].messages.len(), 1);
}

#[tokio::test]
async fn tool_round_trip_appends_in_production_order() {
    let (_server, registry) = search_registry().await;
    let model = Arc::new(
        ScriptedModel::new()
            .with_response(
                ModelResponse::text("").with_tool_call("call-1", "search", json!({"query": "rust"})),
            )
            .with_response(ModelResponse::text("Found it.")),
    );
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), model.clone())
        .with_agent(Agent::builder().name("Researcher").tools(registry).build())
        .unwrap();

    let outcome = orchestrator
        .route_message(Message::user("look up rust"), "Researcher", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.answer, "Found it.");
    assert_eq!(outcome.tool_rounds, 1);
    assert_eq!(
        roles(&outcome.produced),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
    let tool_message = &outcome.produced[2];
    assert_eq!(tool_message.metadata.tool_call_id.as_deref(), Some("call-1"));
    assert!(!tool_message.is_error());
    assert_eq!(tool_message.content, r#"docs:search:{"query":"rust"}"#);

    let requests = model.requests();
    let offered: Vec<_> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(offered, vec!["search", "explode"]);
    assert_eq!(requests[1].messages.len(), 3);
    assert_eq!(
        requests[0].instructions.as_deref(),
        Some("Tool server notes:\n[docs] docs answers searches")
    );
}

#[tokio::test]
async fn tool_failures_become_tool_messages() {
    let (_server, registry) = search_registry().await;
    let model = Arc::new(
        ScriptedModel::new()
            .with_response(
                ModelResponse::text("")
                    .with_tool_call("call-1", "explode", json!({}))
                    .with_tool_call("call-2", "missing", json!({})),
            )
            .with_response(ModelResponse::text("Both tools failed.")),
    );
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), model)
        .with_agent(Agent::builder().name("Researcher").tools(registry).build())
        .unwrap();

    let outcome = orchestrator
        .route_message(Message::user("go"), "Researcher", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.answer, "Both tools failed.");
    let tool_messages: Vec<_> = outcome
        .produced
        .iter()
        .filter(|m| m.role == Role::Tool)
        .collect();
    assert_eq!(tool_messages.len(), 2);
    assert!(tool_messages.iter().all(|m| m.is_error()));
    assert_eq!(tool_messages[0].content, "Error: Tool execution error: explode: boom");
    assert_eq!(tool_messages[1].content, "Error: Tool not found: missing");
}

#[tokio::test]
async fn model_failure_is_fatal_for_the_turn() {
    let model = Arc::new(ScriptedModel::new().with_failure(SwarmError::ModelService("quota".into())));
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model)
        .with_agent(Agent::builder().name("A").build())
        .unwrap();

    let err = orchestrator.route("hi", "A").await.expect_err("model is down");
    assert!(matches!(err, SwarmError::ModelService(message) if message == "quota"));

    let history = threads.history(&ThreadKey::new("user", "A")).await.unwrap();
    assert_eq!(roles(&history), vec![Role::User]);
}

struct SlowModel;

#[async_trait]
impl ModelService for SlowModel {
    async fn respond(&self, _request: &ModelRequest) -> Result<ModelResponse, SwarmError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ModelResponse::text("late"))
    }
}

#[tokio::test(start_paused = true)]
async fn model_timeout_is_reported_as_model_failure() {
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), Arc::new(SlowModel))
        .with_agent(Agent::builder().name("A").build())
        .unwrap()
        .with_model_timeout(Duration::from_millis(50));

    let err = orchestrator.route("hi", "A").await.expect_err("times out");
    assert!(matches!(err, SwarmError::ModelService(message) if message.contains("50ms")));
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_the_model_call() {
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), Arc::new(SlowModel))
        .with_agent(Agent::builder().name("A").build())
        .unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let err = orchestrator
        .route_message(Message::user("hi"), "A", &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, SwarmError::Cancelled(_)));
}

#[tokio::test]
async fn unknown_recipient_is_rejected() {
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), Arc::new(ScriptedModel::new()));
    let err = orchestrator.route("hi", "Nobody").await.expect_err("no agent");
    assert!(matches!(err, SwarmError::InvalidArgument(_)));
    assert!(orchestrator.threads().is_empty().await);
}

#[tokio::test]
async fn delegation_runs_a_nested_turn_on_the_agent_pair() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_response(ModelResponse::text("").with_tool_call(
                "call-1",
                "send_message_to_Writer",
                json!({"message": "Draft a summary"}),
            ))
            .with_response(ModelResponse::text("Here is the summary."))
            .with_response(ModelResponse::text("The writer says: Here is the summary.")),
    );
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model.clone())
        .with_agent(Agent::builder().name("Lead").build())
        .unwrap()
        .with_agent(
            Agent::builder()
                .name("Writer")
                .description("Writes summaries.")
                .build(),
        )
        .unwrap()
        .with_flow("Lead", "Writer")
        .unwrap();

    let answer = orchestrator.route("Summarize", "Lead").await.unwrap();
    assert_eq!(answer, "The writer says: Here is the summary.");

    let nested = threads.history(&ThreadKey::new("Lead", "Writer")).await.unwrap();
    assert_eq!(roles(&nested), vec![Role::User, Role::Assistant]);
    assert_eq!(nested[0].content, "Draft a summary");
    assert_eq!(nested[0].name.as_deref(), Some("Lead"));

    let outer = threads.history(&ThreadKey::new("user", "Lead")).await.unwrap();
    assert_eq!(outer[2].role, Role::Tool);
    assert_eq!(outer[2].content, "Here is the summary.");

    let requests = model.requests();
    assert_eq!(requests[1].agent, "Writer");
    let lead_tool = &requests[0].tools[0];
    assert_eq!(lead_tool.name, "send_message_to_Writer");
    assert_eq!(lead_tool.description, "Send a message to Writer. Writes summaries.");
    assert!(requests[1].tools.is_empty());
}

#[tokio::test]
async fn delegation_without_a_flow_is_a_tool_error() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_response(ModelResponse::text("").with_tool_call(
                "call-1",
                "send_message_to_Lead",
                json!({"message": "hello"}),
            ))
            .with_response(ModelResponse::text("could not reach Lead")),
    );
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), model)
        .with_agent(Agent::builder().name("Lead").build())
        .unwrap()
        .with_agent(Agent::builder().name("Writer").build())
        .unwrap()
        .with_flow("Lead", "Writer")
        .unwrap();

    let outcome = orchestrator
        .route_message(Message::user("go"), "Writer", &CancellationToken::new())
        .await
        .unwrap();
    let tool_message = &outcome.produced[2];
    assert!(tool_message.is_error());
    assert!(tool_message.content.contains("no communication flow from 'Writer' to 'Lead'"));
}

#[tokio::test]
async fn delegation_cycles_are_reported_instead_of_deadlocking() {
    let to_b = |id: &str| {
        ModelResponse::text("").with_tool_call(id, "send_message_to_B", json!({"message": "ping"}))
    };
    let model = Arc::new(
        ScriptedModel::new()
            // user -> A
            .with_response(to_b("a-1"))
            // A -> B
            .with_response(
                ModelResponse::text("").with_tool_call("b-1", "send_message_to_A", json!({"message": "pong"})),
            )
            // B -> A tries to re-enter A -> B
            .with_response(to_b("a-2"))
            .with_response(ModelResponse::text("A gives up"))
            .with_response(ModelResponse::text("B done"))
            .with_response(ModelResponse::text("all done")),
    );
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model.clone())
        .with_agent(Agent::builder().name("A").build())
        .unwrap()
        .with_agent(Agent::builder().name("B").build())
        .unwrap()
        .with_flow("A", "B")
        .unwrap()
        .with_flow("B", "A")
        .unwrap();

    let answer = orchestrator.route("start", "A").await.unwrap();
    assert_eq!(answer, "all done");
    assert_eq!(model.remaining(), 0);

    let inner = threads.history(&ThreadKey::new("B", "A")).await.unwrap();
    let cycle_error = inner.iter().find(|m| m.role == Role::Tool).unwrap();
    assert!(cycle_error.is_error());
    assert!(cycle_error.content.contains("cyclic delegation through thread A->B"));
}

#[tokio::test]
async fn tool_rounds_are_bounded() {
    let looping = || ModelResponse::text("").with_tool_call("c", "missing", json!({}));
    let model = Arc::new(ScriptedModel::new().with_response(looping()).with_response(looping()));
    let orchestrator = Orchestrator::new(Arc::new(ThreadStore::new()), model)
        .with_agent(Agent::builder().name("A").max_tool_rounds(1).build())
        .unwrap();

    let threads = orchestrator.threads().clone();

    let err = orchestrator.route("go", "A").await.expect_err("too many rounds");
    assert!(matches!(err, SwarmError::InvalidState(message) if message.contains("1 tool rounds")));

    let history = threads.history(&ThreadKey::new("user", "A")).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant, Role::Tool]
    );
    let last = history.last().unwrap();
    assert!(last.is_error());
    assert!(last.content.contains("exceeded 1 tool rounds"));
    assert_every_call_answered(&history);
}

fn assert_every_call_answered(history: &[Message]) {
    for call in history.iter().flat_map(|m| m.tool_calls()) {
        assert!(
            history
                .iter()
                .any(|m| m.metadata.tool_call_id.as_deref() == Some(call.id.as_str())),
            "tool call {} has no result",
            call.id
        );
    }
}

#[tokio::test]
async fn cancelled_tool_round_still_answers_every_call() {
    let (_server, registry) = search_registry_with(&[("stall", "Never answers"), ("search", "Search docs")]).await;
    let model = Arc::new(ScriptedModel::new().with_response(
        ModelResponse::text("")
            .with_tool_call("call-1", "stall", json!({}))
            .with_tool_call("call-2", "search", json!({"query": "later"})),
    ));
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model)
        .with_agent(Agent::builder().name("A").tools(registry).build())
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = orchestrator
        .route_message(Message::user("go"), "A", &cancel)
        .await
        .expect_err("cancelled mid-tool");
    assert!(matches!(err, SwarmError::Cancelled(_)));

    let history = threads.history(&ThreadKey::new("user", "A")).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::Tool, Role::Tool]
    );
    assert!(history[2..].iter().all(Message::is_error));
    assert_every_call_answered(&history);
}

/// Delegates back to the other agent whenever it is handed a new message.
struct Relay;

#[async_trait]
impl ModelService for Relay {
    async fn respond(&self, request: &ModelRequest) -> Result<ModelResponse, SwarmError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if request.messages.last().map(|m| m.role) != Some(Role::User) {
            return Ok(ModelResponse::text("done"));
        }
        let other = if request.agent == "A" { "B" } else { "A" };
        Ok(ModelResponse::text("").with_tool_call(
            format!("{}-call", request.agent),
            format!("send_message_to_{other}"),
            json!({"message": "go"}),
        ))
    }
}

#[tokio::test]
async fn opposite_delegations_from_concurrent_turns_complete() {
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), Arc::new(Relay))
        .with_agent(Agent::builder().name("A").build())
        .unwrap()
        .with_agent(Agent::builder().name("B").build())
        .unwrap()
        .with_flow("A", "B")
        .unwrap()
        .with_flow("B", "A")
        .unwrap();

    let (to_a, to_b) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(orchestrator.route("go", "A"), orchestrator.route("go", "B"))
    })
    .await
    .expect("turns must not wait on each other forever");
    assert_eq!(to_a.unwrap(), "done");
    assert_eq!(to_b.unwrap(), "done");

    for key in threads.keys().await {
        let history = threads.history(&key).await.unwrap();
        assert_eq!(history.last().map(|m| m.role), Some(Role::Assistant), "{key}");
        assert_every_call_answered(&history);
    }
}

#[tokio::test]
async fn model_provenance_is_recoverable_from_history() {
    let model = Arc::new(ScriptedModel::new().with_response(
        ModelResponse::text("The report covers Q3.").with_annotation("file-abc", 42),
    ));
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model.clone())
        .with_agent(
            Agent::builder()
                .name("DocAgent")
                .files(vec![FileRef::new("file-abc", "report.txt")])
                .build(),
        )
        .unwrap();

    let answer = orchestrator.route("What is in the report?", "DocAgent").await.unwrap();
    assert_eq!(answer, "The report covers Q3.");
    assert_eq!(model.requests()[0].files, vec![FileRef::new("file-abc", "report.txt")]);

    let history = threads.history(&ThreadKey::new("user", "DocAgent")).await.unwrap();
    let citations = citation::extract(&history);
    assert_eq!(citations.len(), 1);
    assert_eq!(citations[0].kind, CitationKind::DirectAttachmentCitation);
    assert_eq!(citations[0].source, "file-abc");
    assert_eq!(citations[0].name, "report.txt");
    assert_eq!(citations[0].index, 42);
}

#[tokio::test]
async fn concurrent_turns_on_one_thread_do_not_interleave() {
    let model = Arc::new(
        ScriptedModel::new()
            .with_response(ModelResponse::text("first"))
            .with_response(ModelResponse::text("second")),
    );
    let threads = Arc::new(ThreadStore::new());
    let orchestrator = Orchestrator::new(threads.clone(), model)
        .with_agent(Agent::builder().name("A").build())
        .unwrap();

    let (one, two) = tokio::join!(orchestrator.route("one", "A"), orchestrator.route("two", "A"));
    one.unwrap();
    two.unwrap();

    let history = threads.history(&ThreadKey::new("user", "A")).await.unwrap();
    assert_eq!(
        roles(&history),
        vec![Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn threads_are_persisted_after_each_turn_and_reloaded() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(FileThreadPersistence::new(dir.path()));

    let orchestrator = Orchestrator::new(
        Arc::new(ThreadStore::new()),
        Arc::new(ScriptedModel::new().with_response(ModelResponse::text("stored"))),
    )
    .with_agent(Agent::builder().name("A").build())
    .unwrap()
    .with_persistence(persistence.clone());
    orchestrator.route("remember this", "A").await.unwrap();

    let reloaded = Orchestrator::new(
        Arc::new(ThreadStore::new()),
        Arc::new(ScriptedModel::new().with_response(ModelResponse::text("again"))),
    )
    .with_agent(Agent::builder().name("A").build())
    .unwrap()
    .with_persistence(persistence);
    assert_eq!(reloaded.load_threads().await.unwrap(), 1);

    reloaded.route("and this", "A").await.unwrap();
    let history = reloaded
        .threads()
        .history(&ThreadKey::new("user", "A"))
        .await
        .unwrap();
    let contents: Vec<_> = history.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["remember this", "stored", "and this", "again"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_turn_is_still_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = Arc::new(FileThreadPersistence::new(dir.path()));
    let orchestrator = Orchestrator::new(
        Arc::new(ThreadStore::new()),
        Arc::new(ScriptedModel::new().with_failure(SwarmError::ModelService("down".into()))),
    )
    .with_agent(Agent::builder().name("A").build())
    .unwrap()
    .with_persistence(persistence.clone());

    orchestrator.route("hello?", "A").await.expect_err("model is down");

    let snapshot = swarmkit::thread::ThreadPersistence::load(persistence.as_ref()).unwrap();
    let record = snapshot.get(&ThreadKey::new("user", "A")).expect("thread saved");
    assert_eq!(roles(&record.messages), vec![Role::User]);
}
