//! Multi-server tool registry with deterministic routing.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use futures::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::client::{ConnectionState, ToolCallResult, ToolServerClient};
use super::schema::ToolSchema;
use crate::config::SwarmConfig;
use crate::error::SwarmError;

/// How to expose a tool name offered by more than one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollisionPolicy {
    /// The server registered first keeps the name; later ones are shadowed.
    #[default]
    FirstRegisteredWins,
    /// Resolving a shared name fails with an ambiguity error.
    Reject,
    /// Expose each tool as `<server>__<tool>`.
    NamespaceServerAndTool,
}

/// Where an exposed tool name routes to.
#[derive(Debug, Clone)]
struct ToolRoute {
    server: String,
    upstream_tool_name: String,
    client: Weak<ToolServerClient>,
    generation: u64,
}

impl ToolRoute {
    /// The owning client, if it is still running the session this route
    /// was built from.
    fn live_client(&self) -> Option<Arc<ToolServerClient>> {
        let client = self.client.upgrade()?;
        (client.is_initialized() && client.generation() == self.generation).then_some(client)
    }
}

/// A tool as exposed by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub exposed_name: String,
    pub server: String,
    pub upstream_tool_name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Read-only view of one registered server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub instructions: Option<String>,
}

impl ServerStatus {
    fn of(client: &ToolServerClient) -> Self {
        Self {
            name: client.name().to_string(),
            state: client.connection_state(),
            tool_count: client.list_tools().len(),
            instructions: client.instructions(),
        }
    }
}

/// Outcome of starting every registered server.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, SwarmError)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Aggregates several tool servers behind one name space.
pub struct ToolServerRegistry {
    servers: Vec<Arc<ToolServerClient>>,
    server_index_by_name: HashMap<String, usize>,
    routes: RwLock<HashMap<String, Vec<ToolRoute>>>,
    tools: RwLock<Vec<RegisteredTool>>,
    policy: CollisionPolicy,
}

impl ToolServerRegistry {
    pub fn new(servers: Vec<ToolServerClient>) -> Result<Self, SwarmError> {
        Self::with_policy(servers, CollisionPolicy::default())
    }

    pub fn with_policy(
        servers: Vec<ToolServerClient>,
        policy: CollisionPolicy,
    ) -> Result<Self, SwarmError> {
        let mut entries = Vec::with_capacity(servers.len());
        let mut index = HashMap::with_capacity(servers.len());

        for (position, server) in servers.into_iter().enumerate() {
            let name = server.name().trim().to_owned();
            if name.is_empty() {
                return Err(SwarmError::Configuration(
                    "tool server name must not be empty".into(),
                ));
            }
            if index.insert(name.clone(), position).is_some() {
                return Err(SwarmError::Configuration(format!(
                    "duplicate tool server name '{name}'"
                )));
            }
            entries.push(Arc::new(server));
        }

        Ok(Self {
            servers: entries,
            server_index_by_name: index,
            routes: RwLock::new(HashMap::new()),
            tools: RwLock::new(Vec::new()),
            policy,
        })
    }

    /// Build one client per configured server, in file order.
    pub fn from_config(config: &SwarmConfig, policy: CollisionPolicy) -> Result<Self, SwarmError> {
        let clients = config
            .servers
            .iter()
            .map(|server| {
                ToolServerClient::from_config(server.clone(), &config.timeouts, &config.reconnect)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::with_policy(clients, policy)
    }

    pub fn policy(&self) -> CollisionPolicy {
        self.policy
    }

    /// Status of every server, in registration order.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.servers.iter().map(|server| ServerStatus::of(server)).collect()
    }

    pub fn status(&self, name: &str) -> Option<ServerStatus> {
        self.server(name).map(|server| ServerStatus::of(server))
    }

    fn server(&self, name: &str) -> Option<&Arc<ToolServerClient>> {
        self.server_index_by_name
            .get(name)
            .map(|&index| &self.servers[index])
    }

    /// Start every server concurrently. A server that fails is reported and
    /// left out of the catalog; the others stay usable.
    pub async fn start(&self) -> StartReport {
        self.start_with_cancel(&CancellationToken::new()).await
    }

    pub async fn start_with_cancel(&self, cancel: &CancellationToken) -> StartReport {
        let outcomes = join_all(
            self.servers
                .iter()
                .map(|server| server.start_with_cancel(cancel)),
        )
        .await;

        let mut report = StartReport::default();
        for (server, outcome) in self.servers.iter().zip(outcomes) {
            match outcome {
                Ok(()) => report.started.push(server.name().to_string()),
                Err(e) => report.failed.push((server.name().to_string(), e)),
            }
        }
        self.refresh();
        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            tools = self.list_tools().len(),
            "tool registry started"
        );
        report
    }

    /// Rebuild routes from the servers' current catalogs.
    pub fn refresh(&self) {
        let mut routes: HashMap<String, Vec<ToolRoute>> = HashMap::new();
        let mut tools = Vec::new();

        for server in &self.servers {
            let generation = server.generation();
            for tool in server.list_tools() {
                let exposed_name = self.exposed_name(server.name(), &tool.name);
                let candidates = routes.entry(exposed_name.clone()).or_default();
                if let Some(first) = candidates.first() {
                    match self.policy {
                        CollisionPolicy::FirstRegisteredWins => tracing::warn!(
                            tool = %exposed_name,
                            kept = %first.server,
                            shadowed = %server.name(),
                            "tool name exposed by several servers; first registration wins"
                        ),
                        _ => tracing::warn!(
                            tool = %exposed_name,
                            servers = %format!("{}, {}", first.server, server.name()),
                            "ambiguous tool name"
                        ),
                    }
                } else {
                    tools.push(registered_tool(exposed_name.clone(), server.name(), &tool));
                }
                candidates.push(ToolRoute {
                    server: server.name().to_string(),
                    upstream_tool_name: tool.name,
                    client: Arc::downgrade(server),
                    generation,
                });
            }
        }

        *self.routes.write().unwrap_or_else(PoisonError::into_inner) = routes;
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = tools;
    }

    /// Every exposed tool, one entry per name, in registration order.
    pub fn list_tools(&self) -> Vec<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|tool| self.resolve_route(&tool.exposed_name).is_ok())
            .cloned()
            .collect()
    }

    fn resolve_route(&self, exposed_name: &str) -> Result<(Arc<ToolServerClient>, String), SwarmError> {
        let routes = self.routes.read().unwrap_or_else(PoisonError::into_inner);
        let live = routes
            .get(exposed_name)
            .into_iter()
            .flatten()
            .filter_map(|route| {
                route
                    .live_client()
                    .map(|client| (client, route.upstream_tool_name.clone()))
            })
            .collect::<Vec<_>>();

        if live.len() > 1 && self.policy == CollisionPolicy::Reject {
            return Err(SwarmError::AmbiguousTool {
                tool: exposed_name.to_string(),
                servers: live.iter().map(|(c, _)| c.name().to_string()).collect(),
            });
        }
        live.into_iter()
            .next()
            .ok_or_else(|| SwarmError::ToolNotFound(exposed_name.to_string()))
    }

    /// Name of the server a tool call would be routed to.
    pub fn resolve(&self, exposed_name: &str) -> Result<String, SwarmError> {
        self.resolve_route(exposed_name)
            .map(|(client, _)| client.name().to_string())
    }

    pub async fn invoke(&self, exposed_name: &str, arguments: Value) -> Result<ToolCallResult, SwarmError> {
        self.invoke_with_cancel(exposed_name, arguments, &CancellationToken::new())
            .await
    }

    pub async fn invoke_with_cancel(
        &self,
        exposed_name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, SwarmError> {
        self.resync(cancel).await;
        let (client, upstream) = self.resolve_route(exposed_name)?;
        client
            .invoke_with_cancel(&upstream, arguments, cancel)
            .await
    }

    /// Re-handshake servers whose transport moved to a new session and
    /// rebuild routes from their fresh catalogs. A server that fails stays
    /// out of the catalog.
    pub async fn resync(&self, cancel: &CancellationToken) {
        let replaced: Vec<_> = self
            .servers
            .iter()
            .filter(|server| server.session_reset())
            .collect();
        if replaced.is_empty() {
            return;
        }
        for server in replaced {
            if let Err(e) = server.resync(cancel).await {
                tracing::warn!(server = %server.name(), error = %e, "tool server lost after session reset");
            }
        }
        self.refresh();
    }

    /// Stop one server and drop its tools from the catalog.
    pub async fn stop_server(&self, name: &str) -> Result<(), SwarmError> {
        let server = self.server(name).ok_or_else(|| {
            SwarmError::InvalidArgument(format!("unknown tool server '{name}'"))
        })?;
        let result = server.stop().await;
        self.refresh();
        result
    }

    /// Handshake instructions from every running server, in registration order.
    pub fn instructions(&self) -> Vec<(String, String)> {
        self.servers
            .iter()
            .filter_map(|server| {
                server
                    .instructions()
                    .map(|text| (server.name().to_string(), text))
            })
            .collect()
    }

    /// Stop every server. Failures are collected, not raised, so one stuck
    /// server cannot keep the others running.
    pub async fn stop_all(&self) -> Vec<(String, SwarmError)> {
        let outcomes = join_all(self.servers.iter().map(|server| server.stop())).await;
        self.refresh();

        self.servers
            .iter()
            .zip(outcomes)
            .filter_map(|(server, outcome)| {
                outcome.err().map(|e| {
                    tracing::warn!(server = %server.name(), error = %e, "tool server did not stop cleanly");
                    (server.name().to_string(), e)
                })
            })
            .collect()
    }

    fn exposed_name(&self, server: &str, tool: &str) -> String {
        match self.policy {
            CollisionPolicy::NamespaceServerAndTool => format!("{server}__{tool}"),
            CollisionPolicy::FirstRegisteredWins | CollisionPolicy::Reject => tool.to_string(),
        }
    }
}

fn registered_tool(exposed_name: String, server: &str, tool: &ToolSchema) -> RegisteredTool {
    RegisteredTool {
        exposed_name,
        server: server.to_string(),
        upstream_tool_name: tool.name.clone(),
        description: tool.description.clone().unwrap_or_default(),
        input_schema: tool.input_schema.clone(),
    }
}
