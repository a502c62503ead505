//! Handlers for the `tools`, `call` and `citations` commands.

use std::path::Path;

use crate::citation;
use crate::config::SwarmConfig;
use crate::mcp::{CollisionPolicy, ToolServerRegistry};
use crate::thread::{FileThreadPersistence, ThreadKey, ThreadPersistence};

type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Load configuration from an explicit path or the environment.
pub fn load_config(path: Option<&Path>) -> Result<SwarmConfig, crate::error::SwarmError> {
    match path {
        Some(path) => SwarmConfig::load(path),
        None => SwarmConfig::from_env(),
    }
}

async fn start_registry(
    config: &SwarmConfig,
    policy: CollisionPolicy,
) -> Result<ToolServerRegistry, crate::error::SwarmError> {
    let registry = ToolServerRegistry::from_config(config, policy)?;
    let report = registry.start().await;
    for (server, error) in &report.failed {
        eprintln!("warning: server '{server}' unavailable: {error}");
    }
    Ok(registry)
}

/// Handle `swarmkit tools`.
pub async fn handle_tools(config: &SwarmConfig, policy: CollisionPolicy) -> CliResult {
    if config.servers.is_empty() {
        println!("No tool servers configured.");
        return Ok(());
    }
    let registry = start_registry(config, policy).await?;
    let tools = registry.list_tools();
    if tools.is_empty() {
        println!("No tools available.");
    }
    for tool in &tools {
        if tool.description.is_empty() {
            println!("{}  [{}]", tool.exposed_name, tool.server);
        } else {
            println!("{}  [{}]  {}", tool.exposed_name, tool.server, tool.description);
        }
    }
    report_stop_errors(registry.stop_all().await);
    Ok(())
}

/// Handle `swarmkit call <tool>`.
pub async fn handle_call(
    config: &SwarmConfig,
    policy: CollisionPolicy,
    tool: &str,
    raw_args: &str,
) -> CliResult {
    let arguments: serde_json::Value = serde_json::from_str(raw_args)
        .map_err(|e| format!("--args must be a JSON object: {e}"))?;
    let registry = start_registry(config, policy).await?;
    let result = registry.invoke(tool, arguments).await;
    report_stop_errors(registry.stop_all().await);
    println!("{}", result?.to_text());
    Ok(())
}

/// Handle `swarmkit citations [dir]`.
pub fn handle_citations(dir: Option<&Path>, thread: Option<&str>) -> CliResult {
    let persistence = match dir {
        Some(dir) => FileThreadPersistence::new(dir),
        None => FileThreadPersistence::new_default(),
    };
    let filter = thread
        .map(|raw| {
            ThreadKey::parse(raw).ok_or_else(|| format!("invalid thread '{raw}', expected sender->recipient"))
        })
        .transpose()?;

    let snapshot = persistence.load()?;
    let mut printed = 0usize;
    for record in &snapshot.threads {
        if filter.as_ref().is_some_and(|key| key != &record.key) {
            continue;
        }
        for found in citation::extract(&record.messages) {
            printed += 1;
            println!(
                "{}\t{}\t{}\t{}\t{}",
                record.key,
                found.kind,
                found.source,
                found.name,
                found.index
            );
        }
    }
    if printed == 0 {
        println!("No citations found in {}.", persistence.dir().display());
    }
    Ok(())
}

fn report_stop_errors(errors: Vec<(String, crate::error::SwarmError)>) {
    for (server, error) in errors {
        tracing::warn!(server = %server, error = %error, "tool server did not stop cleanly");
    }
}
