//! Tool-server client over a child process speaking line-delimited JSON-RPC.
#![cfg(unix)]

use std::path::Path;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use serde_json::json;
use swarmkit::config::{ShutdownPolicy, SwarmConfig, TimeoutConfig, ToolServerConfig, TransportConfig};
use swarmkit::error::SwarmError;
use swarmkit::mcp::{CollisionPolicy, ConnectionState, ToolServerClient, ToolServerRegistry};
use swarmkit::util::retry::RetryPolicy;

/// A tiny tool server: pings the client once, then answers the handshake and
/// `tools/call` for a single `echo` tool. The client's reply to the ping is
/// written to `$1`.
const SERVER_SCRIPT: &str = r#"
printf '{"jsonrpc":"2.0","id":"srv-1","method":"ping"}\n'
while read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *'"srv-1"'*) printf '%s\n' "$line" > "$1" ;;
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2025-03-26","capabilities":{},"serverInfo":{"name":"sh","version":"1"},"instructions":"shell tools"}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"Echo","inputSchema":{"type":"object"}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"echoed %s"}]}}\n' "$id" "$id" ;;
  esac
done
"#;

fn timeouts() -> TimeoutConfig {
    TimeoutConfig {
        connect: Duration::from_secs(5),
        request: Duration::from_secs(5),
        shutdown: ShutdownPolicy::uniform(Duration::from_millis(300)),
        ..TimeoutConfig::default()
    }
}

fn script_server(name: &str, script: &str, args: &[&str]) -> ToolServerConfig {
    let mut argv = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    argv.extend(args.iter().map(|a| a.to_string()));
    ToolServerConfig::new(name, TransportConfig::stdio("sh", argv))
}

async fn wait_for_file(path: &Path) -> String {
    for _ in 0..50 {
        if let Ok(contents) = std::fs::read_to_string(path) {
            if !contents.is_empty() {
                return contents;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was never written", path.display());
}

#[tokio::test]
async fn handshake_call_and_ping_over_a_child_process() {
    let dir = tempfile::tempdir().unwrap();
    let pong = dir.path().join("pong.json");
    let config = script_server("shell", SERVER_SCRIPT, &[pong.to_str().unwrap()]);
    let client = ToolServerClient::from_config(config, &timeouts(), &RetryPolicy::default()).unwrap();

    client.start().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Initialized);
    assert_eq!(client.instructions().as_deref(), Some("shell tools"));
    let names: Vec<_> = client.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo".to_string()]);

    let result = client.invoke("echo", json!({"text": "hi"})).await.unwrap();
    assert!(result.to_text().starts_with("echoed "));

    let reply: serde_json::Value = serde_json::from_str(wait_for_file(&pong).await.trim()).unwrap();
    assert_eq!(reply["id"], "srv-1");
    assert_eq!(reply["result"], json!({}));

    client.stop().await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn concurrent_invocations_are_correlated_by_id() {
    let dir = tempfile::tempdir().unwrap();
    let pong = dir.path().join("pong.json");
    let config = script_server("shell", SERVER_SCRIPT, &[pong.to_str().unwrap()]);
    let client = ToolServerClient::from_config(config, &timeouts(), &RetryPolicy::default()).unwrap();
    client.start().await.unwrap();

    let calls = (0..4).map(|_| client.invoke("echo", json!({})));
    let results = futures::future::join_all(calls).await;
    let mut texts: Vec<_> = results.into_iter().map(|r| r.unwrap().to_text()).collect();
    texts.sort();
    texts.dedup();
    assert_eq!(texts.len(), 4);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn server_that_never_answers_fails_to_start_and_is_reaped() {
    let config = script_server("mute", "trap '' INT TERM; while true; do sleep 0.05; done", &[]);
    let mut timeouts = timeouts();
    timeouts.connect = Duration::from_millis(300);
    let client = ToolServerClient::from_config(config, &timeouts, &RetryPolicy::default()).unwrap();

    let started = Instant::now();
    let err = client.start().await.expect_err("no handshake");
    assert!(matches!(err, SwarmError::ServerInit { server, .. } if server == "mute"));
    // connect timeout plus the three shutdown tiers, with slack
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn registry_loads_stdio_servers_from_toml() {
    let dir = tempfile::tempdir().unwrap();
    let pong = dir.path().join("pong.json");
    let raw = format!(
        r#"
[timeouts]
connect_ms = 5000
request_ms = 5000

[timeouts.shutdown]
graceful_ms = 300
terminate_ms = 300
kill_ms = 300

[[servers]]
name = "shell"
transport = "stdio"
command = "sh"
args = ["-c", {script}, "sh", {pong}]
"#,
        script = toml_string(SERVER_SCRIPT),
        pong = toml_string(pong.to_str().unwrap()),
    );
    let config = SwarmConfig::from_toml_str(&raw).unwrap();
    let registry = ToolServerRegistry::from_config(&config, CollisionPolicy::default()).unwrap();

    assert!(registry.start().await.all_started());
    let result = registry.invoke("echo", json!({})).await.unwrap();
    assert!(result.to_text().starts_with("echoed "));
    assert!(registry.stop_all().await.is_empty());
}

fn toml_string(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}
