//! Child-process binding: newline-delimited JSON over stdin/stdout.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use strum::Display;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::common::{reply_to_server_request, PendingRequests};
use super::{ToolTransport, TransportKind};
use crate::config::ShutdownPolicy;
use crate::error::SwarmError;
use crate::mcp::schema::{InboundFrame, RpcNotification, RpcRequest, RpcResponse};

type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

/// Which shutdown tier ended the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ShutdownStage {
    /// Exited after stdin was closed and an interrupt was sent.
    Graceful,
    /// Exited after a terminate signal.
    Terminate,
    /// Had to be force-killed.
    Kill,
}

/// Result of the last `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub stage: ShutdownStage,
    pub status: Option<ExitStatus>,
}

struct RunningChild {
    child: Child,
    reader: JoinHandle<()>,
    stderr: Option<JoinHandle<()>>,
}

/// Transport that owns a spawned tool-server process.
pub struct ProcessTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    shutdown: ShutdownPolicy,
    child: Mutex<Option<RunningChild>>,
    stdin: SharedStdin,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
    last_shutdown: StdMutex<Option<ShutdownOutcome>>,
}

impl ProcessTransport {
    pub fn new(server: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            server: server.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            shutdown: ShutdownPolicy::default(),
            child: Mutex::new(None),
            stdin: Arc::new(Mutex::new(None)),
            pending: PendingRequests::default(),
            alive: Arc::new(AtomicBool::new(false)),
            last_shutdown: StdMutex::new(None),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: Option<PathBuf>) -> Self {
        self.cwd = cwd;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownPolicy) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// OS process id of the running child, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.child.id())
    }

    /// How the most recent `close` ended the child.
    pub fn last_shutdown(&self) -> Option<ShutdownOutcome> {
        *self
            .last_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn spawn(&self) -> Result<RunningChild, SwarmError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            SwarmError::Connection(format!("failed to spawn '{}': {e}", self.command))
        })?;

        // Dropping `child` on the error paths below kills it (kill_on_drop).
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SwarmError::Connection("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SwarmError::Connection("child stdout unavailable".into()))?;

        *self.stdin.lock().await = Some(stdin);

        let reader = tokio::spawn(read_stdout(
            self.server.clone(),
            stdout,
            self.stdin.clone(),
            self.pending.clone(),
            self.alive.clone(),
        ));
        let stderr = child.stderr.take().map(|stderr| {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "stderr: {line}");
                }
            })
        });

        Ok(RunningChild {
            child,
            reader,
            stderr,
        })
    }

    async fn write_line(&self, frame: &impl serde::Serialize) -> Result<(), SwarmError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| SwarmError::Connection(format!("server '{}' is not running", self.server)))?;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| SwarmError::Connection(format!("write to '{}' failed: {e}", self.server)))?;
        stdin
            .flush()
            .await
            .map_err(|e| SwarmError::Connection(format!("flush to '{}' failed: {e}", self.server)))
    }

    /// Escalate interrupt, terminate, kill until the child is reaped.
    async fn terminate(&self, child: &mut Child) -> ShutdownOutcome {
        // Closing stdin is the protocol-level shutdown request.
        self.stdin.lock().await.take();
        send_signal(child, Signal::Interrupt);
        if let Some(status) = wait_for_exit(child, self.shutdown.graceful).await {
            return ShutdownOutcome {
                stage: ShutdownStage::Graceful,
                status: Some(status),
            };
        }

        tracing::debug!(server = %self.server, "child ignored interrupt; terminating");
        send_signal(child, Signal::Terminate);
        if let Some(status) = wait_for_exit(child, self.shutdown.terminate).await {
            return ShutdownOutcome {
                stage: ShutdownStage::Terminate,
                status: Some(status),
            };
        }

        tracing::warn!(server = %self.server, "child ignored terminate; killing");
        if let Err(e) = child.start_kill() {
            tracing::warn!(server = %self.server, error = %e, "kill failed");
        }
        ShutdownOutcome {
            stage: ShutdownStage::Kill,
            status: wait_for_exit(child, self.shutdown.kill).await,
        }
    }
}

#[async_trait]
impl ToolTransport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn connect(&self) -> Result<(), SwarmError> {
        let mut slot = self.child.lock().await;
        if slot.is_some() && self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(mut stale) = slot.take() {
            stale.reader.abort();
            let _ = stale.child.start_kill();
        }

        self.alive.store(true, Ordering::SeqCst);
        match self.spawn().await {
            Ok(running) => {
                tracing::debug!(
                    server = %self.server,
                    command = %self.command,
                    pid = ?running.child.id(),
                    "spawned tool server"
                );
                *slot = Some(running);
                Ok(())
            }
            Err(e) => {
                self.alive.store(false, Ordering::SeqCst);
                self.stdin.lock().await.take();
                Err(e)
            }
        }
    }

    async fn send_request(&self, request: RpcRequest) -> Result<RpcResponse, SwarmError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(SwarmError::Connection(format!(
                "server '{}' is not running",
                self.server
            )));
        }
        let waiter = self.pending.register(request.id)?;
        self.write_line(&request).await?;
        waiter.wait().await
    }

    async fn notify(&self, notification: RpcNotification) -> Result<(), SwarmError> {
        self.write_line(&notification).await
    }

    async fn close(&self) -> Result<(), SwarmError> {
        let Some(mut running) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.alive.store(false, Ordering::SeqCst);

        let outcome = self.terminate(&mut running.child).await;
        running.reader.abort();
        if let Some(stderr) = running.stderr {
            stderr.abort();
        }
        self.pending
            .fail_all(|| SwarmError::Connection("transport closed".into()));
        *self
            .last_shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(outcome);

        tracing::debug!(
            server = %self.server,
            stage = %outcome.stage,
            status = ?outcome.status,
            "tool server stopped"
        );
        match outcome.status {
            Some(_) => Ok(()),
            None => Err(SwarmError::Timeout(self.shutdown.total().as_millis() as u64)),
        }
    }

    fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// Route stdout frames until the child closes its end.
async fn read_stdout(
    server: String,
    stdout: ChildStdout,
    stdin: SharedStdin,
    pending: PendingRequests,
    alive: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stdout read failed");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match InboundFrame::parse(trimmed) {
            Ok(InboundFrame::Response(response)) => {
                let id = response.id;
                if !pending.resolve(response) {
                    tracing::debug!(server = %server, id, "dropping response with no waiter");
                }
            }
            Ok(InboundFrame::Request { id, method, .. }) => {
                answer_server_request(&server, &stdin, id, &method).await;
            }
            Ok(InboundFrame::Notification { method, .. }) => {
                tracing::trace!(server = %server, method = %method, "server notification");
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "ignoring malformed line");
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    pending.fail_all(|| SwarmError::Connection(format!("server '{server}' exited")));
}

async fn answer_server_request(server: &str, stdin: &SharedStdin, id: Value, method: &str) {
    let mut line = reply_to_server_request(id, method).to_string().into_bytes();
    line.push(b'\n');
    let mut guard = stdin.lock().await;
    if let Some(writer) = guard.as_mut() {
        if let Err(e) = writer.write_all(&line).await {
            tracing::debug!(server = %server, error = %e, "failed to answer server request");
        }
        let _ = writer.flush().await;
    }
}

async fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "wait on child failed");
            None
        }
        Err(_) => None,
    }
}

enum Signal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn send_signal(child: &Child, signal: Signal) {
    let Some(pid) = child.id() else {
        return;
    };
    let signal = match signal {
        Signal::Interrupt => libc::SIGINT,
        Signal::Terminate => libc::SIGTERM,
    };
    // SAFETY: `pid` is our own child and has not been reaped (id() is Some).
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, signal: Signal) {
    // No interrupt on this platform: the first tier relies on stdin closing.
    if matches!(signal, Signal::Terminate) {
        let _ = child.start_kill();
    }
}
