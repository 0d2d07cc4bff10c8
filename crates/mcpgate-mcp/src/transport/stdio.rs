//! Standard I/O transport.
//!
//! Spawns the server as a child process and speaks newline-delimited JSON-RPC
//! over its stdin/stdout. A reader task routes responses to waiters by id, so
//! any number of requests may be in flight at once.

use std::process::Stdio;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mcpgate_core::{ServerSpec, TransportKind};

use crate::client::{ClientOptions, ConnectionState, PendingRequests, ProtocolClient, Session};
use crate::error::{McpError, McpResult, TransportError};
use crate::protocol::{Inbound, JsonRpcNotification, JsonRpcRequest};

/// How long a server gets after SIGTERM before it is killed.
const TERM_GRACE: Duration = Duration::from_secs(1);

/// A running server process and the tasks draining it.
struct StdioProcess {
    /// The server process.
    child: Child,
    /// Requests are written here, one JSON document per line.
    stdin: ChildStdin,
    /// Stops the stdout and stderr tasks.
    cancel: CancellationToken,
    /// Routes stdout messages into the pending map.
    reader: JoinHandle<()>,
    /// Forwards stderr lines to the log.
    stderr: Option<JoinHandle<()>>,
}

/// MCP client for a server launched as a local process.
pub struct StdioClient {
    /// Handle to ourselves for the tasks spawned on connect.
    this: Weak<StdioClient>,
    /// Command, arguments, environment and working directory to launch.
    spec: ServerSpec,
    /// Grace period and non-JSON tolerance.
    options: ClientOptions,
    /// State, server info and request ids.
    session: Session,
    /// Calls waiting for a response line.
    pending: PendingRequests,
    /// The running process, if connected.
    process: Mutex<Option<StdioProcess>>,
    /// Serializes connect and shutdown.
    lifecycle: Mutex<()>,
}

impl StdioClient {
    /// Create a client. Nothing is spawned until [`ProtocolClient::connect`].
    ///
    /// # Arguments
    ///
    /// * `spec` - A STDIO spec; `command`, `args`, `env` and `working_dir` describe the process
    /// * `options` - Transport tuning, usually from [`ClientOptions::from`] the config
    pub fn new(spec: ServerSpec, options: ClientOptions) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            session: Session::new(&spec, &options),
            spec,
            options,
            pending: PendingRequests::new(),
            process: Mutex::new(None),
            lifecycle: Mutex::new(()),
        })
    }

    /// OS process id of the running server, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.process.lock().await.as_ref().and_then(|p| p.child.id())
    }

    fn spawn_process(&self) -> Result<StdioProcess, TransportError> {
        let command = self.spec.command.as_deref().unwrap_or_default();
        debug!(
            server = %self.spec.id,
            command = %command,
            args = ?self.spec.args,
            "Spawning MCP server process"
        );

        let mut cmd = Command::new(command);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(TransportError::SpawnFailed)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::SpawnFailed(std::io::Error::other("Failed to capture stdout")))?;

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_stdout(
            self.this.clone(),
            self.spec.id.clone(),
            stdout,
            self.pending.clone(),
            self.options.max_non_json_lines,
            cancel.clone(),
        ));
        let stderr = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(self.spec.id.clone(), stderr)));

        debug!(server = %self.spec.id, pid = ?child.id(), "MCP server process spawned");

        Ok(StdioProcess {
            child,
            stdin,
            cancel,
            reader,
            stderr,
        })
    }

    async fn write_line(&self, line: &str) -> McpResult<()> {
        let mut guard = self.process.lock().await;
        let process = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        process
            .stdin
            .write_all(&buf)
            .await
            .map_err(TransportError::WriteError)?;
        process.stdin.flush().await.map_err(TransportError::WriteError)?;
        Ok(())
    }

    /// Close stdin, give the server time to exit, then escalate.
    async fn shutdown_process(&self) {
        let Some(process) = self.process.lock().await.take() else {
            return;
        };
        let StdioProcess {
            mut child,
            stdin,
            cancel,
            reader,
            stderr,
        } = process;

        cancel.cancel();
        drop(stdin);

        let grace = self.options.stdio_grace_period;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => debug!(server = %self.spec.id, status = ?status.ok(), "MCP server exited"),
            Err(_) => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{kill, Signal};
                    use nix::unistd::Pid;

                    if let Some(pid) = child.id() {
                        debug!(server = %self.spec.id, pid, "Sending SIGTERM to MCP server");
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                }

                if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
                    warn!(server = %self.spec.id, "MCP server did not exit gracefully, killing");
                    let _ = child.kill().await;
                }
            }
        }

        reader.abort();
        if let Some(stderr) = stderr {
            stderr.abort();
        }
    }
}

#[async_trait]
impl ProtocolClient for StdioClient {
    fn session(&self) -> &Session {
        &self.session
    }

    fn transport(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn connect(&self) -> McpResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.session.state() {
            ConnectionState::Ready | ConnectionState::Degraded => return Ok(()),
            ConnectionState::Closed => return Err(McpError::ConnectionClosed),
            _ => {}
        }

        // A previous process may still be around after the reader saw EOF.
        self.shutdown_process().await;
        self.session.set_state(ConnectionState::Connecting);

        let process = match self.spawn_process() {
            Ok(process) => process,
            Err(e) => {
                self.session.record_error(&e);
                self.session.set_state(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        *self.process.lock().await = Some(process);

        match self.session.handshake(self).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.session.record_error(&e);
                self.pending.fail_all(&McpError::ConnectionClosed);
                self.shutdown_process().await;
                self.session.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> McpResult<()> {
        if self.session.state() != ConnectionState::Closed {
            self.session.set_state(ConnectionState::Disconnected);
        }
        self.pending.fail_all(&McpError::ConnectionClosed);

        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown_process().await;
        info!(server = %self.spec.id, "Disconnected from MCP server");
        Ok(())
    }

    async fn close(&self) {
        if self.session.set_state(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.pending.fail_all(&McpError::ConnectionClosed);

        let _lifecycle = self.lifecycle.lock().await;
        self.shutdown_process().await;
        info!(server = %self.spec.id, "Closed MCP client");
    }

    async fn send_request(&self, request: JsonRpcRequest) -> McpResult<Value> {
        let id = request
            .numeric_id()
            .ok_or_else(|| McpError::protocol("request id must be numeric"))?;
        let line = serde_json::to_string(&request)?;

        let waiter = self.pending.register(id);
        debug!(server = %self.spec.id, id, method = %request.method, "Sending request");
        self.write_line(&line).await?;
        waiter.wait().await
    }

    async fn send_notification(&self, notification: JsonRpcNotification) -> McpResult<()> {
        let line = serde_json::to_string(&notification)?;
        self.write_line(&line).await
    }
}

impl std::fmt::Debug for StdioClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioClient")
            .field("server", &self.spec.id)
            .field("command", &self.spec.command)
            .field("state", &self.session.state())
            .finish()
    }
}

/// Route stdout lines to waiters until EOF.
async fn read_stdout(
    client: Weak<StdioClient>,
    server: String,
    stdout: ChildStdout,
    pending: PendingRequests,
    max_non_json_lines: usize,
    cancel: CancellationToken,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    let mut noise = 0usize;

    loop {
        buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(server = %server, error = %TransportError::ReadError(e), "Reading server stdout failed");
                break;
            }
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(_) => {
                noise += 1;
                debug!(server = %server, line, "Skipping non-JSON stdout line");
                if noise >= max_non_json_lines {
                    let failed = pending.fail_all(&McpError::protocol(format!(
                        "server wrote {} consecutive non-JSON lines",
                        noise
                    )));
                    if failed > 0 {
                        warn!(server = %server, failed, "Giving up on pending requests after non-JSON output");
                    }
                    noise = 0;
                }
                continue;
            }
        };
        noise = 0;

        match Inbound::classify(&message) {
            Inbound::Response(id) => {
                if !pending.complete(id, message) {
                    debug!(server = %server, id, "Dropping response for unknown request");
                }
            }
            Inbound::Other(method) => debug!(server = %server, method = %method, "Ignoring server message"),
            Inbound::Unknown => debug!(server = %server, "Ignoring unrecognized message"),
        }
    }

    if cancel.is_cancelled() {
        return;
    }
    pending.fail_all(&McpError::ConnectionClosed);
    if let Some(client) = client.upgrade() {
        if client.session.state() != ConnectionState::Closed {
            client.session.record_error("server process exited");
            client.session.set_state(ConnectionState::Disconnected);
            warn!(server = %server, "MCP server closed its stdout");
        }
    }
}

/// Forward server stderr to the log.
async fn drain_stderr(server: String, stderr: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server, "stderr: {}", line);
    }
}
