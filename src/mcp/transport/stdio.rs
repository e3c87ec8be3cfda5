//! Stdio transport: a locally spawned child process speaking line-delimited
//! JSON-RPC over its standard pipes.

use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{InboundFrame, Transport};
use crate::mcp::config::ServerConfig;
use crate::mcp::logs::ConnectionLogs;
use crate::mcp::McpError;

/// Child-process transport. Outbound messages are single lines written to
/// the child's stdin behind a mutex so concurrent RPCs cannot interleave
/// bytes; stdout lines are parsed as JSON-RPC frames and stderr is captured
/// verbatim into the connection's log ring.
#[derive(Debug)]
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    cancel: CancellationToken,
    exited: StdMutex<bool>,
}

impl StdioTransport {
    pub fn spawn(
        config: &ServerConfig,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        logs: ConnectionLogs,
    ) -> Result<Self, McpError> {
        let command = config
            .command
            .as_deref()
            .ok_or_else(|| McpError::ConfigInvalid("stdio server without command".into()))?;

        debug!(command = %command, args = ?config.args, "Starting MCP stdio server");
        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&config.env)
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|err| {
            McpError::SpawnFailed(format!("failed to spawn '{command}': {err}"))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("unable to retrieve stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("unable to retrieve stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::SpawnFailed("unable to retrieve stderr".into()))?;

        let cancel = CancellationToken::new();

        // Stdout is protocol data; anything that does not parse as JSON is a
        // startup banner and goes to the log ring instead.
        {
            let inbound = inbound.clone();
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(trimmed) {
                        Ok(value) => {
                            if inbound.send(InboundFrame::Message(value)).is_err() {
                                break;
                            }
                        }
                        Err(_) => logs.push(format!("[stdout] {trimmed}")),
                    }
                }
            });
        }

        // Stderr is never protocol data.
        {
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    logs.push(format!("[stderr] {line}"));
                }
            });
        }

        // Reaper: waits for natural exit, or kills the child when the
        // transport is disposed. Either way the process is reaped and the
        // close marker drains any in-flight requests.
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let exited = tokio::select! {
                    status = child.wait() => Some(match status {
                        Ok(status) => format!("process exited: {status}"),
                        Err(err) => format!("process wait failed: {err}"),
                    }),
                    _ = cancel.cancelled() => None,
                };
                let reason = match exited {
                    Some(reason) => reason,
                    None => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        "transport disposed".to_string()
                    }
                };
                let _ = inbound.send(InboundFrame::Closed { reason });
            });
        }

        Ok(Self {
            stdin: Mutex::new(stdin),
            cancel,
            exited: StdMutex::new(false),
        })
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send(&self, payload: String) -> Result<(), McpError> {
        if self.cancel.is_cancelled() {
            return Err(McpError::Transport("transport closed".into()));
        }
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| McpError::Transport(format!("stdin write failed: {err}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|err| McpError::Transport(format!("stdin write failed: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| McpError::Transport(format!("stdin flush failed: {err}")))?;
        Ok(())
    }

    async fn dispose(&self) {
        let mut exited = match self.exited.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !*exited {
            *exited = true;
            self.cancel.cancel();
        }
    }
}
