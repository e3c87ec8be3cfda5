//! Transport-agnostic MCP JSON-RPC 2.0 client.
//!
//! The client owns the request/response correlation map: every outbound
//! request reserves a monotonically assigned id and a single-shot slot, and a
//! dispatch task demultiplexes inbound frames by id. Notifications bypass
//! correlation entirely. When the transport closes, every pending slot is
//! failed so no caller hangs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::logs::ConnectionLogs;
use super::transport::{InboundFrame, Transport};
use super::{McpError, ToolDescriptor};

/// Per-RPC timeout. A timed-out request fails its own slot; the connection
/// remains usable.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<Result<Value, McpError>>>>>;

pub struct McpClient {
    transport: Arc<dyn Transport>,
    pending: PendingMap,
    next_request_id: AtomicI64,
    logs: ConnectionLogs,
    closed: Arc<StdMutex<Option<String>>>,
    closed_signal: CancellationToken,
}

impl McpClient {
    /// Wire a client onto a transport. `inbound` is the receiving end of the
    /// channel the transport pushes frames into.
    pub fn new(
        transport: Arc<dyn Transport>,
        inbound: mpsc::UnboundedReceiver<InboundFrame>,
        logs: ConnectionLogs,
    ) -> Arc<Self> {
        let client = Arc::new(Self {
            transport,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            next_request_id: AtomicI64::new(1),
            logs,
            closed: Arc::new(StdMutex::new(None)),
            closed_signal: CancellationToken::new(),
        });
        Self::spawn_dispatch(
            client.pending.clone(),
            client.closed.clone(),
            client.closed_signal.clone(),
            client.logs.clone(),
            inbound,
        );
        client
    }

    /// Fires once the transport has closed, for owners that need to react
    /// to an unexpected death.
    pub fn closed_signal(&self) -> CancellationToken {
        self.closed_signal.clone()
    }

    fn spawn_dispatch(
        pending: PendingMap,
        closed: Arc<StdMutex<Option<String>>>,
        closed_signal: CancellationToken,
        logs: ConnectionLogs,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                match frame {
                    InboundFrame::Message(value) => {
                        Self::dispatch_message(&pending, &logs, value);
                    }
                    InboundFrame::Closed { reason } => {
                        debug!(%reason, "MCP transport closed");
                        if let Ok(mut guard) = closed.lock() {
                            *guard = Some(reason.clone());
                        }
                        Self::drain_pending(&pending, &reason);
                        closed_signal.cancel();
                        break;
                    }
                }
            }
        });
    }

    fn dispatch_message(pending: &PendingMap, logs: &ConnectionLogs, value: Value) {
        // Server-initiated requests and notifications carry a method; they
        // never participate in correlation.
        if value.get("method").is_some() {
            logs.push(format!("[server message] {value}"));
            return;
        }

        let Some(id) = value.get("id").and_then(Value::as_i64) else {
            logs.push(format!("[unroutable frame] {value}"));
            return;
        };

        let slot = match pending.lock() {
            Ok(mut map) => map.remove(&id),
            Err(_) => None,
        };
        let Some(slot) = slot else {
            logs.push(format!("[response for unknown id {id}]"));
            return;
        };

        let outcome = if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Err(McpError::Server { code, message })
        } else {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        };
        let _ = slot.send(outcome);
    }

    fn drain_pending(pending: &PendingMap, reason: &str) {
        let slots: Vec<_> = match pending.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => return,
        };
        for (_, slot) in slots {
            let _ = slot.send(Err(McpError::Transport(format!(
                "transport closed: {reason}"
            ))));
        }
    }

    fn closed_reason(&self) -> Option<String> {
        self.closed.lock().ok().and_then(|guard| guard.clone())
    }

    /// Send one JSON-RPC request and await its response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        if let Some(reason) = self.closed_reason() {
            return Err(McpError::Transport(format!("transport closed: {reason}")));
        }

        let id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let mut message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
        });
        if let Some(params) = params {
            message["params"] = params;
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut map = self
                .pending
                .lock()
                .map_err(|_| McpError::Protocol("correlation map poisoned".into()))?;
            map.insert(id, tx);
        }

        debug!(request_id = id, %method, "Sending MCP request");
        let payload = serde_json::to_string(&message)?;
        if let Err(err) = self.transport.send(payload).await {
            if let Ok(mut map) = self.pending.lock() {
                map.remove(&id);
            }
            return Err(err);
        }

        match timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::Transport("response channel closed".into())),
            Err(_) => {
                if let Ok(mut map) = self.pending.lock() {
                    map.remove(&id);
                }
                Err(McpError::Timeout)
            }
        }
    }

    /// Send a JSON-RPC notification (no id, no response).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| json!({})),
        });
        self.transport.send(serde_json::to_string(&message)?).await
    }

    /// Perform the MCP initialize handshake. Returns the server's
    /// capabilities block, carried opaquely.
    pub async fn initialize(&self) -> Result<Value, McpError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "confab",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;

        // Servers may reject the initialized notification; that is not fatal.
        if let Err(err) = self.notify("notifications/initialized", None).await {
            warn!(%err, "Server rejected initialized notification");
            self.logs
                .push(format!("[initialized notification rejected] {err}"));
        }

        Ok(result.get("capabilities").cloned().unwrap_or(Value::Null))
    }

    /// List the server's tools. A malformed listing is logged and treated as
    /// empty rather than failing the caller.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", None).await?;
        let tools_value = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        match serde_json::from_value::<Vec<ToolDescriptor>>(tools_value) {
            Ok(tools) => Ok(tools),
            Err(err) => {
                warn!(%err, "Malformed tools/list response");
                self.logs.push(format!("[malformed tools/list] {err}"));
                Ok(Vec::new())
            }
        }
    }

    /// Invoke one tool. The raw JSON-RPC `result` is returned so callers can
    /// apply their own result extraction.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, McpError> {
        let params = json!({
            "name": name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params)).await
    }

    /// Tear down the transport and fail anything still in flight.
    pub async fn dispose(&self) {
        self.transport.dispose().await;
        Self::drain_pending(&self.pending, "disposed");
        if let Ok(mut guard) = self.closed.lock() {
            guard.get_or_insert_with(|| "disposed".to_string());
        }
        self.closed_signal.cancel();
    }
}
