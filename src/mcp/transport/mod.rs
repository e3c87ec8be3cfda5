//! Wire-level carriers for MCP JSON-RPC messages.
//!
//! A transport moves opaque serialized frames. Inbound frames (responses,
//! server notifications, and a final close marker) are pushed onto a shared
//! channel consumed by the client's dispatch loop, which owns request
//! correlation. Keeping correlation out of the transports lets the client
//! treat stdio pipes, streamable HTTP, and the legacy SSE split identically.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use super::logs::ConnectionLogs;
use super::McpError;

pub mod legacy_sse;
pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use legacy_sse::LegacySseTransport;
pub use stdio::StdioTransport;
pub use streamable_http::StreamableHttpTransport;

/// A frame arriving from the server side of a connection.
#[derive(Debug)]
pub enum InboundFrame {
    /// A parsed JSON-RPC object (response, error, or notification).
    Message(Value),
    /// The transport died or was disposed; no further frames will arrive.
    Closed { reason: String },
}

/// Transport contract required by the MCP client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one serialized JSON-RPC message to the server.
    ///
    /// Any response surfaces later as an [`InboundFrame::Message`] on the
    /// connection's inbound channel, never as a return value here.
    async fn send(&self, payload: String) -> Result<(), McpError>;

    /// Tear the transport down: cancel reader tasks and reap any child
    /// process. Idempotent; best-effort on the error path.
    async fn dispose(&self);
}

/// Forward one decoded payload: anything carrying an `id` participates in
/// correlation, everything else is a notification recorded in the logs.
pub(crate) fn route_inbound_payload(
    payload: &str,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    logs: &ConnectionLogs,
) {
    match serde_json::from_str::<Value>(payload) {
        Ok(value) if value.get("id").is_some() => {
            let _ = inbound.send(InboundFrame::Message(value));
        }
        Ok(value) => logs.push(format!("[notification] {value}")),
        Err(err) => logs.push(format!("[malformed frame] {err}: {payload}")),
    }
}
