//! Model Context Protocol integration.
//!
//! The layering mirrors the wire reality: a [`transport`] carries opaque
//! JSON-RPC frames (stdio subprocess, streamable HTTP, or legacy SSE), the
//! [`client`] owns request/response correlation and the protocol handshake,
//! and the [`manager`] tracks server lifecycles and aggregates the tool
//! catalog across every connected server.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub mod client;
pub mod config;
pub mod logs;
pub mod manager;
pub mod transport;

pub use client::McpClient;
pub use config::{McpRegistry, ServerConfig, TransportKind};
pub use manager::{McpManager, ServerStatus};

/// Errors from MCP operations.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid MCP server config: {0}")]
    ConfigInvalid(String),

    #[error("Failed to spawn MCP server process: {0}")]
    SpawnFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server returned error: code={code}, message={message}")]
    Server { code: i64, message: String },

    #[error("Timeout waiting for MCP server response")]
    Timeout,

    #[error("Server not connected")]
    NotConnected,

    #[error("Unknown server: {0}")]
    UnknownServer(Uuid),

    #[error("No connected server exposes tool '{0}'")]
    ToolNotFound(String),

    #[error("Cancelled")]
    Cancelled,
}

/// A tool as advertised by one MCP server. The input schema is carried
/// opaquely; only the gateway translation layer inspects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// A tool plus the server that owns it, as returned by the manager's
/// aggregate catalog so callers can route calls.
#[derive(Debug, Clone, Serialize)]
pub struct ToolLocator {
    pub server_id: Uuid,
    pub server_name: String,
    pub descriptor: ToolDescriptor,
}
