//! Loopback HTTP bridge for sandboxed code.
//!
//! The bridge is the whole trust boundary of code mode: it binds an
//! ephemeral port on 127.0.0.1 only, lives for exactly one code execution,
//! and routes every call through the MCP manager so sandbox calls are
//! subject to the same policies and logging as direct-mode calls.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::SandboxError;
use crate::mcp::McpManager;

#[derive(Clone)]
struct BridgeState {
    manager: Arc<McpManager>,
}

#[derive(Deserialize)]
struct CallToolBody {
    tool: String,
    #[serde(default)]
    args: Value,
}

async fn call_tool(
    State(state): State<BridgeState>,
    Json(body): Json<CallToolBody>,
) -> Json<Value> {
    debug!(tool = %body.tool, "Bridge tool call");
    let args = if body.args.is_null() {
        json!({})
    } else {
        body.args
    };
    match state.manager.call_tool_by_name(&body.tool, args).await {
        Ok(result) => Json(json!({ "result": result })),
        Err(err) => Json(json!({ "error": err.to_string() })),
    }
}

/// One running bridge server.
pub struct Bridge {
    port: u16,
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Bridge {
    pub async fn start(manager: Arc<McpManager>) -> Result<Self, SandboxError> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(SandboxError::Io)?;
        let port = listener
            .local_addr()
            .map_err(SandboxError::Io)?
            .port();

        let app = Router::new()
            .route("/call-tool", post(call_tool))
            .with_state(BridgeState { manager });

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(err) = served {
                debug!(%err, "Bridge server exited with error");
            }
        });

        debug!(port, "Sandbox bridge listening");
        Ok(Self {
            port,
            cancel,
            handle,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the server and wait for the port to be released.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::secrets::MemorySecretStore;
    use std::path::PathBuf;

    fn empty_manager() -> Arc<McpManager> {
        McpManager::new(
            PathBuf::from("/nonexistent/mcp.json"),
            Arc::new(MemorySecretStore::default()),
        )
    }

    #[tokio::test]
    async fn bridge_answers_unknown_tools_with_error_payload() {
        let bridge = Bridge::start(empty_manager()).await.unwrap();
        let url = format!("http://127.0.0.1:{}/call-tool", bridge.port());

        let response: Value = reqwest::Client::new()
            .post(&url)
            .json(&json!({"tool": "nope", "args": {}}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert!(response["error"]
            .as_str()
            .unwrap()
            .contains("nope"));
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() {
        let bridge = Bridge::start(empty_manager()).await.unwrap();
        let port = bridge.port();
        bridge.shutdown().await;

        // The port can be bound again immediately after shutdown.
        let rebound = tokio::net::TcpListener::bind(("127.0.0.1", port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn each_bridge_gets_its_own_port() {
        let first = Bridge::start(empty_manager()).await.unwrap();
        let second = Bridge::start(empty_manager()).await.unwrap();
        assert_ne!(first.port(), second.port());
        first.shutdown().await;
        second.shutdown().await;
    }
}
