//! MCP server registry and lifecycle management.
//!
//! The manager owns every live connection, maps stable server ids to them,
//! and aggregates the tool catalog across servers. Registry mutations
//! (start/stop) are serialized; observation is lock-light so a slow bring-up
//! never blocks the orchestrator.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use super::client::McpClient;
use super::config::{AuthKind, McpRegistry, ServerConfig, TransportKind};
use super::logs::ConnectionLogs;
use super::transport::{
    LegacySseTransport, StdioTransport, StreamableHttpTransport, Transport,
};
use super::{McpError, ToolDescriptor, ToolLocator};
use crate::core::secrets::SecretStore;

/// Lifecycle state of one managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Stopped,
    Connecting,
    Connected,
    Error,
}

/// A live (or failed) connection to one MCP server.
pub struct Connection {
    config: ServerConfig,
    status: StdMutex<ServerStatus>,
    logs: ConnectionLogs,
    client: StdMutex<Option<Arc<McpClient>>>,
}

impl Connection {
    fn new(config: ServerConfig, logs: ConnectionLogs) -> Self {
        Self {
            config,
            status: StdMutex::new(ServerStatus::Connecting),
            logs,
            client: StdMutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn status(&self) -> ServerStatus {
        self.status
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ServerStatus::Error)
    }

    fn set_status(&self, status: ServerStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    fn set_client(&self, client: Arc<McpClient>) {
        if let Ok(mut guard) = self.client.lock() {
            *guard = Some(client);
        }
    }

    fn client(&self) -> Option<Arc<McpClient>> {
        self.client.lock().ok().and_then(|guard| guard.clone())
    }

    pub fn logs(&self, max_lines: usize) -> Vec<String> {
        self.logs.tail(max_lines)
    }

    async fn dispose(&self) {
        self.set_status(ServerStatus::Stopped);
        let client = self
            .client
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(client) = client {
            client.dispose().await;
        }
    }
}

pub struct McpManager {
    config_path: PathBuf,
    secrets: Arc<dyn SecretStore>,
    connections: StdMutex<HashMap<Uuid, Arc<Connection>>>,
    /// Serializes start/stop so concurrent mutations cannot race; readers
    /// never take this lock.
    lifecycle: Mutex<()>,
}

impl McpManager {
    pub fn new(config_path: PathBuf, secrets: Arc<dyn SecretStore>) -> Arc<Self> {
        Arc::new(Self {
            config_path,
            secrets,
            connections: StdMutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Re-read the config file. The file is the source of truth; the manager
    /// never writes it.
    pub fn list_servers(&self) -> Result<Vec<ServerConfig>, McpError> {
        McpRegistry::load(&self.config_path).map(|registry| registry.servers().to_vec())
    }

    /// Launch bring-up of every auto-startable server in the background.
    /// Startup never blocks the caller; failures land in each connection's
    /// status and logs.
    pub fn start_all(self: &Arc<Self>) {
        let servers = match self.list_servers() {
            Ok(servers) => servers,
            Err(err) => {
                warn!(%err, "Failed to load MCP config for auto-start");
                return;
            }
        };
        for config in servers {
            if config.disabled || !config.auto_start {
                continue;
            }
            let manager = self.clone();
            let id = config.id;
            let name = config.name.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.start_server(id).await {
                    warn!(server = %name, %err, "MCP server auto-start failed");
                }
            });
        }
    }

    fn connection(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .ok()
            .and_then(|map| map.get(&id).cloned())
    }

    fn auth_header_for(&self, config: &ServerConfig) -> Result<Option<String>, McpError> {
        match config.auth {
            AuthKind::None => Ok(None),
            AuthKind::Bearer => {
                let secret_name = config.auth_secret_name.as_deref().ok_or_else(|| {
                    McpError::ConfigInvalid(format!(
                        "server '{}' uses bearer auth without a secret name",
                        config.name
                    ))
                })?;
                let token = self
                    .secrets
                    .get(secret_name)
                    .map_err(|err| {
                        McpError::ConfigInvalid(format!(
                            "secret lookup for '{secret_name}' failed: {err}"
                        ))
                    })?
                    .ok_or_else(|| {
                        McpError::ConfigInvalid(format!("secret '{secret_name}' is not set"))
                    })?;
                Ok(Some(format!("Bearer {token}")))
            }
        }
    }

    async fn bring_up(
        &self,
        config: &ServerConfig,
        logs: ConnectionLogs,
    ) -> Result<Arc<McpClient>, McpError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let transport: Arc<dyn Transport> = match config.kind {
            TransportKind::Stdio => {
                Arc::new(StdioTransport::spawn(config, inbound_tx, logs.clone())?)
            }
            TransportKind::Http => {
                let url = config.url.clone().ok_or_else(|| {
                    McpError::ConfigInvalid(format!("server '{}' has no url", config.name))
                })?;
                let auth = self.auth_header_for(config)?;
                Arc::new(StreamableHttpTransport::new(
                    url,
                    auth,
                    inbound_tx,
                    logs.clone(),
                )?)
            }
            TransportKind::LegacySse => {
                let url = config.url.clone().ok_or_else(|| {
                    McpError::ConfigInvalid(format!("server '{}' has no url", config.name))
                })?;
                let auth = self.auth_header_for(config)?;
                Arc::new(
                    LegacySseTransport::connect(url, auth, inbound_tx, logs.clone()).await?,
                )
            }
        };
        Ok(McpClient::new(transport, inbound_rx, logs))
    }

    /// Start a configured server. Starting an already-live server is a
    /// no-op; a failed bring-up leaves an `Error` entry behind so its logs
    /// stay inspectable until it is stopped or restarted.
    pub async fn start_server(&self, id: Uuid) -> Result<(), McpError> {
        let _guard = self.lifecycle.lock().await;

        if self.connection(id).is_some() {
            debug!(server_id = %id, "Server already started");
            return Ok(());
        }

        let registry = McpRegistry::load(&self.config_path)?;
        let config = registry
            .find(id)
            .cloned()
            .ok_or(McpError::UnknownServer(id))?;

        let logs = ConnectionLogs::new();
        let connection = Arc::new(Connection::new(config.clone(), logs.clone()));
        if let Ok(mut map) = self.connections.lock() {
            map.insert(id, connection.clone());
        }

        let client = match self.bring_up(&config, logs.clone()).await {
            Ok(client) => client,
            Err(err) => {
                logs.push(format!("[startup] {err}"));
                connection.set_status(ServerStatus::Error);
                return Err(err);
            }
        };
        connection.set_client(client.clone());

        match client.initialize().await {
            Ok(_) => {
                debug!(server = %config.name, "MCP server connected");
                connection.set_status(ServerStatus::Connected);
                Self::watch_for_transport_death(connection, client);
                Ok(())
            }
            Err(err) => {
                logs.push(format!("[initialize] {err}"));
                connection.set_status(ServerStatus::Error);
                client.dispose().await;
                Err(err)
            }
        }
    }

    /// Flip a connection to `Error` when its transport dies out from under
    /// it. A deliberate stop marks the connection `Stopped` before the
    /// signal fires, so this only catches unexpected deaths.
    fn watch_for_transport_death(connection: Arc<Connection>, client: Arc<McpClient>) {
        let closed = client.closed_signal();
        tokio::spawn(async move {
            closed.cancelled().await;
            if connection.status() == ServerStatus::Connected {
                warn!(server = %connection.config().name, "MCP transport died");
                connection.set_status(ServerStatus::Error);
            }
        });
    }

    /// Stop a server and remove it from the registry of live connections.
    /// Idempotent: stopping an unknown or already-stopped server succeeds.
    pub async fn stop_server(&self, id: Uuid) -> Result<(), McpError> {
        let _guard = self.lifecycle.lock().await;
        let connection = self
            .connections
            .lock()
            .ok()
            .and_then(|mut map| map.remove(&id));
        if let Some(connection) = connection {
            connection.dispose().await;
        }
        Ok(())
    }

    /// Dispose every connection. Used at process shutdown so child processes
    /// are reaped.
    pub async fn stop_all(&self) {
        let _guard = self.lifecycle.lock().await;
        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .map(|mut map| map.drain().map(|(_, conn)| conn).collect())
            .unwrap_or_default();
        for connection in connections {
            connection.dispose().await;
        }
    }

    pub fn status(&self, id: Uuid) -> ServerStatus {
        self.connection(id)
            .map(|conn| conn.status())
            .unwrap_or(ServerStatus::Stopped)
    }

    pub fn logs(&self, id: Uuid, max_lines: usize) -> Result<Vec<String>, McpError> {
        self.connection(id)
            .map(|conn| conn.logs(max_lines))
            .ok_or(McpError::UnknownServer(id))
    }

    fn connected_client(&self, id: Uuid) -> Result<Arc<McpClient>, McpError> {
        let connection = self.connection(id).ok_or(McpError::UnknownServer(id))?;
        if connection.status() != ServerStatus::Connected {
            return Err(McpError::NotConnected);
        }
        connection.client().ok_or(McpError::NotConnected)
    }

    pub async fn list_tools(&self, id: Uuid) -> Result<Vec<ToolDescriptor>, McpError> {
        self.connected_client(id)?.list_tools().await
    }

    pub async fn call_tool(
        &self,
        id: Uuid,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        self.connected_client(id)?.call_tool(name, arguments).await
    }

    /// Aggregate the tool catalog across every connected server.
    ///
    /// Listing fans out concurrently but the returned order is registry
    /// order, not completion order. A failing server loses its contribution
    /// and is logged; it never aborts the aggregate. Tools with empty names
    /// are dropped.
    pub async fn all_tools(&self) -> Vec<ToolLocator> {
        let registry = match McpRegistry::load(&self.config_path) {
            Ok(registry) => registry,
            Err(err) => {
                warn!(%err, "Failed to load MCP config for catalog aggregation");
                return Vec::new();
            }
        };

        let connections: Vec<Arc<Connection>> = registry
            .servers()
            .iter()
            .filter_map(|config| self.connection(config.id))
            .filter(|conn| conn.status() == ServerStatus::Connected)
            .collect();

        let fetches = connections.iter().cloned().map(|connection| async move {
            let listing = match connection.client() {
                Some(client) => client.list_tools().await,
                None => Err(McpError::NotConnected),
            };
            (connection, listing)
        });

        let mut catalog = Vec::new();
        for (connection, listing) in futures_util::future::join_all(fetches).await {
            match listing {
                Ok(tools) => {
                    for descriptor in tools {
                        if descriptor.name.trim().is_empty() {
                            warn!(
                                server = %connection.config().name,
                                "Dropping tool with empty name"
                            );
                            continue;
                        }
                        catalog.push(ToolLocator {
                            server_id: connection.config().id,
                            server_name: connection.config().name.clone(),
                            descriptor,
                        });
                    }
                }
                Err(err) => {
                    warn!(server = %connection.config().name, %err, "Tool listing failed");
                    connection
                        .logs
                        .push(format!("[tools/list] {err}"));
                }
            }
        }
        catalog
    }

    /// Route a tool call by bare tool name. When two servers expose the same
    /// name, the first server in registry iteration order wins and the
    /// collision is logged so operators can fix their config.
    pub async fn call_tool_by_name(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<Value, McpError> {
        let catalog = self.all_tools().await;
        let mut matches = catalog
            .iter()
            .filter(|locator| locator.descriptor.name == name);
        let Some(winner) = matches.next() else {
            return Err(McpError::ToolNotFound(name.to_string()));
        };
        let losers: Vec<&str> = matches.map(|locator| locator.server_name.as_str()).collect();
        if !losers.is_empty() {
            warn!(
                tool = %name,
                winner = %winner.server_name,
                shadowed = ?losers,
                "Tool name collision; first server in registry order wins"
            );
        }
        self.call_tool(winner.server_id, name, arguments).await
    }
}
