//! MCP server definitions file.
//!
//! The definitions live in a JSON document of the shape
//! `{ "mcpServers": { "<name>": { ...fields } } }` at a per-user location.
//! Users edit the file externally; this loader never writes it. Unknown
//! fields are ignored and an invalid entry is skipped without failing the
//! rest of the registry.

use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use super::McpError;

/// Wire-level carrier for MCP messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    LegacySse,
}

/// Authentication scheme for HTTP-style transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthKind {
    #[default]
    None,
    Bearer,
}

/// One server definition, immutable per config load.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Stable identifier derived from the logical server name, so it
    /// survives config reloads.
    pub id: Uuid,
    pub name: String,
    pub kind: TransportKind,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub url: Option<String>,
    pub auth: AuthKind,
    pub auth_secret_name: Option<String>,
    pub auto_start: bool,
    pub disabled: bool,
}

/// Derive the stable 128-bit identifier for a server name.
pub fn server_id_for(name: &str) -> Uuid {
    let digest: [u8; 16] = Md5::digest(name.as_bytes()).into();
    Uuid::from_bytes(digest)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RawServerEntry {
    #[serde(default)]
    transport: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    auth: Option<String>,
    #[serde(default, rename = "authSecretName")]
    auth_secret_name: Option<String>,
    #[serde(default = "default_true", rename = "autoStart")]
    auto_start: bool,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct RawConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, RawServerEntry>,
}

impl RawServerEntry {
    fn into_config(self, name: &str) -> Result<ServerConfig, McpError> {
        let kind = match self.transport.as_deref() {
            Some("stdio") => TransportKind::Stdio,
            Some("http") | Some("streamable-http") | Some("streamable_http") => {
                TransportKind::Http
            }
            Some("legacy-sse") | Some("sse") => TransportKind::LegacySse,
            Some(other) => {
                return Err(McpError::ConfigInvalid(format!(
                    "unsupported transport '{other}' for server '{name}'"
                )));
            }
            // No explicit transport: a command means stdio, a url means
            // streamable HTTP.
            None if self.command.is_some() => TransportKind::Stdio,
            None if self.url.is_some() => TransportKind::Http,
            None => {
                return Err(McpError::ConfigInvalid(format!(
                    "server '{name}' has neither command nor url"
                )));
            }
        };

        match kind {
            TransportKind::Stdio if self.command.is_none() => {
                return Err(McpError::ConfigInvalid(format!(
                    "stdio server '{name}' is missing command"
                )));
            }
            TransportKind::Http | TransportKind::LegacySse if self.url.is_none() => {
                return Err(McpError::ConfigInvalid(format!(
                    "HTTP server '{name}' is missing url"
                )));
            }
            _ => {}
        }

        let auth = match self.auth.as_deref() {
            None | Some("none") => AuthKind::None,
            Some("bearer") => AuthKind::Bearer,
            Some(other) => {
                return Err(McpError::ConfigInvalid(format!(
                    "unsupported auth kind '{other}' for server '{name}'"
                )));
            }
        };

        Ok(ServerConfig {
            id: server_id_for(name),
            name: name.to_string(),
            kind,
            command: self.command,
            args: self.args.unwrap_or_default(),
            cwd: self.cwd.map(PathBuf::from),
            env: self.env.unwrap_or_default(),
            url: self.url,
            auth,
            auth_secret_name: self.auth_secret_name,
            auto_start: self.auto_start,
            disabled: self.disabled,
        })
    }
}

/// The parsed registry for one load of the config file.
///
/// Iteration order is deterministic (entries sorted by server name), which
/// is also the order used to resolve cross-server tool-name collisions.
#[derive(Debug, Clone, Default)]
pub struct McpRegistry {
    servers: Vec<ServerConfig>,
}

impl McpRegistry {
    pub fn load(path: &Path) -> Result<Self, McpError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|err| {
            McpError::ConfigInvalid(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, McpError> {
        let raw: RawConfigFile = serde_json::from_str(contents)
            .map_err(|err| McpError::ConfigInvalid(format!("invalid config JSON: {err}")))?;

        let mut servers = Vec::with_capacity(raw.mcp_servers.len());
        for (name, entry) in raw.mcp_servers {
            match entry.into_config(&name) {
                Ok(config) => servers.push(config),
                Err(err) => warn!(server = %name, %err, "Skipping invalid MCP server entry"),
            }
        }
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { servers })
    }

    pub fn servers(&self) -> &[ServerConfig] {
        &self.servers
    }

    pub fn find(&self, id: Uuid) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|server| server.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "mcpServers": {
            "files": {
                "command": "mcp-files",
                "args": ["--root", "/tmp"],
                "env": {"LOG": "debug"}
            },
            "remote": {
                "url": "https://mcp.example.com/rpc",
                "auth": "bearer",
                "authSecretName": "remote-token"
            },
            "old-style": {
                "transport": "legacy-sse",
                "url": "https://legacy.example.com",
                "disabled": true
            }
        }
    }"#;

    #[test]
    fn parses_all_three_transport_kinds() {
        let registry = McpRegistry::parse(SAMPLE).unwrap();
        assert_eq!(registry.servers().len(), 3);

        let files = registry.find_by_name("files").unwrap();
        assert_eq!(files.kind, TransportKind::Stdio);
        assert_eq!(files.args, vec!["--root", "/tmp"]);
        assert!(files.auto_start);

        let remote = registry.find_by_name("remote").unwrap();
        assert_eq!(remote.kind, TransportKind::Http);
        assert_eq!(remote.auth, AuthKind::Bearer);
        assert_eq!(remote.auth_secret_name.as_deref(), Some("remote-token"));

        let legacy = registry.find_by_name("old-style").unwrap();
        assert_eq!(legacy.kind, TransportKind::LegacySse);
        assert!(legacy.disabled);
    }

    #[test]
    fn invalid_entries_are_skipped_not_fatal() {
        let contents = r#"{
            "mcpServers": {
                "ok": {"command": "server"},
                "broken": {"transport": "stdio"}
            }
        }"#;
        let registry = McpRegistry::parse(contents).unwrap();
        assert_eq!(registry.servers().len(), 1);
        assert!(registry.find_by_name("ok").is_some());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let contents = r#"{
            "mcpServers": {
                "srv": {"command": "x", "futureKnob": 42}
            }
        }"#;
        let registry = McpRegistry::parse(contents).unwrap();
        assert_eq!(registry.servers().len(), 1);
    }

    #[test]
    fn ids_are_stable_across_reloads() {
        let first = McpRegistry::parse(SAMPLE).unwrap();
        let second = McpRegistry::parse(SAMPLE).unwrap();
        let a = first.find_by_name("files").unwrap();
        let b = second.find_by_name("files").unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, first.find_by_name("remote").unwrap().id);
    }

    #[test]
    fn id_is_md5_of_the_name() {
        // md5("files") = 45b963397aa40d4a0063e0d85e4fe7a1
        let id = server_id_for("files");
        assert_eq!(id.simple().to_string(), "45b963397aa40d4a0063e0d85e4fe7a1");
    }

    #[test]
    fn registry_iteration_order_is_name_sorted() {
        let registry = McpRegistry::parse(SAMPLE).unwrap();
        let names: Vec<&str> = registry
            .servers()
            .iter()
            .map(|server| server.name.as_str())
            .collect();
        assert_eq!(names, vec!["files", "old-style", "remote"]);
    }

    #[test]
    fn missing_file_yields_empty_registry() {
        let registry = McpRegistry::load(Path::new("/nonexistent/mcp.json")).unwrap();
        assert!(registry.servers().is_empty());
    }
}
