//! Application facade.
//!
//! Wires the stores, MCP manager, sandbox, and orchestrator together and
//! exposes the operations an external RPC dispatcher binds to the GUI:
//! conversation CRUD, `send_message`/`stop_stream`, settings and API-key
//! management, the `mcp.*` surface, model listing, and the code-mode
//! helpers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::api::models::ModelInfo;
use crate::api::ChatRequest;
use crate::core::events::{ChannelSink, TurnEvent};
use crate::core::gateway::{ChatBackend, ChunkSource, Gateway, GatewayError};
use crate::core::secrets::{SecretError, SecretStore};
use crate::core::settings::Settings;
use crate::core::store::{Conversation, ConversationStore, StoreError, StoredMessage};
use crate::core::turn::{DirectDispatcher, TurnError, TurnOrchestrator, TurnOutcome};
use crate::mcp::{McpError, McpManager, ServerConfig, ServerStatus, ToolLocator};
use crate::sandbox::{CodeModeDispatcher, CodeSandbox, DetailLevel, SandboxError};

/// Resolves the API key at stream-open time so key changes take effect
/// without rebuilding the core.
struct SecretBackend {
    settings: Settings,
    secrets: Arc<dyn SecretStore>,
}

impl SecretBackend {
    fn gateway(&self) -> Result<Gateway, GatewayError> {
        let key = self
            .secrets
            .get(&self.settings.provider)
            .map_err(|err| GatewayError::Http(err.to_string()))?
            .ok_or_else(|| {
                GatewayError::Http(format!(
                    "no API key stored for provider '{}'",
                    self.settings.provider
                ))
            })?;
        Ok(Gateway::new(
            self.settings.base_url.clone(),
            key,
            self.settings.http_referer.clone(),
            self.settings.x_title.clone(),
        ))
    }
}

#[async_trait]
impl ChatBackend for SecretBackend {
    async fn open_stream(
        &self,
        request: &ChatRequest,
    ) -> Result<Box<dyn ChunkSource>, GatewayError> {
        self.gateway()?.open_stream(request).await
    }
}

pub struct ChatCore {
    settings: Settings,
    secrets: Arc<dyn SecretStore>,
    store: Arc<dyn ConversationStore>,
    manager: Arc<McpManager>,
    sandbox: Arc<CodeSandbox>,
    orchestrator: TurnOrchestrator,
    current_turn: StdMutex<Option<CancellationToken>>,
}

impl ChatCore {
    /// Build a core against the real chat gateway.
    pub fn new(
        settings: Settings,
        secrets: Arc<dyn SecretStore>,
        store: Arc<dyn ConversationStore>,
        mcp_config_path: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let backend = Arc::new(SecretBackend {
            settings: settings.clone(),
            secrets: secrets.clone(),
        });
        Self::with_backend(settings, secrets, store, backend, mcp_config_path)
    }

    /// Build a core with a custom chat backend (tests, alternative
    /// gateways).
    pub fn with_backend(
        settings: Settings,
        secrets: Arc<dyn SecretStore>,
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
        mcp_config_path: PathBuf,
    ) -> (Self, mpsc::UnboundedReceiver<TurnEvent>) {
        let manager = McpManager::new(mcp_config_path, secrets.clone());
        let sandbox = Arc::new(CodeSandbox::new(manager.clone()));
        let (sink, events) = ChannelSink::channel();
        let orchestrator = TurnOrchestrator::new(
            store.clone(),
            backend,
            Arc::new(sink),
            Arc::new(DirectDispatcher::new(manager.clone())),
        )
        .with_code_dispatcher(Arc::new(CodeModeDispatcher::new(
            sandbox.clone(),
            manager.clone(),
        )));

        (
            Self {
                settings,
                secrets,
                store,
                manager,
                sandbox,
                orchestrator,
                current_turn: StdMutex::new(None),
            },
            events,
        )
    }

    /// Kick off background bring-up of every auto-startable MCP server.
    pub fn start_mcp_servers(&self) {
        self.manager.start_all();
    }

    /// Dispose all MCP connections and the sandbox workspace.
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.sandbox.cleanup().await;
    }

    // ----- conversations / messages ------------------------------------

    pub async fn create_conversation(&self, title: &str) -> Result<i64, StoreError> {
        self.store.create_conversation(title).await
    }

    pub async fn list_conversations(&self) -> Result<Vec<Conversation>, StoreError> {
        self.store.list_conversations().await
    }

    pub async fn get_conversation(&self, id: i64) -> Result<Option<Conversation>, StoreError> {
        self.store.get_conversation(id).await
    }

    pub async fn rename_conversation(&self, id: i64, title: &str) -> Result<(), StoreError> {
        self.store.rename_conversation(id, title).await
    }

    pub async fn set_pinned(&self, id: i64, pinned: bool) -> Result<(), StoreError> {
        self.store.set_pinned(id, pinned).await
    }

    pub async fn delete_conversation(&self, id: i64) -> Result<(), StoreError> {
        self.store.delete_conversation(id).await
    }

    pub async fn list_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.store.list_messages(conversation_id).await
    }

    pub async fn delete_message(&self, id: i64) -> Result<(), StoreError> {
        self.store.delete_message(id).await
    }

    // ----- turns -------------------------------------------------------

    /// Run one turn. The previous turn's cancellation handle is replaced;
    /// `stop_stream` cancels whatever turn is live.
    pub async fn send_message(
        &self,
        conversation_id: i64,
        content: &str,
        model: Option<&str>,
        code_mode: bool,
    ) -> Result<TurnOutcome, TurnError> {
        let model = model
            .map(str::to_string)
            .or_else(|| self.settings.default_model.clone())
            .unwrap_or_else(|| "openrouter/auto".to_string());

        let cancel = CancellationToken::new();
        if let Ok(mut slot) = self.current_turn.lock() {
            *slot = Some(cancel.clone());
        }
        let outcome = self
            .orchestrator
            .run_turn(conversation_id, content, &model, code_mode, cancel)
            .await;
        if let Ok(mut slot) = self.current_turn.lock() {
            *slot = None;
        }
        outcome
    }

    /// Cancel the in-flight turn, if any.
    pub fn stop_stream(&self) {
        if let Ok(slot) = self.current_turn.lock() {
            if let Some(cancel) = slot.as_ref() {
                debug!("Cancelling current turn");
                cancel.cancel();
            }
        }
    }

    // ----- settings / secrets ------------------------------------------

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn has_api_key(&self) -> Result<bool, SecretError> {
        self.secrets.has(&self.settings.provider)
    }

    pub fn set_api_key(&self, key: &str) -> Result<(), SecretError> {
        self.secrets.set(&self.settings.provider, key)
    }

    pub fn clear_api_key(&self) -> Result<(), SecretError> {
        self.secrets.delete(&self.settings.provider)
    }

    /// Auth probe against the gateway's models endpoint.
    pub async fn test_gateway(&self) -> Result<(), GatewayError> {
        let backend = SecretBackend {
            settings: self.settings.clone(),
            secrets: self.secrets.clone(),
        };
        backend.gateway()?.probe().await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, GatewayError> {
        let backend = SecretBackend {
            settings: self.settings.clone(),
            secrets: self.secrets.clone(),
        };
        backend.gateway()?.list_models().await
    }

    // ----- mcp ---------------------------------------------------------

    pub fn mcp_list_servers(&self) -> Result<Vec<ServerConfig>, McpError> {
        self.manager.list_servers()
    }

    pub async fn mcp_start(&self, id: Uuid) -> Result<(), McpError> {
        self.manager.start_server(id).await
    }

    pub async fn mcp_stop(&self, id: Uuid) -> Result<(), McpError> {
        self.manager.stop_server(id).await
    }

    pub fn mcp_status(&self, id: Uuid) -> ServerStatus {
        self.manager.status(id)
    }

    pub fn mcp_logs(&self, id: Uuid, max_lines: usize) -> Result<Vec<String>, McpError> {
        self.manager.logs(id, max_lines)
    }

    pub fn mcp_config_path(&self) -> &std::path::Path {
        self.manager.config_path()
    }

    pub async fn mcp_list_tools(&self, id: Uuid) -> Result<Vec<crate::mcp::ToolDescriptor>, McpError> {
        self.manager.list_tools(id).await
    }

    pub async fn mcp_call_tool(
        &self,
        id: Uuid,
        name: &str,
        args: Value,
    ) -> Result<Value, McpError> {
        self.manager.call_tool(id, name, args).await
    }

    pub async fn mcp_all_tools(&self) -> Vec<ToolLocator> {
        self.manager.all_tools().await
    }

    // ----- code mode ---------------------------------------------------

    pub async fn code_mode_check_runner(&self) -> Result<String, SandboxError> {
        self.sandbox.check_runner().await
    }

    pub async fn code_mode_search_tools(&self, query: &str, detail_level: &str) -> String {
        let catalog = self.manager.all_tools().await;
        crate::sandbox::search_tools(&catalog, query, DetailLevel::parse(detail_level))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chat_stream::StreamChunk;
    use crate::core::secrets::MemorySecretStore;
    use crate::core::store::MemoryConversationStore;
    use crate::core::turn::StopReason;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug)]
    enum Scripted {
        Chunk(StreamChunk),
        Stall,
    }

    #[derive(Debug)]
    struct ScriptedSource {
        items: VecDeque<Scripted>,
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self) -> Option<Result<StreamChunk, GatewayError>> {
            match self.items.pop_front() {
                Some(Scripted::Chunk(chunk)) => Some(Ok(chunk)),
                Some(Scripted::Stall) => {
                    std::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        }
    }

    #[derive(Default)]
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<Scripted>>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn open_stream(
            &self,
            _request: &ChatRequest,
        ) -> Result<Box<dyn ChunkSource>, GatewayError> {
            match self.scripts.lock().unwrap().pop_front() {
                Some(items) => Ok(Box::new(ScriptedSource {
                    items: items.into(),
                })),
                None => Err(GatewayError::Status {
                    status: 500,
                    body: "no script".into(),
                }),
            }
        }
    }

    fn core_with_backend(backend: Arc<ScriptedBackend>) -> (ChatCore, mpsc::UnboundedReceiver<TurnEvent>) {
        ChatCore::with_backend(
            Settings::default(),
            Arc::new(MemorySecretStore::default()),
            Arc::new(MemoryConversationStore::default()),
            backend,
            PathBuf::from("/nonexistent/mcp.json"),
        )
    }

    #[tokio::test]
    async fn send_message_runs_a_turn_end_to_end() {
        let backend = Arc::new(ScriptedBackend::default());
        backend.scripts.lock().unwrap().push_back(vec![
            Scripted::Chunk(StreamChunk::Content("Hello back".into())),
            Scripted::Chunk(StreamChunk::Done { usage: None }),
        ]);
        let (core, mut events) = core_with_backend(backend);

        let conversation = core.create_conversation("chat").await.unwrap();
        let outcome = core
            .send_message(conversation, "Hello", Some("test/model"), false)
            .await
            .unwrap();

        assert_eq!(outcome.text, "Hello back");
        assert!(matches!(events.try_recv().unwrap(), TurnEvent::Start { .. }));

        let messages = core.list_messages(conversation).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].model.as_deref(), Some("test/model"));
    }

    #[tokio::test]
    async fn stop_stream_cancels_the_live_turn() {
        let backend = Arc::new(ScriptedBackend::default());
        backend
            .scripts
            .lock()
            .unwrap()
            .push_back(vec![Scripted::Stall]);
        let (core, _events) = core_with_backend(backend);
        let core = Arc::new(core);

        let conversation = core.create_conversation("chat").await.unwrap();
        let runner = {
            let core = core.clone();
            tokio::spawn(async move {
                core.send_message(conversation, "Hello", Some("m"), false)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        core.stop_stream();

        let outcome = runner.await.unwrap().unwrap();
        assert_eq!(outcome.stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn api_key_surface_round_trips() {
        let (core, _events) = core_with_backend(Arc::new(ScriptedBackend::default()));
        assert!(!core.has_api_key().unwrap());
        core.set_api_key("sk-test").unwrap();
        assert!(core.has_api_key().unwrap());
        core.clear_api_key().unwrap();
        assert!(!core.has_api_key().unwrap());
    }

    #[tokio::test]
    async fn mcp_surface_is_wired() {
        let (core, _events) = core_with_backend(Arc::new(ScriptedBackend::default()));
        // Missing config file reads as an empty registry.
        assert!(core.mcp_list_servers().unwrap().is_empty());
        assert!(core.mcp_all_tools().await.is_empty());
        assert_eq!(
            core.mcp_config_path(),
            std::path::Path::new("/nonexistent/mcp.json")
        );
    }

    #[tokio::test]
    async fn search_tools_with_no_servers_reports_no_matches() {
        let (core, _events) = core_with_backend(Arc::new(ScriptedBackend::default()));
        let result = core.code_mode_search_tools("anything", "name").await;
        assert!(result.starts_with("No tools matched"));
    }
}
