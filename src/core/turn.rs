//! Turn orchestration: the bounded stream → tool-call → re-stream loop.
//!
//! One turn takes a user message to one finalized assistant message,
//! possibly through many tool calls. The orchestrator streams the model
//! response, forwards text and reasoning to the event sink, executes any
//! assembled tool calls through the active dispatcher, augments the history
//! with synthetic messages, and re-issues the request until the model stops
//! asking for tools, the call limit trips, or the caller cancels.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ChatRequest, ChatToolDefinition, ChatToolFunction, Usage};
use crate::core::chat_stream::{AssembledToolCall, StreamChunk};
use crate::core::events::{TurnEvent, TurnEventSink};
use crate::core::gateway::{ChatBackend, GatewayError};
use crate::core::store::{ConversationStore, StoreError};
use crate::mcp::manager::McpManager;
use crate::mcp::{McpError, ToolLocator};

/// Upper bound on tool calls within one turn.
pub const MAX_TOOL_CALLS: usize = 30;

/// Tool results shown to the UI are truncated to this many bytes; the model
/// always sees the full text.
const TOOL_RESULT_EVENT_LIMIT: usize = 2048;

const TOOL_LIMIT_MARKER: &str = "\n\n[maximum tool calls reached]";

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. When tools are available, \
use them to answer accurately rather than guessing.";

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("a turn is already running for conversation {0}")]
    Busy(i64),

    #[error("code mode is not available")]
    CodeModeUnavailable,
}

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Completed,
    Cancelled,
    ToolLimit,
    StreamError,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub assistant_message_id: i64,
    pub text: String,
    pub usage: Usage,
    pub stop: StopReason,
}

/// Where tool calls go. Direct mode routes through the MCP manager; code
/// mode routes through the sandbox's synthetic tools.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    /// The catalog advertised to the model for this turn.
    async fn catalog(&self) -> Vec<ToolLocator>;

    /// Execute one call. Must return promptly on cancellation.
    async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError>;
}

/// Direct-mode dispatcher over the aggregate MCP catalog.
pub struct DirectDispatcher {
    manager: Arc<McpManager>,
}

impl DirectDispatcher {
    pub fn new(manager: Arc<McpManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl ToolDispatcher for DirectDispatcher {
    async fn catalog(&self) -> Vec<ToolLocator> {
        self.manager.all_tools().await
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        tokio::select! {
            result = self.manager.call_tool_by_name(name, arguments) => result,
            _ = cancel.cancelled() => Err(McpError::Cancelled),
        }
    }
}

/// Translate the catalog into the gateway's function-calling shape. Schemas
/// get `type` defaulted to `"object"` and `additionalProperties` forced off;
/// a tool with an empty name is dropped.
pub fn translate_tools(catalog: &[ToolLocator]) -> Option<Vec<ChatToolDefinition>> {
    let mut definitions = Vec::with_capacity(catalog.len());
    for locator in catalog {
        if locator.descriptor.name.trim().is_empty() {
            warn!(server = %locator.server_name, "Dropping tool with empty name");
            continue;
        }
        let mut parameters = locator
            .descriptor
            .input_schema
            .clone()
            .unwrap_or_else(|| json!({}));
        if let Some(schema) = parameters.as_object_mut() {
            schema
                .entry("type")
                .or_insert_with(|| Value::String("object".into()));
            schema.insert("additionalProperties".into(), Value::Bool(false));
        }
        definitions.push(ChatToolDefinition {
            kind: "function".into(),
            function: ChatToolFunction {
                name: locator.descriptor.name.clone(),
                description: locator.descriptor.description.clone(),
                parameters,
            },
        });
    }
    if definitions.is_empty() {
        None
    } else {
        Some(definitions)
    }
}

/// Concatenate the `text` items of an MCP tool-call result; fall back to the
/// raw JSON when the shape does not match.
pub fn extract_result_text(result: &Value) -> String {
    if let Some(items) = result.get("content").and_then(Value::as_array) {
        let texts: Vec<&str> = items
            .iter()
            .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|item| item.get("text").and_then(Value::as_str))
            .collect();
        if !texts.is_empty() {
            return texts.join("\n");
        }
    }
    result.to_string()
}

fn truncate_for_event(text: &str) -> String {
    if text.len() <= TOOL_RESULT_EVENT_LIMIT {
        return text.to_string();
    }
    let mut end = TOOL_RESULT_EVENT_LIMIT;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

/// Removes the conversation from the active set when the turn ends, however
/// it ends.
struct ActiveTurn<'a> {
    active: &'a StdMutex<HashSet<i64>>,
    conversation_id: i64,
}

impl<'a> ActiveTurn<'a> {
    fn claim(
        active: &'a StdMutex<HashSet<i64>>,
        conversation_id: i64,
    ) -> Result<Self, TurnError> {
        let mut set = active
            .lock()
            .map_err(|_| TurnError::Busy(conversation_id))?;
        if !set.insert(conversation_id) {
            return Err(TurnError::Busy(conversation_id));
        }
        Ok(Self {
            active,
            conversation_id,
        })
    }
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.active.lock() {
            set.remove(&self.conversation_id);
        }
    }
}

pub struct TurnOrchestrator {
    store: Arc<dyn ConversationStore>,
    backend: Arc<dyn ChatBackend>,
    sink: Arc<dyn TurnEventSink>,
    direct: Arc<dyn ToolDispatcher>,
    code_mode: Option<Arc<dyn ToolDispatcher>>,
    active: StdMutex<HashSet<i64>>,
    system_prompt: String,
}

impl TurnOrchestrator {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn ChatBackend>,
        sink: Arc<dyn TurnEventSink>,
        direct: Arc<dyn ToolDispatcher>,
    ) -> Self {
        Self {
            store,
            backend,
            sink,
            direct,
            code_mode: None,
            active: StdMutex::new(HashSet::new()),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_code_dispatcher(mut self, dispatcher: Arc<dyn ToolDispatcher>) -> Self {
        self.code_mode = Some(dispatcher);
        self
    }

    /// Run one turn to completion.
    ///
    /// Side effects: persists the user message and the assistant message (a
    /// placeholder first, finalized on every exit path), emits progress
    /// events, and may invoke the dispatcher repeatedly.
    pub async fn run_turn(
        &self,
        conversation_id: i64,
        user_text: &str,
        model: &str,
        code_mode: bool,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        let _slot = ActiveTurn::claim(&self.active, conversation_id)?;

        let dispatcher = if code_mode {
            self.code_mode
                .clone()
                .ok_or(TurnError::CodeModeUnavailable)?
        } else {
            self.direct.clone()
        };

        let mut history: Vec<ChatMessage> =
            vec![ChatMessage::new("system", self.system_prompt.clone())];
        for message in self.store.list_messages(conversation_id).await? {
            if message.content.is_empty() {
                continue;
            }
            history.push(ChatMessage::new(message.role, message.content));
        }

        self.store
            .append_message(conversation_id, "user", user_text, None)
            .await?;
        history.push(ChatMessage::new("user", user_text));
        let assistant_id = self
            .store
            .append_message(conversation_id, "assistant", "", Some(model))
            .await?;
        self.sink.emit(TurnEvent::Start {
            message_id: assistant_id,
        });

        // The catalog snapshot for this turn; recomputed each turn so server
        // starts/stops take effect without restart.
        let catalog = dispatcher.catalog().await;
        let tools = translate_tools(&catalog);

        let mut content = String::new();
        let mut usage_totals = Usage::default();
        let mut calls_made = 0usize;

        loop {
            let request = ChatRequest {
                model: model.to_string(),
                messages: history.clone(),
                stream: true,
                tools: tools.clone(),
            };

            let mut stream = tokio::select! {
                opened = self.backend.open_stream(&request) => match opened {
                    Ok(stream) => stream,
                    Err(err) => {
                        return self
                            .fail_turn(assistant_id, content, usage_totals, err)
                            .await;
                    }
                },
                _ = cancel.cancelled() => {
                    return self.cancel_turn(assistant_id, content).await;
                }
            };

            let mut pending_calls: Vec<AssembledToolCall> = Vec::new();
            let stream_error = loop {
                let next = tokio::select! {
                    chunk = stream.next_chunk() => chunk,
                    _ = cancel.cancelled() => {
                        return self.cancel_turn(assistant_id, content).await;
                    }
                };
                match next {
                    Some(Ok(StreamChunk::Content(text))) => {
                        content.push_str(&text);
                        self.sink.emit(TurnEvent::Delta {
                            message_id: assistant_id,
                            text,
                        });
                    }
                    Some(Ok(StreamChunk::Reasoning(text))) => {
                        self.sink.emit(TurnEvent::Reasoning {
                            message_id: assistant_id,
                            text,
                        });
                    }
                    // Assembled calls are remembered; nothing executes until
                    // this iteration's stream is fully drained.
                    Some(Ok(StreamChunk::ToolCall(call))) => pending_calls.push(call),
                    Some(Ok(StreamChunk::Done { usage })) => {
                        if let Some(usage) = usage {
                            usage_totals.accumulate(&usage);
                        }
                        break None;
                    }
                    Some(Err(err)) => break Some(err),
                    None => break None,
                }
            };

            if let Some(err) = stream_error {
                return self
                    .fail_turn(assistant_id, content, usage_totals, err)
                    .await;
            }

            if pending_calls.is_empty() {
                self.store
                    .update_message_content(assistant_id, &content)
                    .await?;
                self.sink.emit(TurnEvent::Done {
                    message_id: assistant_id,
                    usage: Some(usage_totals),
                });
                return Ok(TurnOutcome {
                    assistant_message_id: assistant_id,
                    text: content,
                    usage: usage_totals,
                    stop: StopReason::Completed,
                });
            }

            for call in pending_calls {
                if calls_made >= MAX_TOOL_CALLS {
                    warn!(limit = MAX_TOOL_CALLS, "Tool-call limit reached");
                    content.push_str(TOOL_LIMIT_MARKER);
                    self.store
                        .update_message_content(assistant_id, &content)
                        .await?;
                    self.sink.emit(TurnEvent::Done {
                        message_id: assistant_id,
                        usage: Some(usage_totals),
                    });
                    return Ok(TurnOutcome {
                        assistant_message_id: assistant_id,
                        text: content,
                        usage: usage_totals,
                        stop: StopReason::ToolLimit,
                    });
                }
                calls_made += 1;

                debug!(tool = %call.name, "Executing tool call");
                self.sink.emit(TurnEvent::ToolCallStart {
                    message_id: assistant_id,
                    tool_name: call.name.clone(),
                    args_raw: call.arguments.clone(),
                });

                let executed = self.execute_call(dispatcher.as_ref(), &call, &cancel).await;
                if cancel.is_cancelled() {
                    // The paired ToolCallResult is replaced by the
                    // terminating Done.
                    return self.cancel_turn(assistant_id, content).await;
                }
                let (result_text, success) = match executed {
                    Ok(text) => (text, true),
                    Err(message) => (message, false),
                };

                self.sink.emit(TurnEvent::ToolCallResult {
                    message_id: assistant_id,
                    tool_name: call.name.clone(),
                    result_text: truncate_for_event(&result_text),
                    success,
                });

                history.push(ChatMessage::new(
                    "assistant",
                    format!("[Called {}]", call.name),
                ));
                history.push(ChatMessage::new(
                    "user",
                    format!("Tool result for {}:\n{}", call.name, result_text),
                ));
            }
        }
    }

    /// Run one call through the dispatcher. Failures come back as `Err`
    /// with text the model can react to; the loop continues either way.
    async fn execute_call(
        &self,
        dispatcher: &dyn ToolDispatcher,
        call: &AssembledToolCall,
        cancel: &CancellationToken,
    ) -> Result<String, String> {
        let arguments = if call.arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(&call.arguments) {
                Ok(value) => value,
                Err(err) => {
                    return Err(format!("Error: invalid tool arguments: {err}"));
                }
            }
        };

        match dispatcher.dispatch(&call.name, arguments, cancel).await {
            Ok(result) => Ok(extract_result_text(&result)),
            Err(err) => Err(format!("Error: {err}")),
        }
    }

    async fn cancel_turn(
        &self,
        assistant_id: i64,
        content: String,
    ) -> Result<TurnOutcome, TurnError> {
        debug!(message_id = assistant_id, "Turn cancelled");
        self.store
            .update_message_content(assistant_id, &content)
            .await?;
        self.sink.emit(TurnEvent::Done {
            message_id: assistant_id,
            usage: None,
        });
        Ok(TurnOutcome {
            assistant_message_id: assistant_id,
            text: content,
            usage: Usage::default(),
            stop: StopReason::Cancelled,
        })
    }

    async fn fail_turn(
        &self,
        assistant_id: i64,
        mut content: String,
        usage: Usage,
        err: GatewayError,
    ) -> Result<TurnOutcome, TurnError> {
        warn!(%err, "Chat stream failed; finalizing partial content");
        content.push_str(&format!("\n\n[error: {err}]"));
        self.store
            .update_message_content(assistant_id, &content)
            .await?;
        self.sink.emit(TurnEvent::Done {
            message_id: assistant_id,
            usage: None,
        });
        Ok(TurnOutcome {
            assistant_message_id: assistant_id,
            text: content,
            usage,
            stop: StopReason::StreamError,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Usage;
    use crate::core::events::CollectingSink;
    use crate::core::store::MemoryConversationStore;
    use crate::mcp::ToolDescriptor;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Debug)]
    enum ScriptItem {
        Chunk(StreamChunk),
        Error(GatewayError),
        /// Never resolves; lets tests cancel mid-stream.
        Stall,
    }

    #[derive(Debug)]
    struct ScriptedSource {
        items: VecDeque<ScriptItem>,
    }

    #[async_trait]
    impl crate::core::gateway::ChunkSource for ScriptedSource {
        async fn next_chunk(&mut self) -> Option<Result<StreamChunk, GatewayError>> {
            match self.items.pop_front() {
                Some(ScriptItem::Chunk(chunk)) => Some(Ok(chunk)),
                Some(ScriptItem::Error(err)) => Some(Err(err)),
                Some(ScriptItem::Stall) => {
                    std::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        }
    }

    #[derive(Default)]
    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<ScriptItem>>>,
        requests: Mutex<Vec<Value>>,
    }

    impl ScriptedBackend {
        fn push_stream(&self, items: Vec<ScriptItem>) {
            self.scripts.lock().unwrap().push_back(items);
        }

        fn recorded_requests(&self) -> Vec<Value> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn open_stream(
            &self,
            request: &ChatRequest,
        ) -> Result<Box<dyn crate::core::gateway::ChunkSource>, GatewayError> {
            self.requests
                .lock()
                .unwrap()
                .push(serde_json::to_value(request).unwrap());
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

    struct FakeDispatcher {
        tools: Vec<ToolLocator>,
        results: Mutex<std::collections::HashMap<String, Result<Value, String>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl FakeDispatcher {
        fn new() -> Self {
            Self {
                tools: vec![ToolLocator {
                    server_id: Uuid::nil(),
                    server_name: "test".into(),
                    descriptor: ToolDescriptor {
                        name: "echo".into(),
                        description: Some("Echo text back".into()),
                        input_schema: Some(json!({
                            "type": "object",
                            "properties": {"text": {"type": "string"}}
                        })),
                    },
                }],
                results: Mutex::new(std::collections::HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn succeed_with(&self, tool: &str, text: &str) {
            self.results.lock().unwrap().insert(
                tool.to_string(),
                Ok(json!({"content": [{"type": "text", "text": text}]})),
            );
        }

        fn fail_with(&self, tool: &str, message: &str) {
            self.results
                .lock()
                .unwrap()
                .insert(tool.to_string(), Err(message.to_string()));
        }
    }

    #[async_trait]
    impl ToolDispatcher for FakeDispatcher {
        async fn catalog(&self) -> Vec<ToolLocator> {
            self.tools.clone()
        }

        async fn dispatch(
            &self,
            name: &str,
            arguments: Value,
            _cancel: &CancellationToken,
        ) -> Result<Value, McpError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments));
            match self.results.lock().unwrap().get(name) {
                Some(Ok(value)) => Ok(value.clone()),
                Some(Err(message)) => Err(McpError::Protocol(message.clone())),
                None => Err(McpError::ToolNotFound(name.to_string())),
            }
        }
    }

    struct Harness {
        store: Arc<MemoryConversationStore>,
        backend: Arc<ScriptedBackend>,
        sink: Arc<CollectingSink>,
        dispatcher: Arc<FakeDispatcher>,
        orchestrator: TurnOrchestrator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryConversationStore::default());
        let backend = Arc::new(ScriptedBackend::default());
        let sink = Arc::new(CollectingSink::default());
        let dispatcher = Arc::new(FakeDispatcher::new());
        let orchestrator = TurnOrchestrator::new(
            store.clone(),
            backend.clone(),
            sink.clone(),
            dispatcher.clone(),
        );
        Harness {
            store,
            backend,
            sink,
            dispatcher,
            orchestrator,
        }
    }

    fn content(text: &str) -> ScriptItem {
        ScriptItem::Chunk(StreamChunk::Content(text.into()))
    }

    fn tool_call(name: &str, arguments: &str) -> ScriptItem {
        ScriptItem::Chunk(StreamChunk::ToolCall(AssembledToolCall {
            id: "call_1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }))
    }

    fn done(usage: Option<Usage>) -> ScriptItem {
        ScriptItem::Chunk(StreamChunk::Done { usage })
    }

    #[tokio::test]
    async fn plain_chat_streams_and_persists() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.backend.push_stream(vec![
            content("Hi"),
            content("!"),
            done(Some(Usage {
                input_tokens: 7,
                output_tokens: 2,
                reasoning_tokens: 0,
                total_tokens: 9,
                cost: None,
            })),
        ]);

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "Hello",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Completed);
        assert_eq!(outcome.text, "Hi!");
        assert_eq!(outcome.usage.total_tokens, 9);

        let events = h.sink.events();
        assert!(matches!(events[0], TurnEvent::Start { .. }));
        assert!(matches!(events[1], TurnEvent::Delta { ref text, .. } if text == "Hi"));
        assert!(matches!(events[2], TurnEvent::Delta { ref text, .. } if text == "!"));
        assert!(
            matches!(events[3], TurnEvent::Done { usage: Some(u), .. } if u.total_tokens == 9)
        );

        let messages = h.store.list_messages(conversation).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Hello");
        assert_eq!(messages[1].content, "Hi!");
    }

    #[tokio::test]
    async fn single_tool_call_round_trip() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.dispatcher.succeed_with("echo", "foo");
        h.backend.push_stream(vec![
            tool_call("echo", r#"{"text":"foo"}"#),
            done(None),
        ]);
        h.backend
            .push_stream(vec![content("Result: foo"), done(None)]);

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "echo 'foo'",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "Result: foo");

        let events = h.sink.events();
        assert!(matches!(events[0], TurnEvent::Start { .. }));
        assert!(matches!(
            events[1],
            TurnEvent::ToolCallStart { ref tool_name, .. } if tool_name == "echo"
        ));
        assert!(matches!(
            events[2],
            TurnEvent::ToolCallResult { ref result_text, success: true, .. }
                if result_text == "foo"
        ));
        assert!(matches!(events[3], TurnEvent::Delta { .. }));
        assert!(matches!(events[4], TurnEvent::Done { .. }));

        // The second request carries the synthetic tool exchange.
        let requests = h.backend.recorded_requests();
        assert_eq!(requests.len(), 2);
        let messages = requests[1]["messages"].as_array().unwrap();
        let roles_and_contents: Vec<(String, String)> = messages
            .iter()
            .map(|m| {
                (
                    m["role"].as_str().unwrap().to_string(),
                    m["content"].as_str().unwrap().to_string(),
                )
            })
            .collect();
        assert!(roles_and_contents
            .contains(&("assistant".to_string(), "[Called echo]".to_string())));
        assert!(roles_and_contents
            .iter()
            .any(|(role, content)| role == "user"
                && content.starts_with("Tool result for echo:\nfoo")));

        // The dispatcher saw parsed JSON arguments.
        let calls = h.dispatcher.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, json!({"text": "foo"}));
    }

    #[tokio::test]
    async fn tool_failure_is_recoverable() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.dispatcher.fail_with("echo", "boom");
        h.backend
            .push_stream(vec![tool_call("echo", "{}"), done(None)]);
        h.backend
            .push_stream(vec![content("Recovered."), done(None)]);

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "go",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Completed);
        let events = h.sink.events();
        let failure = events
            .iter()
            .find_map(|event| match event {
                TurnEvent::ToolCallResult {
                    result_text,
                    success,
                    ..
                } => Some((result_text.clone(), *success)),
                _ => None,
            })
            .unwrap();
        assert!(!failure.1);
        assert!(failure.0.starts_with("Error:"));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_finalizes_partial_content() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.backend
            .push_stream(vec![content("Hi"), ScriptItem::Stall]);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcome = h
            .orchestrator
            .run_turn(conversation, "Hello", "test/model", false, cancel)
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::Cancelled);
        assert_eq!(outcome.text, "Hi");

        let events = h.sink.events();
        assert!(matches!(events.last().unwrap(), TurnEvent::Done { usage: None, .. }));
        let deltas = events
            .iter()
            .filter(|event| matches!(event, TurnEvent::Delta { .. }))
            .count();
        assert_eq!(deltas, 1);

        let messages = h.store.list_messages(conversation).await.unwrap();
        assert_eq!(messages[1].content, "Hi");
    }

    #[tokio::test]
    async fn gateway_error_persists_partial_content_with_banner() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.backend.push_stream(vec![
            content("some partial"),
            ScriptItem::Error(GatewayError::Stream("connection reset".into())),
        ]);

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "Hello",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::StreamError);
        assert!(outcome.text.starts_with("some partial"));
        assert!(outcome.text.contains("[error:"));

        let messages = h.store.list_messages(conversation).await.unwrap();
        assert!(messages[1].content.contains("connection reset"));
        assert!(matches!(
            h.sink.events().last().unwrap(),
            TurnEvent::Done { usage: None, .. }
        ));
    }

    #[tokio::test]
    async fn tool_loop_stops_at_limit_with_marker() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.dispatcher.succeed_with("echo", "again");
        for _ in 0..=MAX_TOOL_CALLS {
            h.backend
                .push_stream(vec![tool_call("echo", "{}"), done(None)]);
        }

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "loop forever",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.stop, StopReason::ToolLimit);
        assert!(outcome.text.ends_with("[maximum tool calls reached]"));

        let events = h.sink.events();
        let starts = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolCallStart { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::ToolCallResult { .. }))
            .count();
        assert_eq!(starts, MAX_TOOL_CALLS);
        assert_eq!(starts, results);
    }

    #[tokio::test]
    async fn second_turn_on_same_conversation_is_rejected_while_live() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.backend.push_stream(vec![ScriptItem::Stall]);

        let orchestrator = Arc::new(h.orchestrator);
        let cancel = CancellationToken::new();
        let first = {
            let orchestrator = orchestrator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                orchestrator
                    .run_turn(conversation, "first", "m", false, cancel)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let second = orchestrator
            .run_turn(
                conversation,
                "second",
                "m",
                false,
                CancellationToken::new(),
            )
            .await;
        assert!(matches!(second, Err(TurnError::Busy(id)) if id == conversation));

        cancel.cancel();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn code_mode_without_sandbox_is_unavailable() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        let result = h
            .orchestrator
            .run_turn(conversation, "x", "m", true, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(TurnError::CodeModeUnavailable)));
    }

    #[tokio::test]
    async fn usage_accumulates_across_tool_iterations() {
        let h = harness();
        let conversation = h.store.create_conversation("chat").await.unwrap();
        h.dispatcher.succeed_with("echo", "ok");
        let usage = |input, output| {
            Some(Usage {
                input_tokens: input,
                output_tokens: output,
                reasoning_tokens: 0,
                total_tokens: input + output,
                cost: None,
            })
        };
        h.backend
            .push_stream(vec![tool_call("echo", "{}"), done(usage(10, 5))]);
        h.backend
            .push_stream(vec![content("final"), done(usage(20, 3))]);

        let outcome = h
            .orchestrator
            .run_turn(
                conversation,
                "go",
                "test/model",
                false,
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.usage.input_tokens, 30);
        assert_eq!(outcome.usage.output_tokens, 8);
        assert_eq!(outcome.usage.total_tokens, 38);
    }

    #[test]
    fn tool_translation_defaults_schema_shape() {
        let locators = vec![ToolLocator {
            server_id: Uuid::nil(),
            server_name: "s".into(),
            descriptor: ToolDescriptor {
                name: "t".into(),
                description: None,
                input_schema: Some(json!({"properties": {"a": {"type": "string"}}})),
            },
        }];
        let translated = translate_tools(&locators).unwrap();
        let parameters = &translated[0].function.parameters;
        assert_eq!(parameters["type"], "object");
        assert_eq!(parameters["additionalProperties"], false);
    }

    #[test]
    fn tools_with_empty_names_are_dropped() {
        let locators = vec![ToolLocator {
            server_id: Uuid::nil(),
            server_name: "s".into(),
            descriptor: ToolDescriptor {
                name: "  ".into(),
                description: None,
                input_schema: None,
            },
        }];
        assert!(translate_tools(&locators).is_none());
    }

    #[test]
    fn result_extraction_joins_text_items() {
        let result = json!({
            "content": [
                {"type": "text", "text": "line one"},
                {"type": "image", "data": "zzz"},
                {"type": "text", "text": "line two"},
            ]
        });
        assert_eq!(extract_result_text(&result), "line one\nline two");
    }

    #[test]
    fn result_extraction_falls_back_to_raw_json() {
        let result = json!({"ok": true});
        assert_eq!(extract_result_text(&result), r#"{"ok":true}"#);
    }

    #[test]
    fn event_truncation_respects_char_boundaries() {
        let long = "é".repeat(3000);
        let truncated = truncate_for_event(&long);
        assert!(truncated.len() <= TOOL_RESULT_EVENT_LIMIT + '…'.len_utf8());
        assert!(truncated.ends_with('…'));
    }
}
