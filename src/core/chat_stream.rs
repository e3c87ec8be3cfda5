//! Streaming chat-completions decoding.
//!
//! The gateway answers with server-sent events whose payloads are
//! OpenAI-compatible delta frames. [`ChatStreamParser`] is the pure state
//! machine over individual lines; [`ChatStream`] drives it from a live
//! response body and yields typed [`StreamChunk`]s.
//!
//! Tool-call arguments stream as a sequence of JSON text fragments that must
//! be concatenated verbatim; they are never parsed until assembly is
//! complete.

use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use memchr::memchr;
use tracing::debug;

use crate::api::{ChatResponse, ChatToolCallDelta, Usage};
use crate::core::gateway::{ChunkSource, GatewayError};

/// One typed fragment of a model response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Content(String),
    Reasoning(String),
    ToolCall(AssembledToolCall),
    Done { usage: Option<Usage> },
}

/// A fully accumulated tool-call intent.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Line-level parser state. Feed it SSE lines; collect chunks.
#[derive(Default)]
pub struct ChatStreamParser {
    pending_calls: BTreeMap<u32, PendingToolCall>,
    usage: Option<Usage>,
    emitted_done: bool,
}

impl ChatStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one SSE line. Lines that are blank, comments, or not `data:`
    /// fields produce nothing.
    pub fn feed_line(&mut self, line: &str) -> Vec<StreamChunk> {
        if self.emitted_done {
            return Vec::new();
        }
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') {
            return Vec::new();
        }
        let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
            return Vec::new();
        };

        if payload == "[DONE]" {
            return self.emit_done();
        }

        let response = match serde_json::from_str::<ChatResponse>(payload) {
            Ok(response) => response,
            Err(err) => {
                debug!(%err, payload, "Skipping unparseable stream frame");
                return Vec::new();
            }
        };

        if let Some(wire) = response.usage {
            self.usage = Some(Usage::from(wire));
        }

        let mut chunks = Vec::new();
        let Some(choice) = response.choices.into_iter().next() else {
            // Frames without choices exist only to carry trailing usage.
            return chunks;
        };

        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                chunks.push(StreamChunk::Content(content));
            }
        }
        if let Some(reasoning) = choice.delta.reasoning {
            if !reasoning.is_empty() {
                chunks.push(StreamChunk::Reasoning(reasoning));
            }
        }
        if let Some(deltas) = choice.delta.tool_calls {
            for delta in deltas {
                self.append_tool_call_delta(delta);
            }
        }

        match choice.finish_reason.as_deref() {
            Some("tool_calls") => chunks.extend(self.assemble_tool_calls()),
            Some(_) => {
                // stop, length, content_filter... no tool call is emitted;
                // the terminal Done follows at [DONE] or stream end.
                self.pending_calls.clear();
            }
            None => {}
        }

        chunks
    }

    /// The stream ended without a `[DONE]` terminator; close out.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        self.emit_done()
    }

    fn emit_done(&mut self) -> Vec<StreamChunk> {
        if self.emitted_done {
            return Vec::new();
        }
        self.emitted_done = true;
        vec![StreamChunk::Done {
            usage: self.usage.take(),
        }]
    }

    fn append_tool_call_delta(&mut self, delta: ChatToolCallDelta) {
        let entry = self
            .pending_calls
            .entry(delta.index.unwrap_or(0))
            .or_default();
        if delta.id.is_some() {
            entry.id = delta.id;
        }
        if let Some(function) = delta.function {
            if function.name.is_some() {
                entry.name = function.name;
            }
            if let Some(arguments) = function.arguments {
                entry.arguments.push_str(&arguments);
            }
        }
    }

    fn assemble_tool_calls(&mut self) -> Vec<StreamChunk> {
        let pending = std::mem::take(&mut self.pending_calls);
        pending
            .into_values()
            .filter_map(|call| {
                let name = call.name?;
                if name.is_empty() {
                    return None;
                }
                Some(StreamChunk::ToolCall(AssembledToolCall {
                    id: call.id.unwrap_or_default(),
                    name,
                    arguments: call.arguments,
                }))
            })
            .collect()
    }
}

/// Pull-shaped chunk stream over a live gateway response.
pub struct ChatStream {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buffer: Vec<u8>,
    parser: ChatStreamParser,
    queued: VecDeque<StreamChunk>,
    finished: bool,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("buffer_len", &self.buffer.len())
            .field("queued", &self.queued)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ChatStream {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            body: Box::pin(response.bytes_stream()),
            buffer: Vec::new(),
            parser: ChatStreamParser::new(),
            queued: VecDeque::new(),
            finished: false,
        }
    }

    fn drain_buffer_lines(&mut self) {
        while let Some(newline_pos) = memchr(b'\n', &self.buffer) {
            if let Ok(line) = std::str::from_utf8(&self.buffer[..newline_pos]) {
                let chunks = self.parser.feed_line(line.trim_end_matches('\r'));
                self.queued.extend(chunks);
            }
            self.buffer.drain(..=newline_pos);
        }
    }
}

#[async_trait::async_trait]
impl ChunkSource for ChatStream {
    async fn next_chunk(&mut self) -> Option<Result<StreamChunk, GatewayError>> {
        loop {
            if let Some(chunk) = self.queued.pop_front() {
                if matches!(chunk, StreamChunk::Done { .. }) {
                    self.finished = true;
                }
                return Some(Ok(chunk));
            }
            if self.finished {
                return None;
            }

            match self.body.next().await {
                Some(Ok(bytes)) => {
                    self.buffer.extend_from_slice(&bytes);
                    self.drain_buffer_lines();
                }
                Some(Err(err)) => {
                    self.finished = true;
                    return Some(Err(GatewayError::Stream(err.to_string())));
                }
                None => {
                    if !self.buffer.is_empty() {
                        if let Ok(line) = String::from_utf8(std::mem::take(&mut self.buffer)) {
                            let chunks = self.parser.feed_line(line.trim_end_matches('\r'));
                            self.queued.extend(chunks);
                        }
                    }
                    let chunks = self.parser.finish();
                    self.queued.extend(chunks);
                    if self.queued.is_empty() {
                        self.finished = true;
                        return None;
                    }
                }
            }
        }
    }
}
