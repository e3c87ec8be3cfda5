//! Streamable HTTP transport: a single endpoint that accepts JSON-RPC via
//! POST and answers with either a JSON body or an SSE stream.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::sse::{SseEventParser, SseLineBuffer};
use super::{InboundFrame, Transport};
use crate::mcp::logs::ConnectionLogs;
use crate::mcp::McpError;

const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";
const SESSION_ID_HEADER: &str = "mcp-session-id";
const CONNECT_TIMEOUT_SECONDS: u64 = 10;

pub struct StreamableHttpTransport {
    http: reqwest::Client,
    url: String,
    auth_header: Option<String>,
    session_id: StdMutex<Option<String>>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    logs: ConnectionLogs,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(
        url: String,
        auth_header: Option<String>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        logs: ConnectionLogs,
    ) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| McpError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            http,
            url,
            auth_header,
            session_id: StdMutex::new(None),
            inbound,
            logs,
            cancel: CancellationToken::new(),
        })
    }

    fn session(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn store_session(&self, session_id: String) {
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = Some(session_id);
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn send(&self, payload: String) -> Result<(), McpError> {
        if self.cancel.is_cancelled() {
            return Err(McpError::Transport("transport closed".into()));
        }

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .body(payload);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        if let Some(session_id) = self.session() {
            request = request.header(SESSION_ID_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|err| McpError::Transport(format!("HTTP request failed: {err}")))?;

        if let Some(session_id) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            self.store_session(session_id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.logs.push(format!("[http {status}] {body}"));
            return Err(McpError::Transport(format!("HTTP error: {status}")));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            // The response body is a stream of events; the matching JSON-RPC
            // response is one of them. Consume to completion in the
            // background so concurrent RPCs are not serialized behind it.
            let inbound = self.inbound.clone();
            let logs = self.logs.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                let mut body = response.bytes_stream();
                let mut lines = SseLineBuffer::default();
                let mut events = SseEventParser::default();
                loop {
                    let chunk = tokio::select! {
                        chunk = body.next() => chunk,
                        _ = cancel.cancelled() => break,
                    };
                    let Some(chunk) = chunk else { break };
                    let Ok(chunk) = chunk else {
                        logs.push("[sse] response stream failed".to_string());
                        break;
                    };
                    for line in lines.push(&chunk) {
                        if let Some(event) = events.feed_line(&line) {
                            handle_event(event, &inbound, &logs);
                        }
                    }
                }
                for line in lines.finish() {
                    if let Some(event) = events.feed_line(&line) {
                        handle_event(event, &inbound, &logs);
                    }
                }
                if let Some(event) = events.finish() {
                    handle_event(event, &inbound, &logs);
                }
            });
        } else {
            let value = response
                .json::<Value>()
                .await
                .map_err(|err| McpError::Transport(format!("invalid JSON response: {err}")))?;
            debug!(url = %self.url, "Received MCP HTTP response");
            let _ = self.inbound.send(InboundFrame::Message(value));
        }

        Ok(())
    }

    async fn dispose(&self) {
        self.cancel.cancel();
    }
}

fn handle_event(
    event: super::sse::SseEvent,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
    logs: &ConnectionLogs,
) {
    // Per the SSE spec a missing event name means "message".
    match event.name.as_deref() {
        None | Some("message") | Some("") => {
            super::route_inbound_payload(&event.data, inbound, logs);
        }
        Some(other) => logs.push(format!("[sse event {other}] {}", event.data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_with_ids_are_routed_inbound() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = ConnectionLogs::new();
        crate::mcp::transport::route_inbound_payload(
            r#"{"jsonrpc":"2.0","id":3,"result":{"tools":[]}}"#,
            &tx,
            &logs,
        );
        match rx.try_recv() {
            Ok(InboundFrame::Message(value)) => assert_eq!(value["id"], 3),
            other => panic!("expected inbound message, got {other:?}"),
        }
        assert_eq!(logs.len(), 0);
    }

    #[test]
    fn notifications_are_logged_not_correlated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = ConnectionLogs::new();
        crate::mcp::transport::route_inbound_payload(
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{}}"#,
            &tx,
            &logs,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(logs.len(), 1);
    }

    #[test]
    fn named_non_message_events_only_log() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = ConnectionLogs::new();
        handle_event(
            super::super::sse::SseEvent {
                name: Some("ping".into()),
                data: "{}".into(),
            },
            &tx,
            &logs,
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(logs.len(), 1);
    }
}
