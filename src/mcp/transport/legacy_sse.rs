//! Legacy SSE transport: a long-lived GET event stream for server-to-client
//! messages paired with a POST endpoint for requests.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::sse::{SseEventParser, SseLineBuffer};
use super::{InboundFrame, Transport};
use crate::mcp::logs::ConnectionLogs;
use crate::mcp::McpError;

const CONNECT_TIMEOUT_SECONDS: u64 = 10;
const ENDPOINT_WAIT_SECONDS: u64 = 10;

pub struct LegacySseTransport {
    http: reqwest::Client,
    base_url: String,
    auth_header: Option<String>,
    endpoint: Arc<StdMutex<Option<String>>>,
    cancel: CancellationToken,
}

impl LegacySseTransport {
    /// Open the `{url}/sse` stream and wait for the server to announce its
    /// session endpoint before the transport is considered usable.
    pub async fn connect(
        base_url: String,
        auth_header: Option<String>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        logs: ConnectionLogs,
    ) -> Result<Self, McpError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| McpError::Transport(format!("failed to build HTTP client: {err}")))?;

        let mut request = http
            .get(server_url(&base_url, "sse"))
            .header("Accept", "text/event-stream");
        if let Some(auth) = &auth_header {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|err| McpError::Transport(format!("SSE connect failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("SSE connect failed: {status}")));
        }

        let endpoint = Arc::new(StdMutex::new(None));
        let cancel = CancellationToken::new();
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        {
            let endpoint = endpoint.clone();
            let cancel = cancel.clone();
            let logs = logs.clone();
            tokio::spawn(async move {
                let mut endpoint_tx = Some(endpoint_tx);
                let mut body = response.bytes_stream();
                let mut lines = SseLineBuffer::default();
                let mut events = SseEventParser::default();
                loop {
                    let chunk = tokio::select! {
                        chunk = body.next() => chunk,
                        _ = cancel.cancelled() => {
                            let _ = inbound.send(InboundFrame::Closed {
                                reason: "transport disposed".to_string(),
                            });
                            return;
                        }
                    };
                    let Some(chunk) = chunk else { break };
                    let Ok(chunk) = chunk else { break };
                    for line in lines.push(&chunk) {
                        let Some(event) = events.feed_line(&line) else {
                            continue;
                        };
                        match event.name.as_deref() {
                            Some("endpoint") => {
                                debug!(endpoint = %event.data, "Legacy SSE session endpoint");
                                if let Ok(mut guard) = endpoint.lock() {
                                    *guard = Some(event.data.clone());
                                }
                                if let Some(tx) = endpoint_tx.take() {
                                    let _ = tx.send(event.data);
                                }
                            }
                            None | Some("message") | Some("") => {
                                super::route_inbound_payload(&event.data, &inbound, &logs);
                            }
                            Some(other) => {
                                logs.push(format!("[sse event {other}] {}", event.data));
                            }
                        }
                    }
                }
                let _ = inbound.send(InboundFrame::Closed {
                    reason: "event stream ended".to_string(),
                });
            });
        }

        match tokio::time::timeout(Duration::from_secs(ENDPOINT_WAIT_SECONDS), endpoint_rx).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                cancel.cancel();
                return Err(McpError::Transport(
                    "event stream closed before announcing an endpoint".into(),
                ));
            }
            Err(_) => {
                cancel.cancel();
                return Err(McpError::Transport(
                    "timed out waiting for the session endpoint".into(),
                ));
            }
        }

        Ok(Self {
            http,
            base_url,
            auth_header,
            endpoint,
            cancel,
        })
    }

    /// Where requests are POSTed. The endpoint event may announce a full
    /// URL, an absolute path on the same origin, or nothing useful, in which
    /// case the conventional `{url}/message` is used.
    fn post_target(&self) -> String {
        let announced = self.endpoint.lock().ok().and_then(|guard| guard.clone());
        match announced {
            Some(value) if value.starts_with("http://") || value.starts_with("https://") => value,
            Some(value) if value.starts_with('/') => {
                format!("{}{}", origin_of(&self.base_url), value)
            }
            _ => server_url(&self.base_url, "message"),
        }
    }
}

/// Join a well-known path segment onto the configured server URL,
/// tolerating trailing slashes in the config.
fn server_url(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

/// Scheme + authority of a URL, without the path.
fn origin_of(url: &str) -> String {
    if let Some(scheme_end) = url.find("://") {
        let rest = &url[scheme_end + 3..];
        match rest.find('/') {
            Some(path_start) => url[..scheme_end + 3 + path_start].to_string(),
            None => url.to_string(),
        }
    } else {
        url.trim_end_matches('/').to_string()
    }
}

#[async_trait]
impl Transport for LegacySseTransport {
    async fn send(&self, payload: String) -> Result<(), McpError> {
        if self.cancel.is_cancelled() {
            return Err(McpError::Transport("transport closed".into()));
        }

        let mut request = self
            .http
            .post(self.post_target())
            .header("Content-Type", "application/json")
            .body(payload);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }

        let response = request
            .send()
            .await
            .map_err(|err| McpError::Transport(format!("HTTP request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::Transport(format!("HTTP error: {status}")));
        }
        // The acknowledgement body is irrelevant; the JSON-RPC response
        // arrives on the event stream.
        let _ = response.bytes().await;
        Ok(())
    }

    async fn dispose(&self) {
        self.cancel.cancel();
    }
}
