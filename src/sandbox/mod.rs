//! Code-mode sandbox.
//!
//! In code mode the model never sees the full tool catalog. It gets two
//! synthetic tools instead: `execute_code` runs a short program inside a
//! synthesized workspace whose generated modules call MCP tools back over a
//! per-execution loopback HTTP bridge, and `search_tools` queries the
//! aggregate catalog at a chosen detail level. Intermediate data stays in
//! the sandbox, not in the model's context.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub mod bridge;
pub mod ident;
pub mod workspace;

use crate::core::turn::ToolDispatcher;
use crate::mcp::{McpError, McpManager, ToolDescriptor, ToolLocator};
use bridge::Bridge;
use uuid::Uuid;
use workspace::{Workspace, BRIDGE_PORT_ENV};

/// Wall-clock limit for one code execution.
pub const EXECUTION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("code runner unavailable: {0}")]
    RunnerMissing(String),

    #[error("workspace not prepared")]
    NotPrepared,
}

impl From<SandboxError> for McpError {
    fn from(err: SandboxError) -> Self {
        McpError::Protocol(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Completed,
    TimedOut,
    Cancelled,
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub output: String,
}

fn default_runner() -> String {
    if cfg!(windows) {
        "node.exe".to_string()
    } else {
        "node".to_string()
    }
}

pub struct CodeSandbox {
    manager: Arc<McpManager>,
    workspace: Mutex<Option<Workspace>>,
    runner: String,
    execution_timeout: Duration,
    run_counter: AtomicU64,
}

impl CodeSandbox {
    pub fn new(manager: Arc<McpManager>) -> Self {
        Self {
            manager,
            workspace: Mutex::new(None),
            runner: default_runner(),
            execution_timeout: EXECUTION_TIMEOUT,
            run_counter: AtomicU64::new(0),
        }
    }

    /// Override the runner executable (platform-specific invocations, tests).
    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Synthesize the workspace once per session; subsequent calls reuse it.
    pub async fn prepare(&self) -> Result<std::path::PathBuf, SandboxError> {
        let mut slot = self.workspace.lock().await;
        if slot.is_none() {
            let catalog = self.manager.all_tools().await;
            debug!(tools = catalog.len(), "Synthesizing code-mode workspace");
            *slot = Some(Workspace::synthesize(&catalog)?);
        }
        slot.as_ref()
            .map(|workspace| workspace.root().to_path_buf())
            .ok_or(SandboxError::NotPrepared)
    }

    /// Delete the workspace. The next execution re-synthesizes it.
    pub async fn cleanup(&self) {
        self.workspace.lock().await.take();
    }

    /// Probe the code runner; returns its version string.
    pub async fn check_runner(&self) -> Result<String, SandboxError> {
        let output = Command::new(&self.runner)
            .arg("--version")
            .output()
            .await
            .map_err(|err| {
                SandboxError::RunnerMissing(format!("'{}' not found: {err}", self.runner))
            })?;
        if !output.status.success() {
            return Err(SandboxError::RunnerMissing(format!(
                "'{}' exited with {}",
                self.runner, output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run one program. The bridge, the temp code file, and the child
    /// process are all torn down on every path out of here.
    pub async fn execute_code(
        &self,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let root = self.prepare().await?;
        let bridge = Bridge::start(self.manager.clone()).await?;

        let run = self.run_counter.fetch_add(1, Ordering::SeqCst);
        let code_path = root.join(format!("run-{run}.mjs"));
        let outcome = match tokio::fs::write(&code_path, code).await {
            Ok(()) => {
                self.run_child(&root, &code_path, bridge.port(), cancel)
                    .await
            }
            Err(err) => Err(SandboxError::Io(err)),
        };

        let _ = tokio::fs::remove_file(&code_path).await;
        bridge.shutdown().await;
        outcome
    }

    async fn run_child(
        &self,
        root: &std::path::Path,
        code_path: &std::path::Path,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let mut command = Command::new(&self.runner);
        command
            .arg(code_path)
            .current_dir(root)
            .env(BRIDGE_PORT_ENV, port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|err| {
            SandboxError::RunnerMissing(format!(
                "failed to spawn '{}': {err}",
                self.runner
            ))
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_stream(stdout));
        let stderr_task = tokio::spawn(read_stream(stderr));

        enum Waited {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status?),
            _ = tokio::time::sleep(self.execution_timeout) => Waited::TimedOut,
            _ = cancel.cancelled() => Waited::Cancelled,
        };
        match waited {
            Waited::Exited(_) => {}
            Waited::TimedOut => {
                warn!(
                    timeout_secs = self.execution_timeout.as_secs(),
                    "Code execution timed out"
                );
                kill_tree(&mut child).await;
            }
            Waited::Cancelled => {
                debug!("Code execution cancelled");
                kill_tree(&mut child).await;
            }
        }

        let stdout_text = stdout_task.await.unwrap_or_default();
        let stderr_text = filter_stderr(&stderr_task.await.unwrap_or_default());

        match waited {
            Waited::TimedOut => Ok(ExecutionOutcome {
                status: ExecutionStatus::TimedOut,
                output: format!(
                    "Error: execution timed out after {} seconds",
                    self.execution_timeout.as_secs()
                ),
            }),
            Waited::Cancelled => Ok(ExecutionOutcome {
                status: ExecutionStatus::Cancelled,
                output: String::new(),
            }),
            Waited::Exited(status) => {
                let mut output = stdout_text;
                if !stderr_text.is_empty() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&stderr_text);
                }
                if !status.success() {
                    if !output.is_empty() {
                        output.push('\n');
                    }
                    output.push_str(&format!("[exit status: {status}]"));
                }
                Ok(ExecutionOutcome {
                    status: ExecutionStatus::Completed,
                    output,
                })
            }
        }
    }
}

async fn read_stream<R>(reader: Option<R>) -> String
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buffer = Vec::new();
    let _ = reader.read_to_end(&mut buffer).await;
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Kill the runner and everything it spawned, then reap.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        // The child was put in its own process group at spawn.
        let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Drop known-benign runner warnings from captured stderr.
fn filter_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| {
            !line.contains("ExperimentalWarning") && !line.contains("--trace-warnings")
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Detail level for catalog searches from code mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetailLevel {
    Name,
    Description,
    Full,
}

impl DetailLevel {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "name" => DetailLevel::Name,
            "full" => DetailLevel::Full,
            _ => DetailLevel::Description,
        }
    }
}

/// Search the aggregate catalog. An empty query lists everything.
pub fn search_tools(catalog: &[ToolLocator], query: &str, detail: DetailLevel) -> String {
    let needle = query.to_lowercase();
    let matches: Vec<&ToolLocator> = catalog
        .iter()
        .filter(|locator| {
            needle.is_empty()
                || locator.descriptor.name.to_lowercase().contains(&needle)
                || locator.server_name.to_lowercase().contains(&needle)
                || locator
                    .descriptor
                    .description
                    .as_deref()
                    .is_some_and(|text| text.to_lowercase().contains(&needle))
        })
        .collect();

    if matches.is_empty() {
        return format!("No tools matched '{query}'.");
    }

    matches
        .iter()
        .map(|locator| match detail {
            DetailLevel::Name => {
                format!("{}.{}", locator.server_name, locator.descriptor.name)
            }
            DetailLevel::Description => format!(
                "{}.{} - {}",
                locator.server_name,
                locator.descriptor.name,
                locator.descriptor.description.as_deref().unwrap_or("(no description)")
            ),
            DetailLevel::Full => format!(
                "{}.{} - {}\n  schema: {}",
                locator.server_name,
                locator.descriptor.name,
                locator.descriptor.description.as_deref().unwrap_or("(no description)"),
                locator
                    .descriptor
                    .input_schema
                    .as_ref()
                    .map(|schema| schema.to_string())
                    .unwrap_or_else(|| "{}".to_string())
            ),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// The two synthetic tools code mode exposes instead of the full catalog.
pub struct CodeModeDispatcher {
    sandbox: Arc<CodeSandbox>,
    manager: Arc<McpManager>,
}

impl CodeModeDispatcher {
    pub fn new(sandbox: Arc<CodeSandbox>, manager: Arc<McpManager>) -> Self {
        Self { sandbox, manager }
    }

    fn synthetic(name: &str, description: &str, schema: Value) -> ToolLocator {
        ToolLocator {
            server_id: Uuid::nil(),
            server_name: "code-mode".to_string(),
            descriptor: ToolDescriptor {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema: Some(schema),
            },
        }
    }
}

#[async_trait]
impl ToolDispatcher for CodeModeDispatcher {
    async fn catalog(&self) -> Vec<ToolLocator> {
        vec![
            Self::synthetic(
                "execute_code",
                "Run a short JavaScript (ES module) program in a workspace where \
                 each MCP tool is an importable function under ./servers/<server>/. \
                 Top-level await is available; whatever the program prints to \
                 stdout is returned.",
                json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "Program source"}
                    },
                    "required": ["code"]
                }),
            ),
            Self::synthetic(
                "search_tools",
                "Search the available MCP tools by name or description.",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "detail_level": {
                            "type": "string",
                            "enum": ["name", "description", "full"]
                        }
                    },
                    "required": ["query"]
                }),
            ),
        ]
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        match name {
            "execute_code" => {
                let code = arguments
                    .get("code")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        McpError::Protocol("execute_code requires a 'code' string".into())
                    })?;
                let outcome = self.sandbox.execute_code(code, cancel).await?;
                match outcome.status {
                    ExecutionStatus::Completed => Ok(json!({
                        "content": [{"type": "text", "text": outcome.output}]
                    })),
                    ExecutionStatus::TimedOut => Err(McpError::Timeout),
                    ExecutionStatus::Cancelled => Err(McpError::Cancelled),
                }
            }
            "search_tools" => {
                let query = arguments
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        McpError::Protocol("search_tools requires a 'query' string".into())
                    })?;
                let detail = arguments
                    .get("detail_level")
                    .and_then(Value::as_str)
                    .map(DetailLevel::parse)
                    .unwrap_or(DetailLevel::Description);
                let catalog = self.manager.all_tools().await;
                let text = search_tools(&catalog, query, detail);
                Ok(json!({"content": [{"type": "text", "text": text}]}))
            }
            other => Err(McpError::ToolNotFound(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::secrets::MemorySecretStore;
    use std::path::PathBuf;
    use std::time::Instant;

    fn empty_manager() -> Arc<McpManager> {
        McpManager::new(
            PathBuf::from("/nonexistent/mcp.json"),
            Arc::new(MemorySecretStore::default()),
        )
    }

    fn sh_sandbox() -> CodeSandbox {
        CodeSandbox::new(empty_manager()).with_runner("sh")
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_captures_stdout() {
        let sandbox = sh_sandbox();
        let outcome = sandbox
            .execute_code("echo hi", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert_eq!(outcome.output.trim(), "hi");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_reported_in_output() {
        let sandbox = sh_sandbox();
        let outcome = sandbox
            .execute_code("echo oops >&2; exit 3", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
        assert!(outcome.output.contains("oops"));
        assert!(outcome.output.contains("[exit status:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let sandbox = sh_sandbox().with_execution_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let outcome = sandbox
            .execute_code("sleep 30", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(outcome.output.contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let sandbox = sh_sandbox();
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let outcome = sandbox.execute_code("sleep 30", &cancel).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let sandbox = sh_sandbox();
        let first = sandbox.prepare().await.unwrap();
        let second = sandbox.prepare().await.unwrap();
        assert_eq!(first, second);
        sandbox.cleanup().await;
        assert!(!first.exists());
    }

    #[tokio::test]
    async fn missing_runner_is_a_typed_error() {
        let sandbox =
            CodeSandbox::new(empty_manager()).with_runner("/definitely/not/a/runner");
        let err = sandbox.check_runner().await.unwrap_err();
        assert!(matches!(err, SandboxError::RunnerMissing(_)));
    }

    #[test]
    fn stderr_filter_drops_benign_warnings() {
        let filtered = filter_stderr(
            "(node:1) ExperimentalWarning: fetch is experimental\n\
             (Use `node --trace-warnings ...` to show where)\n\
             real error here",
        );
        assert_eq!(filtered, "real error here");
    }

    fn sample_catalog() -> Vec<ToolLocator> {
        vec![ToolLocator {
            server_id: Uuid::nil(),
            server_name: "files".into(),
            descriptor: ToolDescriptor {
                name: "read_file".into(),
                description: Some("Read a file from disk".into()),
                input_schema: Some(json!({"type": "object"})),
            },
        }]
    }

    #[test]
    fn search_matches_name_and_description() {
        let catalog = sample_catalog();
        let by_name = search_tools(&catalog, "read", DetailLevel::Name);
        assert_eq!(by_name, "files.read_file");

        let by_description = search_tools(&catalog, "disk", DetailLevel::Description);
        assert!(by_description.contains("Read a file from disk"));

        let nothing = search_tools(&catalog, "zebra", DetailLevel::Name);
        assert!(nothing.starts_with("No tools matched"));
    }

    #[test]
    fn full_detail_includes_schema() {
        let catalog = sample_catalog();
        let full = search_tools(&catalog, "", DetailLevel::Full);
        assert!(full.contains("schema:"));
        assert!(full.contains("object"));
    }

    #[tokio::test]
    async fn code_mode_catalog_is_exactly_two_tools() {
        let sandbox = Arc::new(sh_sandbox());
        let dispatcher = CodeModeDispatcher::new(sandbox, empty_manager());
        let catalog = dispatcher.catalog().await;
        let names: Vec<&str> = catalog
            .iter()
            .map(|locator| locator.descriptor.name.as_str())
            .collect();
        assert_eq!(names, vec!["execute_code", "search_tools"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dispatcher_routes_execute_code_to_the_sandbox() {
        let sandbox = Arc::new(sh_sandbox());
        let dispatcher = CodeModeDispatcher::new(sandbox, empty_manager());
        let result = dispatcher
            .dispatch(
                "execute_code",
                json!({"code": "echo from-sandbox"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("from-sandbox"));
    }

    #[tokio::test]
    async fn dispatcher_rejects_unknown_synthetic_tools() {
        let sandbox = Arc::new(sh_sandbox());
        let dispatcher = CodeModeDispatcher::new(sandbox, empty_manager());
        let err = dispatcher
            .dispatch("rm_rf", json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolNotFound(_)));
    }
}
