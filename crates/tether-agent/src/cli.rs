//! Agent CLI subprocess speaking newline-delimited `stream-json`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use tether_core::agent::{
    AgentRequest, PermissionDecision, ProviderStream, ToolApprover, UpstreamAgent,
};
use tether_core::errors::UpstreamError;
use tether_core::ids::ToolUseId;
use tether_core::prompt::PromptContent;
use tether_core::provider::ProviderEvent;

const STDERR_TAIL_LINES: usize = 20;
const STDERR_DRAIN: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct CliAgentConfig {
    /// Explicit executable. When unset, `program` is searched on `PATH`.
    pub binary: Option<PathBuf>,
    pub program: String,
    /// Environment variable that points the agent at its config directory.
    pub config_dir_env: String,
    /// Environment applied before each request's own map.
    pub base_env: HashMap<String, String>,
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self {
            binary: None,
            program: "claude".to_string(),
            config_dir_env: "CLAUDE_CONFIG_DIR".to_string(),
            base_env: HashMap::new(),
        }
    }
}

pub struct CliAgent {
    config: CliAgentConfig,
}

impl CliAgent {
    pub fn new(config: CliAgentConfig) -> Self {
        Self { config }
    }

    /// Locate the executable, or fail with `ExecutableNotFound`.
    pub fn resolve_binary(&self) -> Result<PathBuf, UpstreamError> {
        if let Some(path) = &self.config.binary {
            return if path.is_file() {
                Ok(path.clone())
            } else {
                Err(UpstreamError::ExecutableNotFound(path.display().to_string()))
            };
        }
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(&self.config.program))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| UpstreamError::ExecutableNotFound(self.config.program.clone()))
    }

    fn args(request: &AgentRequest) -> Vec<String> {
        let mut args: Vec<String> = [
            "--output-format",
            "stream-json",
            "--input-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--permission-prompt-tool",
            "stdio",
            "--permission-mode",
            request.permission_mode.as_flag(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if let Some(session) = &request.resume_session_id {
            args.extend(["--resume".to_string(), session.to_string()]);
        }
        if let Some(model) = &request.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        args
    }
}

// ── Stdin messages ──

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StdinMessage<'a> {
    User {
        message: UserPayload<'a>,
    },
    ControlResponse {
        response: ControlResponse,
    },
}

#[derive(Serialize)]
struct UserPayload<'a> {
    role: &'static str,
    content: &'a PromptContent,
}

#[derive(Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlResponse {
    Success {
        request_id: String,
        response: PermissionDecision,
    },
}

fn encode(msg: &StdinMessage<'_>) -> Result<String, UpstreamError> {
    let mut line = serde_json::to_string(msg).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

#[async_trait]
impl UpstreamAgent for CliAgent {
    fn name(&self) -> &str {
        "cli"
    }

    #[instrument(skip(self, request, approver), fields(sub_chat_id = %request.sub_chat_id))]
    async fn open(
        &self,
        request: AgentRequest,
        approver: Arc<dyn ToolApprover>,
    ) -> Result<ProviderStream, UpstreamError> {
        let binary = self.resolve_binary()?;
        std::fs::create_dir_all(&request.config_dir).map_err(|e| UpstreamError::Io(e.to_string()))?;

        let mut command = Command::new(&binary);
        command
            .args(Self::args(&request))
            .current_dir(&request.working_directory)
            .envs(&self.config.base_env)
            .envs(&request.env)
            .env(&self.config.config_dir_env, &request.config_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(binary = %binary.display(), cwd = %request.working_directory.display(), "spawning agent");

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => UpstreamError::ExecutableNotFound(binary.display().to_string()),
            _ => UpstreamError::Spawn(e.to_string()),
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| UpstreamError::Spawn("no stdin on child".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| UpstreamError::Spawn("no stdout on child".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "agent stderr");
                    let mut tail = tail.lock();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            })
        });

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(32);
        stdin_tx
            .send(encode(&StdinMessage::User {
                message: UserPayload {
                    role: "user",
                    content: &request.prompt,
                },
            })?)
            .await
            .map_err(|_| UpstreamError::Spawn("agent stdin closed".into()))?;
        tokio::spawn(stdin_writer(stdin, stdin_rx));

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(read_events(ReadLoop {
            child,
            stdout,
            stdin_tx,
            events: tx,
            approver,
            cancel: request.cancel.clone(),
            stderr_tail,
            stderr_task,
        }));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn stdin_writer(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!(error = %e, "agent stdin write failed");
            return;
        }
        if let Err(e) = stdin.flush().await {
            debug!(error = %e, "agent stdin flush failed");
            return;
        }
    }
}

struct ReadLoop {
    child: Child,
    stdout: ChildStdout,
    stdin_tx: mpsc::Sender<String>,
    events: mpsc::Sender<Result<ProviderEvent, UpstreamError>>,
    approver: Arc<dyn ToolApprover>,
    cancel: CancellationToken,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

async fn read_events(state: ReadLoop) {
    let ReadLoop {
        mut child,
        stdout,
        stdin_tx,
        events,
        approver,
        cancel,
        stderr_tail,
        stderr_task,
    } = state;
    let mut lines = BufReader::new(stdout).lines();
    let mut stdin_tx = Some(stdin_tx);
    let mut saw_result = false;

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("turn cancelled, killing agent");
                let _ = child.start_kill();
                return;
            }
            line = lines.next_line() => line,
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(Err(UpstreamError::Io(e.to_string()))).await;
                let _ = child.start_kill();
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let raw: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "skipping non-JSON agent output");
                continue;
            }
        };

        if raw.get("type").and_then(Value::as_str) == Some("control_request") {
            if let Some(tx) = &stdin_tx {
                spawn_permission_answer(&raw, approver.clone(), tx.clone());
            }
            continue;
        }

        let event = match serde_json::from_value::<ProviderEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "skipping malformed agent event");
                continue;
            }
        };
        let is_result = matches!(event, ProviderEvent::Result(_));
        if events.send(Ok(event)).await.is_err() {
            let _ = child.start_kill();
            return;
        }
        if is_result {
            saw_result = true;
            // Closing stdin lets the CLI exit once the turn is over.
            stdin_tx = None;
        }
    }

    drop(stdin_tx);
    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            return;
        }
        status = child.wait() => status,
    };
    match status {
        Ok(status) if !status.success() && !saw_result => {
            // Let the stderr reader drain so the tail is complete.
            if let Some(task) = stderr_task {
                let _ = tokio::time::timeout(STDERR_DRAIN, task).await;
            }
            let stderr = stderr_tail.lock().iter().cloned().collect::<Vec<_>>().join("\n");
            let _ = events
                .send(Err(UpstreamError::ProcessExited {
                    code: status.code(),
                    stderr,
                }))
                .await;
        }
        Ok(_) => {}
        Err(e) => {
            let _ = events.send(Err(UpstreamError::Io(e.to_string()))).await;
        }
    }
}

/// Answer a `can_use_tool` control request through the approver. Runs off the
/// read loop so streaming continues while a human decides.
fn spawn_permission_answer(raw: &Value, approver: Arc<dyn ToolApprover>, stdin: mpsc::Sender<String>) {
    let Some(request) = raw.get("request") else {
        return;
    };
    let subtype = request.get("subtype").and_then(Value::as_str).unwrap_or("");
    if subtype != "can_use_tool" {
        debug!(subtype, "unhandled control request");
        return;
    }
    let request_id = raw
        .get("request_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let tool_name = request
        .get("tool_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let input = request.get("input").cloned().unwrap_or(Value::Null);
    let tool_use_id = request
        .get("tool_use_id")
        .and_then(Value::as_str)
        .map(ToolUseId::from_raw)
        .unwrap_or_default();

    tokio::spawn(async move {
        let decision = approver.can_use_tool(&tool_name, &input, &tool_use_id).await;
        debug!(tool_use_id = %tool_use_id, allowed = decision.is_allowed(), "answering permission request");
        let msg = StdinMessage::ControlResponse {
            response: ControlResponse::Success {
                request_id,
                response: decision,
            },
        };
        match encode(&msg) {
            Ok(line) => {
                let _ = stdin.send(line).await;
            }
            Err(e) => warn!(error = %e, "failed to encode permission answer"),
        }
    });
}
