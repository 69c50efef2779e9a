//! Content-Length framed protocol transport over a debug adapter's stdio.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};

use crate::{BridgeError, Result};

/// Environment variable overriding the `node` executable used to run the adapter.
pub const NODE_ENV: &str = "AGENTIC_DEBUG_NODE";

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every event message the adapter sends.
pub type MessageSink = Arc<dyn Fn(Value) + Send + Sync>;
/// Runs once when the adapter's output stream ends.
pub type ExitSink = Arc<dyn Fn() + Send + Sync>;

/// Starts an adapter in the given working directory.
pub type ProcessFactory =
    Arc<dyn Fn(Option<PathBuf>, MessageSink, ExitSink) -> Result<AdapterProcess> + Send + Sync>;

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl AdapterCommand {
    /// `node <adapter_path>`, honoring [`NODE_ENV`].
    pub fn node(adapter_path: &Path) -> Self {
        let node = std::env::var(NODE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "node".to_string());
        Self {
            program: PathBuf::from(node),
            args: vec![adapter_path.to_string_lossy().into_owned()],
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Factory that spawns `command`, overriding its working directory when one is given.
pub fn command_factory(command: AdapterCommand) -> ProcessFactory {
    Arc::new(move |cwd, on_event, on_exit| {
        let command = match cwd {
            Some(cwd) => command.clone().with_cwd(cwd),
            None => command.clone(),
        };
        AdapterProcess::spawn(&command, on_event, on_exit)
    })
}

/// Arguments for the protocol `initialize` request.
pub fn initialize_arguments(adapter_id: &str) -> Value {
    json!({
        "adapterID": adapter_id,
        "clientID": "agentic-debug",
        "clientName": "Agentic Debug",
        "locale": "en-US",
        "pathFormat": "path",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "supportsVariableType": true,
        "supportsVariablePaging": true,
        "supportsRunInTerminalRequest": false,
    })
}

pub fn encode_dap_message(message: &Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(message)?;
    let mut framed = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Upper bound on a single framed body; anything larger is treated as corrupt framing.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

fn invalid_data(message: impl Into<String>) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message.into())
}

/// Returns the body length if `line` is a `Content-Length` header.
/// Other headers (`Content-Type`) yield `Ok(None)`.
fn content_length_header(line: &str) -> std::io::Result<Option<usize>> {
    let Some((name, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return Ok(None);
    }
    let length = value
        .trim()
        .parse::<usize>()
        .map_err(|e| invalid_data(format!("invalid Content-Length '{}': {e}", value.trim())))?;
    if length > MAX_MESSAGE_BYTES {
        return Err(invalid_data(format!(
            "Content-Length {length} exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }
    Ok(Some(length))
}

/// Reads one `Content-Length` framed message.
///
/// Headers run until the first blank line. The body must be a single JSON
/// value. EOF before the blank line is `UnexpectedEof` so callers can tell a
/// closed adapter apart from a corrupt frame (`InvalidData`).
pub async fn read_dap_message<R>(reader: &mut R) -> std::io::Result<Value>
where
    R: AsyncBufRead + Unpin,
{
    let mut length = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "adapter stream closed before the end of the headers",
            ));
        }
        let header = line.trim_end_matches(['\r', '\n']);
        if header.is_empty() {
            break;
        }
        if let Some(parsed) = content_length_header(header)? {
            length = Some(parsed);
        }
    }

    let length = length.ok_or_else(|| invalid_data("frame has no Content-Length header"))?;
    let mut body = vec![0_u8; length];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| invalid_data(format!("frame body is not JSON: {e}")))
}

/// A running debug adapter with request/response correlation.
pub struct AdapterProcess {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    writer: Mutex<Writer>,
    pending: Pending,
    next_seq: AtomicU64,
    running: Arc<AtomicBool>,
    exit_code: std::sync::Mutex<Option<i32>>,
    reader_task: JoinHandle<()>,
}

impl AdapterProcess {
    pub fn spawn(command: &AdapterCommand, on_event: MessageSink, on_exit: ExitSink) -> Result<Self> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            BridgeError::Precondition(format!(
                "Failed to start debug adapter '{}': {e}",
                command.program.display()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Adapter("adapter stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Adapter("adapter stdout unavailable".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "adapter_stderr", "{line}");
                }
            });
        }

        let pid = child.id();
        tracing::info!(pid, program = %command.program.display(), "Debug adapter started");

        let mut process = Self::from_io(stdout, stdin, on_event, on_exit);
        process.pid = pid;
        process.child = Mutex::new(Some(child));
        Ok(process)
    }

    /// Wraps an already connected adapter stream.
    pub fn from_io<R, W>(reader: R, writer: W, on_event: MessageSink, on_exit: ExitSink) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(reader_loop(
            BufReader::new(reader),
            pending.clone(),
            running.clone(),
            on_event,
            on_exit,
        ));

        Self {
            child: Mutex::new(None),
            pid: None,
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_seq: AtomicU64::new(0),
            running,
            exit_code: std::sync::Mutex::new(None),
            reader_task,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_seq(&self) -> u64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *crate::lock(&self.exit_code)
    }

    pub async fn begin_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<(u64, oneshot::Receiver<Value>)> {
        if !self.is_running() {
            return Err(BridgeError::transport(command, "debug adapter is not running"));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let mut request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
        });
        if let Some(arguments) = arguments {
            request["arguments"] = arguments;
        }
        tracing::debug!(seq, command, "-> adapter {request}");

        let framed = encode_dap_message(&request)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(seq, tx);

        let mut writer = self.writer.lock().await;
        let written = match writer.write_all(&framed).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&seq);
            return Err(BridgeError::transport(
                command,
                format!("failed to write to adapter stdin: {e}"),
            ));
        }

        Ok((seq, rx))
    }

    /// Waits for the response to `seq`. Unsuccessful responses become transport errors.
    pub async fn await_response(
        &self,
        command: &str,
        seq: u64,
        rx: oneshot::Receiver<Value>,
        wait_timeout: Duration,
    ) -> Result<Value> {
        let response = match timeout(wait_timeout, rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => {
                return Err(BridgeError::Adapter(format!(
                    "debug adapter exited while waiting for '{command}'"
                )));
            }
            Err(_) => {
                self.pending.lock().await.remove(&seq);
                return Err(BridgeError::timeout(format!("response to '{command}'"), wait_timeout));
            }
        };
        check_response(command, response)
    }

    pub async fn request(&self, command: &str, arguments: Option<Value>, wait_timeout: Duration) -> Result<Value> {
        let (seq, rx) = self.begin_request(command, arguments).await?;
        self.await_response(command, seq, rx, wait_timeout).await
    }

    /// Asks the adapter to disconnect, then stops the process.
    pub async fn shutdown(&self) {
        if self.is_running() {
            if let Err(err) = self
                .request("disconnect", Some(json!({ "terminateDebuggee": true })), DISCONNECT_TIMEOUT)
                .await
            {
                tracing::debug!(error = %err, "disconnect request failed during shutdown");
            }
        }

        self.reader_task.abort();
        self.running.store(false, Ordering::SeqCst);
        self.pending.lock().await.clear();

        let mut child = self.child.lock().await;
        if let Some(child) = child.as_mut() {
            let _ = child.kill().await;
            if let Ok(status) = child.wait().await {
                *crate::lock(&self.exit_code) = status.code();
            }
        }
    }
}

impl Drop for AdapterProcess {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Turns an unsuccessful response into a transport error.
pub fn check_response(command: &str, response: Value) -> Result<Value> {
    let success = response
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true);
    if success {
        return Ok(response);
    }
    let message = response
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown adapter error");
    Err(BridgeError::transport(command, message))
}

async fn reader_loop<R>(
    mut reader: R,
    pending: Pending,
    running: Arc<AtomicBool>,
    on_event: MessageSink,
    on_exit: ExitSink,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let message = match read_dap_message(&mut reader).await {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(error = %e, "adapter stream closed");
                break;
            }
        };
        tracing::debug!("<- adapter {message}");

        match message.get("type").and_then(Value::as_str) {
            Some("response") => {
                if let Some(request_seq) = message.get("request_seq").and_then(Value::as_u64) {
                    if let Some(tx) = pending.lock().await.remove(&request_seq) {
                        let _ = tx.send(message);
                    }
                }
            }
            Some("event") => on_event(message),
            Some("request") => {
                let command = message.get("command").and_then(Value::as_str).unwrap_or_default();
                tracing::warn!(command, "Ignoring reverse request from adapter");
            }
            _ => {}
        }
    }

    running.store(false, Ordering::SeqCst);
    pending.lock().await.clear();
    on_exit();
}
