use std::{collections::BTreeMap, sync::Arc, time::Duration};

use agentic_debug_core::{
    controller::SessionSlot,
    ledger::BreakpointSpec,
    notify::TracingNotifier,
    BackendMode, BridgeError, LaunchParams, SessionController, SessionHandle, SessionState,
};
use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters, ServerHandler},
    model::*,
    tool, tool_handler, tool_router, ErrorData as McpError,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_STACK_LEVELS: u32 = 20;
const WAIT_EVENTS: [&str; 4] = ["stopped", "continued", "terminated", "exited"];

type ToolOutcome = agentic_debug_core::Result<Value>;

#[derive(Debug, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DebugLaunchParams {
    /// Port Xdebug connects back to. Defaults to settings, then 9003.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, alias = "stop_on_entry", skip_serializing_if = "Option::is_none")]
    pub stop_on_entry: Option<bool>,
    /// Remote (server) path to local (workspace) path.
    #[serde(default, alias = "path_mappings", skip_serializing_if = "Option::is_none")]
    pub path_mappings: Option<BTreeMap<String, String>>,
    /// `ui` to run in the editor's debug UI, `headless` to drive the adapter directly.
    #[serde(default, alias = "backend_mode", skip_serializing_if = "Option::is_none")]
    pub backend_mode: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ThreadParams {
    #[serde(default)]
    pub thread_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StackTraceParams {
    #[serde(default)]
    pub thread_id: Option<i64>,
    #[serde(default)]
    pub start_frame: Option<u32>,
    #[serde(default)]
    pub levels: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ScopesParams {
    pub frame_id: i64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct VariablesParams {
    pub variables_reference: i64,
    #[serde(default)]
    pub start: Option<u32>,
    #[serde(default)]
    pub count: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EvaluateParams {
    pub expression: String,
    #[serde(default)]
    pub frame_id: Option<i64>,
    /// Defaults to `repl`.
    #[serde(default)]
    pub context: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BreakpointArg {
    pub line: u32,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_condition: Option<String>,
    #[serde(default)]
    pub log_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct BreakpointsParams {
    /// Local or remote path of the PHP file.
    pub path: String,
    /// Replaces the agent's breakpoints in this file. Empty clears them.
    #[serde(default)]
    pub breakpoints: Vec<BreakpointArg>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PathParams {
    /// Local or remote path of the PHP file.
    pub path: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct WaitParams {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl From<BreakpointArg> for BreakpointSpec {
    fn from(arg: BreakpointArg) -> Self {
        Self {
            line: arg.line,
            condition: arg.condition,
            hit_condition: arg.hit_condition,
            log_message: arg.log_message,
        }
    }
}

/// Normalizes loosely shaped launch input, then applies the server's default mode.
pub fn launch_params(args: DebugLaunchParams, default_mode: BackendMode) -> agentic_debug_core::Result<LaunchParams> {
    let mut params = LaunchParams::from_tool_input(serde_json::to_value(args)?)?;
    params.backend_mode.get_or_insert(default_mode);
    Ok(params)
}

fn resolve_thread_id(session: &dyn SessionHandle, explicit: Option<i64>) -> agentic_debug_core::Result<i64> {
    if let Some(thread_id) = explicit {
        return Ok(thread_id);
    }
    session
        .stop_info()
        .map(|stop| stop.thread_id)
        .filter(|id| *id > 0)
        .ok_or_else(|| {
            BridgeError::InvalidParams(
                "Missing threadId: provide thread_id or wait for a stopped event".to_string(),
            )
        })
}

/// Adds `localPath` next to every frame's remote `source.path`.
fn annotate_frames(body: &Value, slot: &SessionSlot) -> Value {
    let mut frames = body
        .get("stackFrames")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for frame in &mut frames {
        let remote = frame
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let (Some(remote), Some(frame)) = (remote, frame.as_object_mut()) {
            frame.insert(
                "localPath".to_string(),
                json!(slot.path_mapper.to_local(&remote)),
            );
        }
    }
    Value::Array(frames)
}

fn respond(tool_name: &str, outcome: ToolOutcome) -> Result<CallToolResult, McpError> {
    Ok(match outcome {
        Ok(payload) => CallToolResult::structured(payload),
        Err(err) => {
            tracing::warn!(tool = tool_name, code = err.code(), "{err}");
            CallToolResult::structured_error(json!({
                "ok": false,
                "error": err.to_payload(),
            }))
        }
    })
}

#[derive(Clone)]
pub struct AgenticDebugServer {
    tool_router: ToolRouter<Self>,
    controller: Arc<Mutex<SessionController>>,
    notifier: Arc<TracingNotifier>,
    default_mode: BackendMode,
}

impl AgenticDebugServer {
    async fn active(&self) -> agentic_debug_core::Result<SessionSlot> {
        self.controller
            .lock()
            .await
            .slot()
            .cloned()
            .ok_or(BridgeError::NoSession)
    }

    async fn status_payload(&self) -> ToolOutcome {
        let status = self.controller.lock().await.status();
        let mut payload = serde_json::to_value(&status)?;
        payload["statusLine"] = json!(self.notifier.status_line());
        Ok(payload)
    }

    async fn step(&self, command: &str, thread_id: Option<i64>) -> ToolOutcome {
        let slot = self.active().await?;
        let thread_id = resolve_thread_id(slot.session.as_ref(), thread_id)?;
        let response = slot
            .backend
            .send_request(command, Some(json!({ "threadId": thread_id })))
            .await?;
        Ok(json!({
            "ok": true,
            "command": command,
            "threadId": thread_id,
            "body": response.body(),
        }))
    }

    async fn launch(&self, args: DebugLaunchParams) -> ToolOutcome {
        let params = launch_params(args, self.default_mode)?;
        self.controller.lock().await.launch(&params).await?;
        let mut payload = self.status_payload().await?;
        payload["ok"] = json!(true);
        Ok(payload)
    }

    async fn pause(&self, thread_id: Option<i64>) -> ToolOutcome {
        let slot = self.active().await?;
        let thread_id = match resolve_thread_id(slot.session.as_ref(), thread_id) {
            Ok(id) => id,
            Err(_) => {
                let threads = slot.backend.send_request("threads", None).await?;
                threads.body()["threads"][0]["id"].as_i64().ok_or_else(|| {
                    BridgeError::InvalidParams(
                        "No threads to pause. Trigger the PHP script first".to_string(),
                    )
                })?
            }
        };
        let response = slot
            .backend
            .send_request("pause", Some(json!({ "threadId": thread_id })))
            .await?;
        Ok(json!({ "ok": true, "threadId": thread_id, "body": response.body() }))
    }

    async fn stack_trace(&self, params: StackTraceParams) -> ToolOutcome {
        let slot = self.active().await?;
        let thread_id = resolve_thread_id(slot.session.as_ref(), params.thread_id)?;
        let response = slot
            .backend
            .send_request(
                "stackTrace",
                Some(json!({
                    "threadId": thread_id,
                    "startFrame": params.start_frame.unwrap_or(0),
                    "levels": params.levels.unwrap_or(DEFAULT_STACK_LEVELS),
                })),
            )
            .await?;
        Ok(json!({
            "ok": true,
            "threadId": thread_id,
            "stackFrames": annotate_frames(response.body(), &slot),
            "totalFrames": response.body().get("totalFrames"),
        }))
    }

    /// Sends one request and returns the named array from its body.
    async fn forward(&self, command: &str, args: Option<Value>, field: &str) -> ToolOutcome {
        let slot = self.active().await?;
        let response = slot.backend.send_request(command, args).await?;
        Ok(json!({
            "ok": true,
            field: response.body().get(field).cloned().unwrap_or_else(|| json!([])),
        }))
    }

    async fn evaluate(&self, params: EvaluateParams) -> ToolOutcome {
        let slot = self.active().await?;
        let mut args = json!({
            "expression": params.expression,
            "context": params.context.unwrap_or_else(|| "repl".to_string()),
        });
        if let Some(frame_id) = params.frame_id {
            args["frameId"] = json!(frame_id);
        }
        let response = slot.backend.send_request("evaluate", Some(args)).await?;
        let body = response.body();
        Ok(json!({
            "ok": true,
            "result": body.get("result"),
            "type": body.get("type"),
            "variablesReference": body.get("variablesReference"),
        }))
    }

    async fn breakpoints(&self, params: BreakpointsParams) -> ToolOutcome {
        let slot = self.active().await?;
        let request_id = uuid::Uuid::new_v4().to_string();
        let specs = params.breakpoints.into_iter().map(BreakpointSpec::from).collect();
        let confirmed = slot
            .ledger
            .add_agent_breakpoints(&request_id, &params.path, specs)
            .await?;
        Ok(json!({
            "ok": true,
            "requestId": request_id,
            "remotePath": slot.path_mapper.to_remote(&params.path),
            "breakpoints": confirmed,
            "allForFile": slot.ledger.get_for_file(&params.path),
        }))
    }

    async fn breakpoints_for_file(&self, path: String) -> ToolOutcome {
        let ledger = self
            .controller
            .lock()
            .await
            .ledger()
            .ok_or(BridgeError::NoSession)?;
        let breakpoints = ledger.get_for_file(&path);
        Ok(json!({ "ok": true, "path": path, "breakpoints": breakpoints }))
    }

    async fn wait(&self, timeout_ms: Option<u64>) -> ToolOutcome {
        let slot = self.active().await?;
        if slot.session.state() == SessionState::Paused {
            return Ok(json!({
                "ok": true,
                "reason": "already_paused",
                "stop": slot.session.stop_info(),
                "status": self.status_payload().await?,
            }));
        }

        let wait = Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
        let event = slot.backend.events().wait_for_any(&WAIT_EVENTS, wait).await?;
        Ok(json!({
            "ok": true,
            "reason": "event",
            "event": event.event,
            "body": event.body,
            "status": self.status_payload().await?,
        }))
    }
}

#[tool_router]
impl AgenticDebugServer {
    pub fn new(
        controller: SessionController,
        notifier: Arc<TracingNotifier>,
        default_mode: BackendMode,
    ) -> Self {
        Self {
            tool_router: Self::tool_router(),
            controller: Arc::new(Mutex::new(controller)),
            notifier,
            default_mode,
        }
    }

    #[tool(description = "Start a PHP/Xdebug debug session, replacing any active one")]
    async fn debug_launch(
        &self,
        params: Parameters<DebugLaunchParams>,
    ) -> Result<CallToolResult, McpError> {
        respond("debug_launch", self.launch(params.0).await)
    }

    #[tool(description = "Stop the active debug session")]
    async fn debug_terminate(&self) -> Result<CallToolResult, McpError> {
        let outcome = self.controller.lock().await.terminate().await;
        respond(
            "debug_terminate",
            outcome.map(|()| json!({ "ok": true, "state": SessionState::Terminated })),
        )
    }

    #[tool(description = "Report session state, last stop and what to do next")]
    async fn debug_status(&self) -> Result<CallToolResult, McpError> {
        respond("debug_status", self.status_payload().await)
    }

    #[tool(description = "Resume execution")]
    async fn debug_continue(&self, params: Parameters<ThreadParams>) -> Result<CallToolResult, McpError> {
        respond("debug_continue", self.step("continue", params.0.thread_id).await)
    }

    #[tool(description = "Step over the next line")]
    async fn debug_next(&self, params: Parameters<ThreadParams>) -> Result<CallToolResult, McpError> {
        respond("debug_next", self.step("next", params.0.thread_id).await)
    }

    #[tool(description = "Step into the next call")]
    async fn debug_step_in(&self, params: Parameters<ThreadParams>) -> Result<CallToolResult, McpError> {
        respond("debug_step_in", self.step("stepIn", params.0.thread_id).await)
    }

    #[tool(description = "Step out of the current function")]
    async fn debug_step_out(&self, params: Parameters<ThreadParams>) -> Result<CallToolResult, McpError> {
        respond("debug_step_out", self.step("stepOut", params.0.thread_id).await)
    }

    #[tool(description = "Pause a running PHP request")]
    async fn debug_pause(&self, params: Parameters<ThreadParams>) -> Result<CallToolResult, McpError> {
        respond("debug_pause", self.pause(params.0.thread_id).await)
    }

    #[tool(description = "List the PHP requests Xdebug has connected")]
    async fn debug_threads(&self) -> Result<CallToolResult, McpError> {
        respond("debug_threads", self.forward("threads", None, "threads").await)
    }

    #[tool(description = "Read the call stack of a paused thread, with local file paths")]
    async fn debug_stack_trace(
        &self,
        params: Parameters<StackTraceParams>,
    ) -> Result<CallToolResult, McpError> {
        respond("debug_stack_trace", self.stack_trace(params.0).await)
    }

    #[tool(description = "List variable scopes of a stack frame")]
    async fn debug_scopes(&self, params: Parameters<ScopesParams>) -> Result<CallToolResult, McpError> {
        let args = json!({ "frameId": params.0.frame_id });
        respond("debug_scopes", self.forward("scopes", Some(args), "scopes").await)
    }

    #[tool(description = "Read variables from a variables reference")]
    async fn debug_variables(
        &self,
        params: Parameters<VariablesParams>,
    ) -> Result<CallToolResult, McpError> {
        let params = params.0;
        let mut args = json!({ "variablesReference": params.variables_reference });
        if let Some(start) = params.start {
            args["start"] = json!(start);
        }
        if let Some(count) = params.count {
            args["count"] = json!(count);
        }
        respond("debug_variables", self.forward("variables", Some(args), "variables").await)
    }

    #[tool(description = "Evaluate a PHP expression in the paused context")]
    async fn debug_evaluate(&self, params: Parameters<EvaluateParams>) -> Result<CallToolResult, McpError> {
        respond("debug_evaluate", self.evaluate(params.0).await)
    }

    #[tool(description = "Set the agent's breakpoints for one file")]
    async fn debug_breakpoints(
        &self,
        params: Parameters<BreakpointsParams>,
    ) -> Result<CallToolResult, McpError> {
        respond("debug_breakpoints", self.breakpoints(params.0).await)
    }

    #[tool(description = "List the agent and IDE breakpoints recorded for one file")]
    async fn debug_breakpoints_get(
        &self,
        params: Parameters<PathParams>,
    ) -> Result<CallToolResult, McpError> {
        respond("debug_breakpoints_get", self.breakpoints_for_file(params.0.path).await)
    }

    #[tool(description = "Wait until execution stops, resumes or the session ends")]
    async fn debug_wait(&self, params: Parameters<WaitParams>) -> Result<CallToolResult, McpError> {
        respond("debug_wait", self.wait(params.0.timeout_ms).await)
    }
}

#[tool_handler]
impl ServerHandler for AgenticDebugServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Agentic PHP/Xdebug debugging. Call debug_launch, trigger the script, then debug_wait."
                    .into(),
            ),
        }
    }
}
