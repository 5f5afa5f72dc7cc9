//! The protocol engine.
//!
//! [`Query`] owns the transport and multiplexes three traffic classes over
//! it: conversation messages delivered to the consumer, control responses
//! correlated back to outbound requests, and inbound control requests
//! dispatched to registered callbacks. A single background reader task
//! demultiplexes frames; inbound requests are handled on their own tasks so
//! a slow callback never stalls the stream.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    hooks::{normalize_hook_output, HookCallback, HookContext, HookEvent, HookMatcher},
    mcp::{server_not_found, SdkMcpServer},
    options::AgentOptions,
    permissions::{CanUseTool, ToolPermissionContext},
    protocol::{
        self, control_request_frame, error_response_frame, route_frame, success_response_frame,
        ControlResponsePayload, InboundControlRequest, InboundFrame, ServerInfo, FRAME_RESULT,
    },
    transport::Transport,
    AgentError, ApiErrorKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Fresh,
    ReaderStarted,
    Initialized,
    Closing,
    Closed,
}

type PendingRequests = Mutex<HashMap<String, oneshot::Sender<Result<Value, AgentError>>>>;

struct Shared {
    state: StdMutex<EngineState>,
    pending: PendingRequests,
    request_seq: AtomicU64,
    callback_seq: AtomicU64,
    can_use_tool: Option<CanUseTool>,
    hooks: HashMap<HookEvent, Vec<HookMatcher>>,
    hook_callbacks: StdMutex<HashMap<String, HookCallback>>,
    mcp_servers: HashMap<String, SdkMcpServer>,
    agents: Option<Value>,
    system_prompt: Option<String>,
    append_system_prompt: Option<String>,
    json_schema: Option<Value>,
    first_result: watch::Sender<bool>,
    control_timeout: Duration,
    initialize_timeout: Duration,
    stream_close_timeout: Duration,
    has_control_callbacks: bool,
    handler_tasks: StdMutex<Vec<JoinHandle<()>>>,
    input_task: StdMutex<Option<JoinHandle<()>>>,
    server_info: StdMutex<Option<ServerInfo>>,
}

impl Shared {
    fn is_shutting_down(&self) -> bool {
        matches!(
            *self.state.lock().expect("state lock poisoned"),
            EngineState::Closing | EngineState::Closed
        )
    }
}

/// Bidirectional control-protocol engine over one [`Transport`].
pub struct Query {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    messages: Mutex<mpsc::UnboundedReceiver<Result<Value, AgentError>>>,
    reader_tx: StdMutex<Option<mpsc::UnboundedSender<Result<Value, AgentError>>>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Query {
    /// Builds an engine over a connected transport. Callback registrations
    /// and timeouts come from `options`; the transport-launch fields of
    /// `options` are not consulted here.
    pub fn new(transport: Arc<dyn Transport>, options: &AgentOptions) -> Self {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (first_result, _) = watch::channel(false);
        let shared = Shared {
            state: StdMutex::new(EngineState::Fresh),
            pending: Mutex::new(HashMap::new()),
            request_seq: AtomicU64::new(0),
            callback_seq: AtomicU64::new(0),
            can_use_tool: options.can_use_tool.clone(),
            hooks: options.hooks.clone(),
            hook_callbacks: StdMutex::new(HashMap::new()),
            mcp_servers: options
                .mcp_servers
                .iter()
                .map(|server| (server.name.clone(), server.clone()))
                .collect(),
            agents: options.agents.clone(),
            system_prompt: options.system_prompt.clone(),
            append_system_prompt: options.append_system_prompt.clone(),
            json_schema: options.json_schema.clone(),
            first_result,
            control_timeout: options.control_timeout,
            initialize_timeout: options.resolved_initialize_timeout(),
            stream_close_timeout: options.resolved_stream_close_timeout(),
            has_control_callbacks: options.has_control_callbacks(),
            handler_tasks: StdMutex::new(Vec::new()),
            input_task: StdMutex::new(None),
            server_info: StdMutex::new(None),
        };
        Self {
            transport,
            shared: Arc::new(shared),
            messages: Mutex::new(message_rx),
            reader_tx: StdMutex::new(Some(message_tx)),
            reader: StdMutex::new(None),
        }
    }

    /// Starts the background reader. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), AgentError> {
        let mut state = self.shared.state.lock().expect("state lock poisoned");
        match *state {
            EngineState::Fresh => {}
            EngineState::ReaderStarted | EngineState::Initialized => return Ok(()),
            EngineState::Closing | EngineState::Closed => {
                return Err(AgentError::NotConnected("engine is closed"))
            }
        }

        let tx = self
            .reader_tx
            .lock()
            .expect("reader sender lock poisoned")
            .take()
            .expect("reader sender already consumed");
        let handle = tokio::spawn(read_loop(self.transport.clone(), self.shared.clone(), tx));
        *self.reader.lock().expect("reader lock poisoned") = Some(handle);
        *state = EngineState::ReaderStarted;
        Ok(())
    }

    /// Performs the `initialize` round trip, registering hooks and
    /// in-process tool servers with the CLI.
    pub async fn initialize(&self) -> Result<ServerInfo, AgentError> {
        let request = self.build_initialize_request();
        let timeout = self.shared.initialize_timeout;
        let response = self.send_control_with_timeout(request, timeout).await?;

        let info: ServerInfo = serde_json::from_value(response).unwrap_or_default();
        *self
            .shared
            .server_info
            .lock()
            .expect("server info lock poisoned") = Some(info.clone());
        let mut state = self.shared.state.lock().expect("state lock poisoned");
        if *state == EngineState::ReaderStarted {
            *state = EngineState::Initialized;
        }
        Ok(info)
    }

    fn build_initialize_request(&self) -> Value {
        let mut hooks_config = Map::new();
        for (event, matchers) in &self.shared.hooks {
            if matchers.is_empty() {
                continue;
            }
            let mut entries = Vec::new();
            for matcher in matchers {
                let mut callback_ids = Vec::new();
                for callback in &matcher.hooks {
                    let id = format!(
                        "hook_{}",
                        self.shared.callback_seq.fetch_add(1, Ordering::SeqCst)
                    );
                    self.shared
                        .hook_callbacks
                        .lock()
                        .expect("hook callbacks lock poisoned")
                        .insert(id.clone(), callback.clone());
                    callback_ids.push(Value::String(id));
                }
                let mut entry = json!({
                    "matcher": matcher.matcher,
                    "hookCallbackIds": callback_ids,
                });
                if let Some(timeout) = matcher.timeout {
                    entry["timeout"] = json!(timeout.as_secs_f64());
                }
                entries.push(entry);
            }
            hooks_config.insert(event.as_str().to_string(), Value::Array(entries));
        }

        let mut request = json!({"subtype": "initialize"});
        request["hooks"] = if hooks_config.is_empty() {
            Value::Null
        } else {
            Value::Object(hooks_config)
        };
        if let Some(agents) = &self.shared.agents {
            request["agents"] = agents.clone();
        }
        if !self.shared.mcp_servers.is_empty() {
            let mut names: Vec<&str> = self.shared.mcp_servers.keys().map(String::as_str).collect();
            names.sort_unstable();
            request["sdkMcpServers"] = json!(names);
        }
        if let Some(prompt) = &self.shared.system_prompt {
            request["system_prompt"] = json!(prompt);
        }
        if let Some(prompt) = &self.shared.append_system_prompt {
            request["append_system_prompt"] = json!(prompt);
        }
        if let Some(schema) = &self.shared.json_schema {
            request["json_schema"] = schema.clone();
        }
        request
    }

    /// Sends an outbound control request and awaits its correlated
    /// response. `request` must carry a `subtype` field.
    pub async fn send_control(&self, request: Value) -> Result<Value, AgentError> {
        self.send_control_with_timeout(request, self.shared.control_timeout)
            .await
    }

    async fn send_control_with_timeout(
        &self,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, AgentError> {
        let subtype = request
            .get("subtype")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        {
            let state = self.shared.state.lock().expect("state lock poisoned");
            let initializing = subtype == "initialize";
            match (*state, initializing) {
                (EngineState::ReaderStarted, true) | (EngineState::Initialized, false) => {}
                (EngineState::Fresh, _) => {
                    return Err(AgentError::NotConnected("engine not started"))
                }
                (EngineState::ReaderStarted, false) => {
                    return Err(AgentError::NotConnected("engine not initialized"))
                }
                (EngineState::Initialized, true) => {
                    return Err(AgentError::NotConnected("engine already initialized"))
                }
                _ => return Err(AgentError::NotConnected("engine is closed")),
            }
        }

        let seq = self.shared.request_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let request_id = protocol::request_id(seq);
        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let frame = control_request_frame(&request_id, request);
        if let Err(err) = self.transport.write(&frame.to_string()).await {
            self.shared.pending.lock().await.remove(&request_id);
            return Err(err);
        }

        match time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(AgentError::Connection(
                "control response channel closed".into(),
            )),
            Err(_) => {
                // A response landing after this point finds no entry and is
                // dropped by the reader.
                self.shared.pending.lock().await.remove(&request_id);
                Err(AgentError::ControlTimeout { subtype, timeout })
            }
        }
    }

    /// Streams conversation frames onto the transport in the background.
    ///
    /// When hooks or in-process tool servers are registered, stdin is held
    /// open after the stream ends until the first `result` frame arrives or
    /// the stream-close timeout elapses, so in-flight callbacks are not cut
    /// off by a premature EOF.
    pub fn stream_input<S>(&self, input: S)
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        let transport = self.transport.clone();
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            futures::pin_mut!(input);
            while let Some(message) = input.next().await {
                if shared.is_shutting_down() {
                    return;
                }
                if let Err(err) = transport.write(&message.to_string()).await {
                    debug!(error = %err, "stopped streaming input");
                    return;
                }
            }

            if shared.has_control_callbacks {
                debug!("input exhausted, waiting for first result before closing stdin");
                let mut first_result = shared.first_result.subscribe();
                let waited =
                    time::timeout(shared.stream_close_timeout, first_result.wait_for(|seen| *seen))
                        .await;
                if waited.is_err() {
                    debug!("timed out waiting for first result, closing stdin");
                }
            }
            let _ = transport.end_input().await;
        });
        *self
            .shared
            .input_task
            .lock()
            .expect("input task lock poisoned") = Some(handle);
    }

    /// Writes one conversation frame, serialized with the engine's other
    /// writers.
    pub async fn write_input(&self, frame: &Value) -> Result<(), AgentError> {
        if self.shared.is_shutting_down() {
            return Err(AgentError::NotConnected("engine is closed"));
        }
        self.transport.write(&frame.to_string()).await
    }

    /// Returns the next conversation message, `Ok(None)` once the stream
    /// has ended. Assistant frames annotated with an API error kind raise
    /// the mapped [`AgentError::Api`] instead of being yielded.
    pub async fn next_message(&self) -> Result<Option<Value>, AgentError> {
        if *self.shared.state.lock().expect("state lock poisoned") == EngineState::Fresh {
            return Err(AgentError::NotConnected("engine not started"));
        }

        let received = { self.messages.lock().await.recv().await };
        match received {
            None => Ok(None),
            Some(Err(err)) => Err(err),
            Some(Ok(message)) => match api_error(&message) {
                Some(err) => Err(err),
                None => Ok(Some(message)),
            },
        }
    }

    /// Capabilities reported by `initialize`, if it has completed.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared
            .server_info
            .lock()
            .expect("server info lock poisoned")
            .clone()
    }

    /// Shuts the engine down: stops the reader and input tasks, fails every
    /// pending control request, and closes the transport. Idempotent, and
    /// safe to call from any task.
    pub async fn close(&self) -> Result<(), AgentError> {
        {
            let mut state = self.shared.state.lock().expect("state lock poisoned");
            if matches!(*state, EngineState::Closing | EngineState::Closed) {
                return Ok(());
            }
            *state = EngineState::Closing;
        }

        if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = self
            .shared
            .input_task
            .lock()
            .expect("input task lock poisoned")
            .take()
        {
            handle.abort();
        }
        for handle in self
            .shared
            .handler_tasks
            .lock()
            .expect("handler tasks lock poisoned")
            .drain(..)
        {
            handle.abort();
        }

        let pending: Vec<_> = self.shared.pending.lock().await.drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(AgentError::Connection("query closed".into())));
        }

        let result = self.transport.close().await;
        *self.shared.state.lock().expect("state lock poisoned") = EngineState::Closed;
        result
    }

    // Thin aliases over `send_control`.

    pub async fn interrupt(&self) -> Result<(), AgentError> {
        self.send_control(json!({"subtype": "interrupt"})).await?;
        Ok(())
    }

    pub async fn set_permission_mode(
        &self,
        mode: crate::permissions::PermissionMode,
    ) -> Result<(), AgentError> {
        self.send_control(json!({"subtype": "set_permission_mode", "mode": mode}))
            .await?;
        Ok(())
    }

    pub async fn set_model(&self, model: Option<&str>) -> Result<(), AgentError> {
        self.send_control(json!({"subtype": "set_model", "model": model}))
            .await?;
        Ok(())
    }

    pub async fn set_max_thinking_tokens(&self, max_thinking_tokens: u64) -> Result<(), AgentError> {
        self.send_control(json!({
            "subtype": "set_max_thinking_tokens",
            "max_thinking_tokens": max_thinking_tokens,
        }))
        .await?;
        Ok(())
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<(), AgentError> {
        self.send_control(json!({"subtype": "stop_task", "task_id": task_id}))
            .await?;
        Ok(())
    }

    /// Rewinds tracked files to their state at a user message. Requires
    /// file checkpointing on the CLI side.
    pub async fn rewind_files(&self, user_message_id: &str) -> Result<(), AgentError> {
        self.send_control(json!({
            "subtype": "rewind_files",
            "user_message_id": user_message_id,
        }))
        .await?;
        Ok(())
    }

    pub async fn mcp_status(&self) -> Result<Value, AgentError> {
        self.send_control(json!({"subtype": "mcp_status"})).await
    }

    pub async fn set_mcp_servers(&self, servers: Value) -> Result<Value, AgentError> {
        self.send_control(json!({"subtype": "mcp_set_servers", "servers": servers}))
            .await
    }

    pub async fn mcp_reconnect(&self, server_name: &str) -> Result<(), AgentError> {
        self.send_control(json!({"subtype": "mcp_reconnect", "serverName": server_name}))
            .await?;
        Ok(())
    }

    pub async fn mcp_toggle(&self, server_name: &str, enabled: bool) -> Result<(), AgentError> {
        self.send_control(json!({
            "subtype": "mcp_toggle",
            "serverName": server_name,
            "enabled": enabled,
        }))
        .await?;
        Ok(())
    }
}

/// Demultiplexes inbound frames until the transport ends or fails.
async fn read_loop(
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    messages: mpsc::UnboundedSender<Result<Value, AgentError>>,
) {
    loop {
        match transport.read_message().await {
            Ok(Some(frame)) => match route_frame(frame) {
                InboundFrame::ControlResponse(payload) => {
                    resolve_response(&shared, payload).await;
                }
                InboundFrame::ControlRequest {
                    request_id,
                    request,
                } => {
                    let handle = tokio::spawn(handle_control_request(
                        transport.clone(),
                        shared.clone(),
                        request_id,
                        request,
                    ));
                    let mut tasks = shared
                        .handler_tasks
                        .lock()
                        .expect("handler tasks lock poisoned");
                    tasks.retain(|task| !task.is_finished());
                    tasks.push(handle);
                }
                InboundFrame::ControlCancel(frame) => {
                    // Advisory; in-flight handlers run to completion.
                    debug!(?frame, "ignoring control_cancel_request");
                }
                InboundFrame::Message(message) => {
                    if message.get("type").and_then(Value::as_str) == Some(FRAME_RESULT) {
                        shared.first_result.send_replace(true);
                    }
                    // A consumer that stopped listening does not stop the
                    // control protocol.
                    let _ = messages.send(Ok(message));
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "fatal error reading from transport");
                let pending: Vec<_> = shared.pending.lock().await.drain().collect();
                for (_, tx) in pending {
                    let _ = tx.send(Err(err.fan_out()));
                }
                let _ = messages.send(Err(err));
                break;
            }
        }
    }
    // Dropping the sender ends the consumer's message stream.
}

/// Resolves one inbound `control_response` against the correlation table.
/// Unknown ids (typically responses that lost a race with their timeout)
/// are dropped.
async fn resolve_response(shared: &Shared, payload: ControlResponsePayload) {
    let waiter = shared.pending.lock().await.remove(&payload.request_id);
    let Some(tx) = waiter else {
        debug!(request_id = %payload.request_id, "dropping response for unknown request");
        return;
    };

    let outcome = if payload.subtype == "error" {
        Err(AgentError::ControlProtocol(
            payload.error.unwrap_or_else(|| "Unknown error".into()),
        ))
    } else {
        Ok(payload.response.unwrap_or_else(|| json!({})))
    };
    let _ = tx.send(outcome);
}

/// Runs one inbound control request to completion and writes exactly one
/// `control_response` back, encoding failures as error responses.
async fn handle_control_request(
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
    request_id: String,
    request: Value,
) {
    let frame = match dispatch_control_request(&shared, request).await {
        Ok(response) => success_response_frame(&request_id, response),
        Err(err) => error_response_frame(&request_id, &err.to_string()),
    };
    if let Err(err) = transport.write(&frame.to_string()).await {
        warn!(error = %err, request_id, "failed to write control response");
    }
}

async fn dispatch_control_request(shared: &Shared, request: Value) -> Result<Value, AgentError> {
    let request: InboundControlRequest = serde_json::from_value(request)
        .map_err(|err| AgentError::ControlProtocol(format!("unrecognized control request: {err}")))?;

    match request {
        InboundControlRequest::CanUseTool {
            tool_name,
            input,
            tool_use_id,
            permission_suggestions,
            blocked_path,
        } => {
            let callback = shared.can_use_tool.as_ref().ok_or_else(|| {
                AgentError::Callback("can_use_tool callback is not registered".into())
            })?;
            let context = ToolPermissionContext {
                tool_use_id,
                suggestions: permission_suggestions.unwrap_or_default(),
                blocked_path,
            };
            let result = callback(tool_name, input.clone(), context).await?;
            result.into_wire(&input)
        }
        InboundControlRequest::HookCallback {
            callback_id,
            input,
            tool_use_id,
        } => {
            let callback = shared
                .hook_callbacks
                .lock()
                .expect("hook callbacks lock poisoned")
                .get(&callback_id)
                .cloned()
                .ok_or_else(|| {
                    AgentError::Callback(format!(
                        "no hook callback registered for id {callback_id}"
                    ))
                })?;
            let output = callback(input, tool_use_id, HookContext::default()).await?;
            Ok(normalize_hook_output(output))
        }
        InboundControlRequest::McpMessage {
            server_name,
            message,
        } => {
            let response = match shared.mcp_servers.get(&server_name) {
                Some(server) => server.handle_message(&message).await,
                None => server_not_found(&message, &server_name),
            };
            Ok(json!({"mcp_response": response}))
        }
        InboundControlRequest::Interrupt
        | InboundControlRequest::Initialize
        | InboundControlRequest::SetPermissionMode
        | InboundControlRequest::RewindFiles
        | InboundControlRequest::StopTask => Ok(json!({})),
    }
}

/// Maps an `error`-annotated assistant frame to its typed error.
fn api_error(message: &Value) -> Option<AgentError> {
    if message.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let kind = message
        .get("error")
        .and_then(Value::as_str)
        .or_else(|| message.get("message")?.get("error")?.as_str())?;

    let error_text = message
        .get("message")
        .and_then(|inner| inner.get("content"))
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks.iter().find_map(|block| {
                (block.get("type")?.as_str()? == "text")
                    .then(|| block.get("text")?.as_str().map(str::to_string))
                    .flatten()
            })
        });

    Some(AgentError::Api {
        kind: ApiErrorKind::from_wire(kind),
        message: error_text.unwrap_or_else(|| "agent reported an API error".into()),
    })
}
