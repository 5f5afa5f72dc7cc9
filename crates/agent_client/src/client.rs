//! Consumer façades: the one-shot [`query`] function and the stateful
//! [`AgentClient`]. All protocol behavior lives in [`Query`]; these wrappers
//! only assemble the transport and engine and shape the surface.

use std::{collections::HashMap, pin::Pin, sync::Arc, task::Poll};

use futures::{
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use serde_json::Value;
use tracing::debug;

use crate::{
    options::{AgentOptions, ENTRYPOINT_ENV},
    permissions::PermissionMode,
    protocol::{user_message_frame, ServerInfo},
    query::Query,
    transport::{SubprocessTransport, Transport},
    AgentError,
};

const DEFAULT_SESSION_ID: &str = "default";

/// Prompt input: a single user message or a stream of conversation frames.
pub enum Prompt {
    Text(String),
    Stream(BoxStream<'static, Value>),
}

impl Prompt {
    pub fn stream<S>(frames: S) -> Self
    where
        S: Stream<Item = Value> + Send + 'static,
    {
        Self::Stream(frames.boxed())
    }

    fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

fn validate(options: &AgentOptions, prompt: &Prompt) -> Result<(), AgentError> {
    options.validate()?;
    if options.can_use_tool.is_some() && prompt.is_text() {
        return Err(AgentError::InvalidOptions(
            "a permission callback requires a streaming prompt so the control \
             channel stays open; pass the prompt as a stream"
                .into(),
        ));
    }
    Ok(())
}

/// One-shot query: spawns the CLI, runs the conversation, and yields each
/// message. Dropping the returned stream early shuts everything down in the
/// background.
pub async fn query(
    prompt: impl Into<Prompt>,
    options: AgentOptions,
) -> Result<QueryStream, AgentError> {
    std::env::set_var(ENTRYPOINT_ENV, "sdk-rust");
    let mut transport = SubprocessTransport::new(options.cli.clone());
    if let Some(sink) = &options.stderr_sink {
        transport = transport.stderr_sink(sink.clone());
    }
    query_with_transport(prompt, options, Arc::new(transport)).await
}

/// One-shot query over a caller-supplied transport.
pub async fn query_with_transport(
    prompt: impl Into<Prompt>,
    options: AgentOptions,
    transport: Arc<dyn Transport>,
) -> Result<QueryStream, AgentError> {
    let prompt = prompt.into();
    validate(&options, &prompt)?;

    transport.connect().await?;
    let query = Arc::new(Query::new(transport, &options));
    query.start()?;
    if let Err(err) = query.initialize().await {
        let _ = query.close().await;
        return Err(err);
    }

    match prompt {
        Prompt::Text(text) => {
            let frame = user_message_frame(&text, "", None);
            query.stream_input(stream::iter([frame]));
        }
        Prompt::Stream(frames) => query.stream_input(frames),
    }
    Ok(QueryStream::new(query))
}

/// Message stream returned by [`query`]. Ends when the CLI closes its side;
/// abandoning it early triggers an orderly background shutdown.
pub struct QueryStream {
    inner: BoxStream<'static, Result<Value, AgentError>>,
    query: Arc<Query>,
    closed: bool,
}

impl QueryStream {
    fn new(query: Arc<Query>) -> Self {
        let inner = stream::unfold(query.clone(), |query| async move {
            match query.next_message().await {
                Ok(Some(message)) => Some((Ok(message), query)),
                Ok(None) => None,
                Err(err) => Some((Err(err), query)),
            }
        })
        .boxed();
        Self {
            inner,
            query,
            closed: false,
        }
    }

    /// Capabilities reported by the initialization round trip.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.query.server_info()
    }

    /// Explicit shutdown, for callers who want the close error.
    pub async fn close(mut self) -> Result<(), AgentError> {
        self.closed = true;
        self.query.close().await
    }
}

impl Stream for QueryStream {
    type Item = Result<Value, AgentError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let query = self.query.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = query.close().await {
                    debug!(error = %err, "background shutdown after stream drop failed");
                }
            });
        }
    }
}

/// Stateful client for interactive, bidirectional conversations.
///
/// `connect` launches the CLI and performs initialization; the connection
/// then stays open for any number of [`send`](Self::send) /
/// [`receive_response`](Self::receive_response) rounds plus the control
/// operations (interrupt, model and permission changes, MCP management).
/// Dropping a connected client disconnects in the background; call
/// [`disconnect`](Self::disconnect) to observe shutdown errors.
pub struct AgentClient {
    options: AgentOptions,
    custom_transport: Option<Arc<dyn Transport>>,
    query: Option<Arc<Query>>,
}

impl AgentClient {
    pub fn new(options: AgentOptions) -> Self {
        Self {
            options,
            custom_transport: None,
            query: None,
        }
    }

    /// Uses a caller-supplied transport instead of spawning the CLI from
    /// `options.cli`.
    pub fn with_transport(options: AgentOptions, transport: Arc<dyn Transport>) -> Self {
        Self {
            options,
            custom_transport: Some(transport),
            query: None,
        }
    }

    /// Connects without an initial prompt, holding stdin open for later
    /// [`send`](Self::send) calls.
    pub async fn connect(&mut self) -> Result<(), AgentError> {
        self.connect_inner(None).await
    }

    /// Connects and immediately submits `prompt`.
    pub async fn connect_with(&mut self, prompt: impl Into<Prompt>) -> Result<(), AgentError> {
        self.connect_inner(Some(prompt.into())).await
    }

    async fn connect_inner(&mut self, prompt: Option<Prompt>) -> Result<(), AgentError> {
        if self.query.is_some() {
            return Ok(());
        }
        std::env::set_var(ENTRYPOINT_ENV, "sdk-rust-client");
        match &prompt {
            Some(prompt) => validate(&self.options, prompt)?,
            None => self.options.validate()?,
        }

        let transport: Arc<dyn Transport> = match &self.custom_transport {
            Some(transport) => transport.clone(),
            None => {
                let mut transport = SubprocessTransport::new(self.options.cli.clone());
                if let Some(sink) = &self.options.stderr_sink {
                    transport = transport.stderr_sink(sink.clone());
                }
                Arc::new(transport)
            }
        };
        transport.connect().await?;

        let query = Arc::new(Query::new(transport, &self.options));
        query.start()?;
        if let Err(err) = query.initialize().await {
            let _ = query.close().await;
            return Err(err);
        }

        match prompt {
            Some(Prompt::Text(text)) => {
                let frame = user_message_frame(&text, DEFAULT_SESSION_ID, None);
                query.write_input(&frame).await?;
            }
            Some(Prompt::Stream(frames)) => query.stream_input(frames),
            None => {}
        }

        self.query = Some(query);
        Ok(())
    }

    fn engine(&self) -> Result<&Arc<Query>, AgentError> {
        self.query
            .as_ref()
            .ok_or(AgentError::NotConnected("client is not connected"))
    }

    /// Submits a new user turn on the open connection. Frames from a stream
    /// prompt get `session_id` injected when absent.
    pub async fn send(
        &self,
        prompt: impl Into<Prompt>,
        session_id: &str,
    ) -> Result<(), AgentError> {
        let query = self.engine()?;
        match prompt.into() {
            Prompt::Text(text) => {
                let frame = user_message_frame(&text, session_id, None);
                query.write_input(&frame).await
            }
            Prompt::Stream(mut frames) => {
                while let Some(mut frame) = frames.next().await {
                    if let Some(message) = frame.as_object_mut() {
                        message
                            .entry("session_id")
                            .or_insert_with(|| Value::String(session_id.to_string()));
                    }
                    query.write_input(&frame).await?;
                }
                Ok(())
            }
        }
    }

    /// All conversation messages, until the CLI closes the stream.
    pub fn receive_messages(
        &self,
    ) -> Result<impl Stream<Item = Result<Value, AgentError>> + Send + 'static, AgentError> {
        let query = self.engine()?.clone();
        Ok(stream::unfold(query, |query| async move {
            match query.next_message().await {
                Ok(Some(message)) => Some((Ok(message), query)),
                Ok(None) => None,
                Err(err) => Some((Err(err), query)),
            }
        }))
    }

    /// Messages up to and including the next `result` frame.
    pub fn receive_response(
        &self,
    ) -> Result<impl Stream<Item = Result<Value, AgentError>> + Send + 'static, AgentError> {
        let query = self.engine()?.clone();
        Ok(stream::unfold((query, false), |(query, done)| async move {
            if done {
                return None;
            }
            match query.next_message().await {
                Ok(Some(message)) => {
                    let is_result =
                        message.get("type").and_then(Value::as_str) == Some("result");
                    Some((Ok(message), (query, is_result)))
                }
                Ok(None) => None,
                Err(err) => Some((Err(err), (query, true))),
            }
        }))
    }

    pub async fn interrupt(&self) -> Result<(), AgentError> {
        self.engine()?.interrupt().await
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> Result<(), AgentError> {
        self.engine()?.set_permission_mode(mode).await
    }

    pub async fn set_model(&self, model: Option<&str>) -> Result<(), AgentError> {
        self.engine()?.set_model(model).await
    }

    pub async fn set_max_thinking_tokens(&self, max_thinking_tokens: u64) -> Result<(), AgentError> {
        self.engine()?
            .set_max_thinking_tokens(max_thinking_tokens)
            .await
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<(), AgentError> {
        self.engine()?.stop_task(task_id).await
    }

    pub async fn rewind_files(&self, user_message_id: &str) -> Result<(), AgentError> {
        self.engine()?.rewind_files(user_message_id).await
    }

    pub async fn mcp_status(&self) -> Result<Value, AgentError> {
        self.engine()?.mcp_status().await
    }

    /// Replaces the CLI's dynamic MCP server set. The map key doubles as
    /// each server's `name` field, injected when the config omits it.
    pub async fn set_mcp_servers(
        &self,
        servers: HashMap<String, Value>,
    ) -> Result<Value, AgentError> {
        let mut wire = serde_json::Map::new();
        for (name, mut config) in servers {
            if let Some(entry) = config.as_object_mut() {
                entry
                    .entry("name")
                    .or_insert_with(|| Value::String(name.clone()));
            }
            wire.insert(name, config);
        }
        self.engine()?.set_mcp_servers(Value::Object(wire)).await
    }

    pub async fn mcp_reconnect(&self, server_name: &str) -> Result<(), AgentError> {
        self.engine()?.mcp_reconnect(server_name).await
    }

    pub async fn mcp_toggle(&self, server_name: &str, enabled: bool) -> Result<(), AgentError> {
        self.engine()?.mcp_toggle(server_name, enabled).await
    }

    /// Capabilities reported by `initialize`, or `None` before `connect`.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.query.as_ref().and_then(|query| query.server_info())
    }

    pub fn is_connected(&self) -> bool {
        self.query.is_some()
    }

    pub async fn disconnect(&mut self) -> Result<(), AgentError> {
        match self.query.take() {
            Some(query) => query.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Some(query) = self.query.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = query.close().await {
                        debug!(error = %err, "background disconnect failed");
                    }
                });
            }
        }
    }
}
