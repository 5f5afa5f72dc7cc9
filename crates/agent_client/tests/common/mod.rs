#![allow(dead_code)]

//! Scripted transport for driving the engine without a child process.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};

use agent_client::{AgentError, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

type Inbound = Result<Option<Value>, AgentError>;

/// In-memory [`Transport`]: inbound frames come from a script queue, writes
/// are recorded for assertions. With `auto_initialize` the fake answers the
/// engine's `initialize` request by itself.
pub struct FakeTransport {
    incoming: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    feeder: mpsc::UnboundedSender<Inbound>,
    written: StdMutex<Vec<Value>>,
    input_ended: AtomicBool,
    closed: AtomicBool,
    auto_initialize: bool,
}

impl FakeTransport {
    pub fn new(auto_initialize: bool) -> Arc<Self> {
        let (feeder, incoming) = mpsc::unbounded_channel();
        Arc::new(Self {
            incoming: Mutex::new(incoming),
            feeder,
            written: StdMutex::new(Vec::new()),
            input_ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            auto_initialize,
        })
    }

    /// Queues one inbound frame.
    pub fn push(&self, frame: Value) {
        self.feeder
            .send(Ok(Some(frame)))
            .expect("fake transport script closed");
    }

    /// Queues end-of-stream.
    pub fn push_eof(&self) {
        self.feeder
            .send(Ok(None))
            .expect("fake transport script closed");
    }

    /// Queues a fatal read error.
    pub fn push_error(&self, error: AgentError) {
        self.feeder
            .send(Err(error))
            .expect("fake transport script closed");
    }

    /// Snapshot of every frame written so far.
    pub fn written(&self) -> Vec<Value> {
        self.written.lock().unwrap().clone()
    }

    /// Frames written with the given top-level `type`.
    pub fn written_of_type(&self, frame_type: &str) -> Vec<Value> {
        self.written()
            .into_iter()
            .filter(|frame| frame.get("type").and_then(Value::as_str) == Some(frame_type))
            .collect()
    }

    pub fn input_ended(&self) -> bool {
        self.input_ended.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Waits (bounded) for `predicate` to hold over the written frames.
    pub async fn wait_for_write<F>(&self, predicate: F) -> Value
    where
        F: Fn(&Value) -> bool,
    {
        for _ in 0..200 {
            if let Some(frame) = self.written().iter().find(|frame| predicate(frame)) {
                return frame.clone();
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("expected frame was never written; saw {:?}", self.written());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn write(&self, line: &str) -> Result<(), AgentError> {
        if self.input_ended.load(Ordering::SeqCst) {
            return Err(AgentError::Connection("stdin is closed".into()));
        }
        let frame: Value = serde_json::from_str(line).expect("transport writes must be JSON");
        self.written.lock().unwrap().push(frame.clone());

        if self.auto_initialize
            && frame.get("type").and_then(Value::as_str) == Some("control_request")
            && frame["request"]["subtype"] == "initialize"
        {
            self.push(json!({
                "type": "control_response",
                "response": {
                    "subtype": "success",
                    "request_id": frame["request_id"],
                    "response": {"commands": [], "tools": ["Bash", "Read"]},
                },
            }));
        }
        Ok(())
    }

    async fn end_input(&self) -> Result<(), AgentError> {
        self.input_ended.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read_message(&self) -> Result<Option<Value>, AgentError> {
        match self.incoming.lock().await.recv().await {
            Some(outcome) => outcome,
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}
