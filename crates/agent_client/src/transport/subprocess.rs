use std::{
    collections::{BTreeMap, VecDeque},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout},
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{AgentError, Transport};

/// Stderr lines retained for error reporting.
const STDERR_TAIL_LINES: usize = 256;
/// How long to wait for the child to exit before killing it.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Launch description for the agent CLI child process.
///
/// Flag construction belongs to the caller; the transport runs exactly the
/// argument vector it is given.
#[derive(Debug, Clone)]
pub struct CliCommand {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl CliCommand {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// [`Transport`] implementation over a supervised child process with piped
/// stdio. Stdin writes are serialized under a mutex; stdout is consumed one
/// JSON line at a time; stderr lines go to an optional sink and a bounded
/// tail buffer used when reporting process failures.
pub struct SubprocessTransport {
    command: CliCommand,
    stderr_sink: Option<mpsc::UnboundedSender<String>>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<Lines<BufReader<ChildStdout>>>>,
    stderr_tail: Arc<StdMutex<VecDeque<String>>>,
    stderr_task: StdMutex<Option<JoinHandle<()>>>,
    ready: AtomicBool,
}

impl SubprocessTransport {
    pub fn new(command: CliCommand) -> Self {
        Self {
            command,
            stderr_sink: None,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr_tail: Arc::new(StdMutex::new(VecDeque::new())),
            stderr_task: StdMutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// Forwards child stderr lines to `sink` instead of the debug log.
    /// Failures in the sink are ignored.
    pub fn stderr_sink(mut self, sink: mpsc::UnboundedSender<String>) -> Self {
        self.stderr_sink = Some(sink);
        self
    }

    fn stderr_snapshot(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail lock poisoned");
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[async_trait]
impl Transport for SubprocessTransport {
    async fn connect(&self) -> Result<(), AgentError> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(cwd) = &self.command.cwd {
            if !cwd.is_dir() {
                return Err(AgentError::WorkingDirectory { path: cwd.clone() });
            }
        }

        let mut command = tokio::process::Command::new(&self.command.binary);
        command
            .args(&self.command.args)
            .envs(&self.command.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.command.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| AgentError::Spawn {
            binary: self.command.binary.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Connection("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Connection("child stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::Connection("child stderr unavailable".into()))?;

        let tail = Arc::clone(&self.stderr_tail);
        let sink = self.stderr_sink.clone();
        let stderr_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                {
                    let mut tail = tail.lock().expect("stderr tail lock poisoned");
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.clone());
                }
                match &sink {
                    Some(sink) => {
                        let _ = sink.send(line);
                    }
                    None => debug!(target: "agent_client::stderr", "{line}"),
                }
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());
        *self.child.lock().await = Some(child);
        *self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned") = Some(stderr_handle);
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, line: &str) -> Result<(), AgentError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AgentError::Connection("stdin is closed".into()))?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write
            .await
            .map_err(|err| AgentError::Connection(format!("failed to write to stdin: {err}")))
    }

    async fn end_input(&self) -> Result<(), AgentError> {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    async fn read_message(&self) -> Result<Option<Value>, AgentError> {
        let mut guard = self.stdout.lock().await;
        let Some(lines) = guard.as_mut() else {
            return Ok(None);
        };

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(line) {
                        Ok(value) => return Ok(Some(value)),
                        Err(err) => {
                            warn!(error = %err, line, "dropping undecodable stdout line");
                        }
                    }
                }
                Ok(None) => {
                    guard.take();
                    drop(guard);
                    // The CLI closes stdout only on exit; a non-zero status
                    // here means it died mid-conversation.
                    let mut child_guard = self.child.lock().await;
                    if let Some(child) = child_guard.as_mut() {
                        if let Ok(Ok(status)) =
                            time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await
                        {
                            if !status.success() {
                                child_guard.take();
                                drop(child_guard);
                                // Let the stderr task finish draining so the
                                // tail is complete before it is reported.
                                let stderr_task = self
                                    .stderr_task
                                    .lock()
                                    .expect("stderr task lock poisoned")
                                    .take();
                                if let Some(handle) = stderr_task {
                                    let _ =
                                        time::timeout(Duration::from_secs(1), handle).await;
                                }
                                return Err(AgentError::ProcessExit {
                                    status,
                                    stderr: self.stderr_snapshot(),
                                });
                            }
                        }
                    }
                    return Ok(None);
                }
                Err(err) => {
                    guard.take();
                    return Err(AgentError::Connection(format!(
                        "failed to read from stdout: {err}"
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), AgentError> {
        self.ready.store(false, Ordering::SeqCst);
        self.end_input().await?;

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "agent process exited"),
                Ok(Err(err)) => warn!(error = %err, "failed waiting for agent process"),
                Err(_) => {
                    debug!("agent process did not exit in time, killing it");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        self.stdout.lock().await.take();
        if let Some(handle) = self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned")
            .take()
        {
            handle.abort();
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        if let Some(handle) = self
            .stderr_task
            .lock()
            .expect("stderr task lock poisoned")
            .take()
        {
            handle.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(child) = guard.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}
