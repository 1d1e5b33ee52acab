//! Engine instances: spawned child processes or in-process linked engines.
//!
//! Both packaging models end up as the same thing for the rest of the crate:
//! a byte reader, a byte writer, and an [`EngineProcess`] that can be probed,
//! waited on and killed.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{BridgeError, Result};
use crate::locator::{ArtifactLocation, EngineArtifact};

const PIPE_CAPACITY: usize = 64 * 1024;

pub type EngineReader = Box<dyn AsyncRead + Send + Unpin>;
pub type EngineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Entry point of an engine linked into the application.
///
/// The engine reads protocol lines from `input` and writes replies to
/// `output`, exactly as it would over stdio. Returning ends the instance;
/// the returned value is reported as its exit code.
#[async_trait]
pub trait InProcessEngine: Send + Sync {
    async fn run(&self, input: DuplexStream, output: DuplexStream) -> i32;
}

enum ProcessKind {
    Child(Child),
    Task(JoinHandle<i32>),
}

/// A running engine instance, owned by exactly one session.
pub struct EngineProcess {
    kind: ProcessKind,
    /// Cached exit status once observed; the inner `None` means "exited
    /// without a code" (signal, panic, abort).
    exit: Option<Option<i32>>,
}

impl EngineProcess {
    pub fn pid(&self) -> Option<u32> {
        match &self.kind {
            ProcessKind::Child(child) => child.id(),
            ProcessKind::Task(_) => None,
        }
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match &mut self.kind {
            ProcessKind::Child(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    self.exit = Some(status.code());
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll engine process");
                    false
                }
            },
            ProcessKind::Task(handle) => !handle.is_finished(),
        }
    }

    /// Wait for the engine to exit. Cancel safe.
    pub async fn wait(&mut self) -> Option<i32> {
        if let Some(code) = self.exit {
            return code;
        }
        let code = match &mut self.kind {
            ProcessKind::Child(child) => match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for engine process");
                    None
                }
            },
            ProcessKind::Task(handle) => match handle.await {
                Ok(code) => Some(code),
                Err(e) if e.is_panic() => {
                    tracing::error!("In-process engine panicked");
                    None
                }
                Err(_) => None,
            },
        };
        self.exit = Some(code);
        code
    }

    /// Ask the engine to terminate (SIGTERM on Unix). No-op for in-process engines.
    pub fn terminate(&self) {
        #[cfg(unix)]
        if let ProcessKind::Child(child) = &self.kind
            && let Some(pid) = child.id()
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM failed");
            }
        }
    }

    /// Force-terminate and reap.
    pub async fn kill(&mut self) -> Option<i32> {
        if self.exit.is_none() {
            match &mut self.kind {
                ProcessKind::Child(child) => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(error = %e, "Kill failed (engine already gone?)");
                    }
                }
                ProcessKind::Task(handle) => handle.abort(),
            }
        }
        self.wait().await
    }
}

/// A freshly launched engine, before the handshake.
pub struct LaunchedEngine {
    pub process: EngineProcess,
    pub reader: EngineReader,
    pub writer: EngineWriter,
}

/// Spawn or link the engine described by `artifact`.
///
/// Executables run with the artifact's directory as working directory so that
/// engine data files shipped alongside it (NNUE networks) resolve.
pub fn launch(artifact: &EngineArtifact, args: &[String]) -> Result<LaunchedEngine> {
    match &artifact.location {
        ArtifactLocation::Executable(path) => {
            let mut command = Command::new(path);
            command
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            if let Some(dir) = path.parent() {
                command.current_dir(dir);
            }

            let mut child = command.spawn().map_err(|e| {
                BridgeError::LaunchFailed(format!("failed to spawn {}: {e}", path.display()))
            })?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| BridgeError::LaunchFailed("stdin not captured".to_string()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BridgeError::LaunchFailed("stdout not captured".to_string()))?;

            tracing::debug!(path = %path.display(), pid = ?child.id(), "Spawned engine process");
            Ok(LaunchedEngine {
                process: EngineProcess {
                    kind: ProcessKind::Child(child),
                    exit: None,
                },
                reader: Box::new(stdout),
                writer: Box::new(stdin),
            })
        }
        ArtifactLocation::Linked(linked) => {
            let (bridge_reader, engine_output) = tokio::io::duplex(PIPE_CAPACITY);
            let (engine_input, bridge_writer) = tokio::io::duplex(PIPE_CAPACITY);

            let engine: Arc<dyn InProcessEngine> = Arc::clone(linked.engine());
            let handle = tokio::spawn(async move { engine.run(engine_input, engine_output).await });

            tracing::debug!(engine = %linked.name(), "Started in-process engine");
            Ok(LaunchedEngine {
                process: EngineProcess {
                    kind: ProcessKind::Task(handle),
                    exit: None,
                },
                reader: Box::new(bridge_reader),
                writer: Box::new(bridge_writer),
            })
        }
    }
}
