//! Engine session lifecycle: launch, handshake, stop.
//!
//! A [`Session`] owns exactly one engine instance from launch until it is
//! stopped or crashes. Once the handshake completes the instance is handed to
//! the pump, which becomes the only reader and writer of its streams.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, FramedWrite};
use uuid::Uuid;

use crate::bridge::codec::{CodecError, UciCodec};
use crate::bridge::protocol::{Command, ResponseEvent, Verb};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::EventHub;
use crate::locator::{EngineArtifact, PlatformId};
use crate::process::{self, EngineReader, EngineWriter, LaunchedEngine};
use crate::pump::{self, PumpHandle};
use crate::version::EngineIdentity;

/// Command id used for lines the bridge sends on its own behalf.
pub(crate) const INTERNAL_COMMAND_ID: u64 = 0;

pub(crate) type EngineFramedRead = FramedRead<EngineReader, UciCodec>;
pub(crate) type EngineFramedWrite = FramedWrite<EngineWriter, UciCodec>;

/// Lifecycle state of the bridge's engine session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No session has been started yet
    #[default]
    Idle,
    /// Launching and handshaking
    Starting,
    /// Accepting commands
    Running,
    /// stop() in progress
    Stopping,
    Stopped,
    /// Engine exited or hung unexpectedly
    Crashed,
}

impl SessionState {
    /// Whether a session in this state still owns an engine instance.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

/// Read-only snapshot of the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub platform: PlatformId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub identity: EngineIdentity,
}

/// How a stop went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    /// The engine exited on its own after `quit`.
    pub graceful: bool,
    pub exit_code: Option<i32>,
}

impl StopOutcome {
    pub(crate) fn forced(exit_code: Option<i32>) -> Self {
        Self {
            graceful: false,
            exit_code,
        }
    }
}

pub(crate) struct Session {
    pub id: Uuid,
    pub artifact: Arc<EngineArtifact>,
    pub started_at: DateTime<Utc>,
    pub identity: EngineIdentity,
    pub pump: PumpHandle,
}

impl Session {
    /// Launch the engine, run the handshake and hand the streams to a pump.
    pub async fn start(
        artifact: Arc<EngineArtifact>,
        config: &BridgeConfig,
        hub: Arc<EventHub>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!(session_id = %id, artifact = %artifact, "Starting engine session");

        let LaunchedEngine {
            mut process,
            reader,
            writer,
        } = process::launch(&artifact, &config.engine_args)?;
        tracing::debug!(session_id = %id, pid = ?process.pid(), "Engine launched");

        let mut reader = FramedRead::new(reader, UciCodec::with_max_length(config.max_line_length));
        let mut writer = FramedWrite::new(writer, UciCodec::with_max_length(config.max_line_length));

        let identity = match handshake(
            &mut reader,
            &mut writer,
            &config.startup_options,
            config.handshake_timeout,
        )
        .await
        {
            Ok(identity) => identity,
            Err(e) => {
                let code = process.kill().await;
                tracing::warn!(session_id = %id, error = %e, exit_code = ?code, "Engine handshake failed");
                return Err(e);
            }
        };

        tracing::info!(
            session_id = %id,
            engine = identity.name.as_deref().unwrap_or("unknown"),
            options = identity.options.len(),
            "Engine ready"
        );

        // Running before the pump exists, so a crash it reports cannot be overwritten.
        hub.set_state(SessionState::Running);
        let pump = pump::spawn(pump::PumpParts {
            session_id: id,
            process,
            reader,
            writer,
            hub,
            queue_capacity: config.queue_capacity,
            probe_timeout: config.probe_timeout,
        });

        Ok(Self {
            id,
            artifact,
            started_at,
            identity,
            pump,
        })
    }

    pub fn info(&self, state: SessionState) -> SessionInfo {
        SessionInfo {
            session_id: self.id,
            state,
            started_at: self.started_at,
            platform: self.artifact.platform,
            engine_version: self.artifact.version.clone(),
            identity: self.identity.clone(),
        }
    }

    /// Shut the engine down, escalating from `quit` to SIGTERM to kill.
    pub async fn stop(self, grace: Duration) -> StopOutcome {
        tracing::info!(session_id = %self.id, ?grace, "Stopping engine session");
        self.pump.shutdown(grace).await
    }
}

fn stream_error(e: CodecError) -> BridgeError {
    match e {
        CodecError::Io(e) => BridgeError::LaunchFailed(format!("engine stream failed: {e}")),
        CodecError::Command(e) => e,
    }
}

async fn send_internal(writer: &mut EngineFramedWrite, verb: Verb, params: Vec<(String, String)>) -> Result<()> {
    let line = Command::new(INTERNAL_COMMAND_ID, verb, params).encode()?;
    writer.send(line.as_str()).await.map_err(stream_error)
}

/// Read until `done` matches, collecting handshake metadata on the way.
async fn read_until(
    reader: &mut EngineFramedRead,
    identity: &mut EngineIdentity,
    done: fn(&ResponseEvent) -> bool,
) -> Result<()> {
    loop {
        match reader.next().await {
            Some(Ok(Ok(event))) if done(&event) => return Ok(()),
            Some(Ok(Ok(ResponseEvent::Id { field, value }))) => identity.record_id(&field, value),
            Some(Ok(Ok(ResponseEvent::Option(decl)))) => identity.options.push(decl),
            Some(Ok(Ok(ResponseEvent::Error { message }))) => {
                tracing::warn!(%message, "Engine rejected a handshake line");
            }
            Some(Ok(Ok(other))) => {
                tracing::debug!(event = other.tag(), "Ignoring event during handshake");
            }
            Some(Ok(Err(e))) => {
                tracing::debug!(error = %e, "Dropping unparseable line during handshake");
            }
            Some(Err(e)) => return Err(stream_error(e)),
            None => {
                return Err(BridgeError::LaunchFailed(
                    "engine exited during handshake".to_string(),
                ));
            }
        }
    }
}

/// `uci` → `uciok`, startup options, then `isready` → `readyok`, all within `timeout`.
pub(crate) async fn handshake(
    reader: &mut EngineFramedRead,
    writer: &mut EngineFramedWrite,
    startup_options: &[(String, String)],
    timeout: Duration,
) -> Result<EngineIdentity> {
    let exchange = async {
        let mut identity = EngineIdentity::new();

        send_internal(writer, Verb::Uci, Vec::new()).await?;
        read_until(reader, &mut identity, |e| matches!(e, ResponseEvent::UciOk)).await?;

        for (name, value) in startup_options {
            if identity.option(name).is_none() {
                tracing::warn!(option = %name, "Engine did not declare startup option");
            }
            let params = vec![
                ("name".to_string(), name.clone()),
                ("value".to_string(), value.clone()),
            ];
            send_internal(writer, Verb::SetOption, params).await?;
        }

        send_internal(writer, Verb::IsReady, Vec::new()).await?;
        read_until(reader, &mut identity, |e| matches!(e, ResponseEvent::Ready)).await?;
        Ok(identity)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(BridgeError::HandshakeTimeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, ScriptedEngine};

    fn framed_pair(engine: ScriptedEngine) -> (EngineFramedRead, EngineFramedWrite) {
        let (bridge_reader, engine_output) = tokio::io::duplex(4096);
        let (engine_input, bridge_writer) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            use crate::process::InProcessEngine;
            engine.run(engine_input, engine_output).await
        });
        (
            FramedRead::new(Box::new(bridge_reader) as EngineReader, UciCodec::new()),
            FramedWrite::new(Box::new(bridge_writer) as EngineWriter, UciCodec::new()),
        )
    }

    #[tokio::test]
    async fn handshake_collects_identity_and_applies_options() {
        let engine = ScriptedEngine::new(Behavior::default());
        let received = engine.received();
        let (mut reader, mut writer) = framed_pair(engine);

        let options = vec![("Threads".to_string(), "2".to_string())];
        let identity = handshake(&mut reader, &mut writer, &options, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(identity.name.as_deref(), Some("ScriptedFish 1.0"));
        assert!(identity.option("threads").is_some());
        assert_eq!(
            received.lock().unwrap().as_slice(),
            ["uci", "setoption name Threads value 2", "isready"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silent_engine_times_out() {
        let engine = ScriptedEngine::new(Behavior {
            silent: true,
            ..Default::default()
        });
        let (mut reader, mut writer) = framed_pair(engine);
        let err = handshake(&mut reader, &mut writer, &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::HandshakeTimeout);
    }

    #[tokio::test]
    async fn engine_exit_during_handshake_is_launch_failure() {
        let engine = ScriptedEngine::new(Behavior {
            exit_on_uci: true,
            ..Default::default()
        });
        let (mut reader, mut writer) = framed_pair(engine);
        let err = handshake(&mut reader, &mut writer, &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::LaunchFailed(_)));
    }

    #[test]
    fn state_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                SessionState::Idle,
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopping,
                SessionState::Stopped,
                SessionState::Crashed,
            ],
            @r#"
        [
          "IDLE",
          "STARTING",
          "RUNNING",
          "STOPPING",
          "STOPPED",
          "CRASHED"
        ]
        "#
        );
    }

    #[test]
    fn state_predicates() {
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Stopping.is_active());
        assert!(!SessionState::Crashed.is_active());
        assert!(SessionState::Crashed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
