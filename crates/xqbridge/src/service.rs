//! EngineBridge: the single public surface for driving an engine.
//!
//! The bridge owns at most one session at a time and outlives it: command ids,
//! subscribers and the state channel carry over from one session to the next.
//! Raw protocol lines and OS handles never leave the crate.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::bridge::protocol::{Command, CommandClass, CommandId, Params, Verb};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{EngineEvent, EventHub, EventSink, Subscription};
use crate::locator::EngineLocator;
use crate::pump::{PumpMsg, Submission};
use crate::request::{PendingReply, Reply};
use crate::session::{Session, SessionInfo, SessionState, StopOutcome};

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Senders into the running session's pump.
#[derive(Clone)]
struct Channels {
    commands: mpsc::UnboundedSender<Submission>,
    control: mpsc::UnboundedSender<PumpMsg>,
    /// One permit per queued command; `submit` waits here when the queue is full.
    slots: Arc<Semaphore>,
}

pub struct EngineBridge {
    locator: Arc<dyn EngineLocator>,
    config: BridgeConfig,
    hub: Arc<EventHub>,
    /// Held across start/stop so they never interleave.
    session: Mutex<Option<Session>>,
    /// Readable while `session` is locked by a start in progress.
    channels: StdMutex<Option<Channels>>,
    info: StdMutex<Option<SessionInfo>>,
    /// Next command id. Held while queueing so ids reach the pump in order.
    next_id: StdMutex<CommandId>,
}

impl EngineBridge {
    pub fn new(locator: impl EngineLocator + 'static, config: BridgeConfig) -> Self {
        Self::with_locator(Arc::new(locator), config)
    }

    pub fn with_locator(locator: Arc<dyn EngineLocator>, config: BridgeConfig) -> Self {
        let hub = Arc::new(EventHub::new(config.event_capacity));
        Self {
            locator,
            config,
            hub,
            session: Mutex::new(None),
            channels: StdMutex::new(None),
            info: StdMutex::new(None),
            next_id: StdMutex::new(1),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Resolve, launch and handshake a new engine session.
    ///
    /// Fails with [`BridgeError::SessionActive`] unless there is no session or
    /// the previous one is `Stopped`/`Crashed`. A locator failure leaves the
    /// state untouched and spawns nothing.
    pub async fn start(&self) -> Result<SessionInfo> {
        let mut slot = self.session.lock().await;
        if self.hub.state().is_active() {
            return Err(BridgeError::SessionActive);
        }

        if let Some(previous) = slot.take() {
            let session_id = previous.id;
            let outcome = previous.stop(Duration::ZERO).await;
            tracing::debug!(%session_id, ?outcome, "Reaped previous session");
        }

        let artifact = Arc::new(self.locator.resolve()?);

        self.hub.set_state(SessionState::Starting);
        match Session::start(artifact, &self.config, Arc::clone(&self.hub)).await {
            Ok(session) => {
                *lock(&self.channels) = Some(Channels {
                    commands: session.pump.commands(),
                    control: session.pump.control(),
                    slots: session.pump.slots(),
                });
                let info = session.info(SessionState::Running);
                *lock(&self.info) = Some(info.clone());
                *slot = Some(session);
                Ok(info)
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to start");
                self.hub.set_state(SessionState::Crashed);
                Err(e)
            }
        }
    }

    /// Stop the current session. Always ends in `Stopped`.
    ///
    /// Commands still outstanding complete with [`BridgeError::SessionDead`].
    pub async fn stop(&self) -> Result<StopOutcome> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.take() else {
            return Err(BridgeError::SessionDead);
        };
        lock(&self.channels).take();

        if !self.hub.state().is_terminal() {
            self.hub.set_state(SessionState::Stopping);
        }
        let outcome = session.stop(self.config.stop_grace).await;
        if !outcome.graceful {
            tracing::warn!(exit_code = ?outcome.exit_code, "Engine was terminated forcibly");
        }
        self.hub.set_state(SessionState::Stopped);
        Ok(outcome)
    }

    /// Send a command and wait for its reply.
    pub async fn send(&self, verb: Verb, params: Params, deadline: Option<Duration>) -> Result<Reply> {
        self.submit(verb, params, deadline).await?.await
    }

    /// Queue a command and return a handle to its reply.
    ///
    /// `deadline` counts from submission. Reply-awaiting commands without one
    /// get the configured default. `stop` and `ponderhit` skip the queue.
    pub async fn submit(
        &self,
        verb: Verb,
        params: Params,
        deadline: Option<Duration>,
    ) -> Result<PendingReply> {
        if verb == Verb::Quit {
            return Err(BridgeError::InvalidCommand(
                "'quit' ends the session; use stop()".to_string(),
            ));
        }
        let class = verb.class();
        let deadline = match class.awaits_reply() {
            true => deadline.or(self.config.default_deadline),
            false => deadline,
        };
        let mut command = Command::new(0, verb, params).with_deadline(deadline);
        command.encode()?;

        if self.hub.state() != SessionState::Running {
            return Err(BridgeError::SessionDead);
        }
        let Some(channels) = lock(&self.channels).clone() else {
            return Err(BridgeError::SessionDead);
        };
        let (tx, rx) = oneshot::channel();

        if class == CommandClass::Control {
            command.id = self.next_command_id();
            let command_id = command.id;
            channels
                .control
                .send(PumpMsg::Control { command, reply: tx })
                .map_err(|_| BridgeError::SessionDead)?;
            let mut pending = PendingReply::new(command_id, rx, channels.control);
            // Already on the wire; nothing to cancel.
            pending.disarm();
            return Ok(pending);
        }

        let slot = Arc::clone(&channels.slots)
            .acquire_owned()
            .await
            .map_err(|_| BridgeError::SessionDead)?;
        let command_id = {
            let mut next = lock(&self.next_id);
            let command_id = *next;
            *next += 1;
            command.id = command_id;
            channels
                .commands
                .send(Submission {
                    command,
                    submitted_at: Instant::now(),
                    reply: tx,
                    slot,
                })
                .map_err(|_| BridgeError::SessionDead)?;
            command_id
        };
        tracing::debug!(command_id, ?class, "Queued command");

        Ok(PendingReply::new(command_id, rx, channels.control))
    }

    fn next_command_id(&self) -> CommandId {
        let mut next = lock(&self.next_id);
        let id = *next;
        *next += 1;
        id
    }

    /// Deliver events to `sink` until the returned subscription is dropped.
    pub fn subscribe(&self, sink: impl EventSink) -> Subscription {
        self.hub.subscribe(sink)
    }

    /// Raw receiver over the event stream.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.hub.receiver()
    }

    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.hub.watch_state()
    }

    pub fn status(&self) -> SessionState {
        self.hub.state()
    }

    /// Snapshot of the current (or most recent) session.
    pub fn session(&self) -> Option<SessionInfo> {
        let state = self.status();
        lock(&self.info).clone().map(|mut info| {
            info.state = state;
            info
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as TestMutex;

    use super::*;
    use crate::locator::{LinkedLocator, NativeDirLocator};
    use crate::testing::{Behavior, ScriptedEngine};

    fn scripted(behavior: Behavior, config: BridgeConfig) -> (EngineBridge, Arc<TestMutex<Vec<String>>>) {
        let engine = ScriptedEngine::new(behavior);
        let received = engine.received();
        let bridge = EngineBridge::new(LinkedLocator::new("scripted", Arc::new(engine)), config);
        (bridge, received)
    }

    fn bridge(behavior: Behavior) -> (EngineBridge, Arc<TestMutex<Vec<String>>>) {
        scripted(
            behavior,
            BridgeConfig::default().with_stop_grace(Duration::from_millis(200)),
        )
    }

    fn go(depth: u32) -> Params {
        vec![("depth".to_string(), depth.to_string())]
    }

    fn lines_starting(received: &TestMutex<Vec<String>>, prefix: &str) -> Vec<String> {
        received
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .cloned()
            .collect()
    }

    async fn wait_for_state(bridge: &EngineBridge, state: SessionState) {
        let mut rx = bridge.state_changes();
        tokio::time::timeout(Duration::from_secs(30), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn start_then_isready() {
        let (bridge, _) = bridge(Behavior::default());
        assert_eq!(bridge.status(), SessionState::Idle);
        assert!(bridge.session().is_none());

        let info = bridge.start().await.unwrap();
        assert_eq!(info.state, SessionState::Running);
        assert_eq!(info.identity.name.as_deref(), Some("ScriptedFish 1.0"));
        assert_eq!(bridge.status(), SessionState::Running);

        let reply = bridge.send(Verb::IsReady, Vec::new(), None).await.unwrap();
        assert_eq!(reply, Reply::Ready);

        let outcome = bridge.stop().await.unwrap();
        assert!(outcome.graceful);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(bridge.status(), SessionState::Stopped);
        assert_eq!(bridge.session().unwrap().state, SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn second_go_waits_for_first_bestmove() {
        let (bridge, received) = bridge(Behavior {
            search_time: Duration::from_millis(100),
            ..Default::default()
        });
        bridge.start().await.unwrap();

        let first = bridge.submit(Verb::Go, go(10), None).await.unwrap();
        let second = bridge.submit(Verb::Go, go(5), None).await.unwrap();
        assert!(first.command_id() < second.command_id());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lines_starting(&received, "go"), ["go depth 10"]);

        assert_eq!(first.await.unwrap().best_move(), Some("h2e2"));
        assert!(matches!(second.await.unwrap(), Reply::BestMove { .. }));
        assert_eq!(lines_starting(&received, "go"), ["go depth 10", "go depth 5"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn killed_engine_fails_inflight_search() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("pikafish");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             while read -r line; do\n\
               case \"$line\" in\n\
                 uci) echo 'id name ShellFish'; echo uciok ;;\n\
                 isready) echo readyok ;;\n\
                 go*) echo 'info depth 1 score cp 3 pv h2e2'; kill -9 $$ ;;\n\
                 quit) exit 0 ;;\n\
               esac\n\
             done\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let bridge = EngineBridge::new(NativeDirLocator::new(dir.path()), BridgeConfig::default());
        let mut events = bridge.events();
        let first = bridge.start().await.unwrap();
        assert_eq!(first.identity.name.as_deref(), Some("ShellFish"));

        let err = bridge.send(Verb::Go, go(10), None).await.unwrap_err();
        assert_eq!(err, BridgeError::EngineCrashed);
        assert_eq!(bridge.status(), SessionState::Crashed);
        assert_eq!(
            bridge.send(Verb::IsReady, Vec::new(), None).await,
            Err(BridgeError::SessionDead)
        );

        let mut saw_exit = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::EngineExit { code } = event {
                assert_eq!(code, None);
                saw_exit = true;
            }
        }
        assert!(saw_exit);

        // No automatic relaunch, but an explicit start works.
        let second = bridge.start().await.unwrap();
        assert_ne!(first.session_id, second.session_id);
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_artifact_spawns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = EngineBridge::new(NativeDirLocator::new(dir.path()), BridgeConfig::default());
        let err = bridge.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::ArtifactNotFound(_)));
        assert_eq!(bridge.status(), SessionState::Idle);
        assert!(bridge.session().is_none());
    }

    #[tokio::test]
    async fn garbage_mid_search_is_skipped() {
        let (bridge, _) = bridge(Behavior {
            garbage_during_search: true,
            ..Default::default()
        });
        bridge.start().await.unwrap();
        let mut events = bridge.events();

        let reply = bridge.send(Verb::Go, go(2), None).await.unwrap();
        assert_eq!(
            reply,
            Reply::BestMove {
                mv: "h2e2".into(),
                ponder: Some("h9g7".into())
            }
        );

        let mut depths = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::Info(info) = event {
                depths.push(info.depth);
            }
        }
        assert_eq!(depths, [Some(1), Some(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_stops_search_and_probe_keeps_session() {
        let (bridge, received) = bridge(Behavior {
            search_time: Duration::from_secs(60),
            ..Default::default()
        });
        bridge.start().await.unwrap();

        let pending = bridge
            .submit(Verb::Go, go(40), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let command_id = pending.command_id();
        assert_eq!(pending.await, Err(BridgeError::Timeout { command_id }));

        // The late bestmove is swallowed; the next command works normally.
        let reply = bridge.send(Verb::IsReady, Vec::new(), None).await.unwrap();
        assert_eq!(reply, Reply::Ready);
        assert_eq!(bridge.status(), SessionState::Running);

        let lines = received.lock().unwrap().clone();
        let go_at = lines.iter().position(|l| l == "go depth 40").unwrap();
        assert_eq!(lines[go_at + 1], "stop");
        assert_eq!(lines[go_at + 2], "isready");
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_engine_is_declared_crashed() {
        let config = BridgeConfig::default().with_probe_timeout(Duration::from_secs(3));
        let (bridge, _) = scripted(
            Behavior {
                hang_on_go: true,
                ..Default::default()
            },
            config,
        );
        bridge.start().await.unwrap();

        let err = bridge
            .send(Verb::Go, go(12), Some(Duration::from_millis(500)))
            .await;
        assert!(matches!(err, Err(BridgeError::Timeout { .. })));
        assert_eq!(bridge.status(), SessionState::Running);

        wait_for_state(&bridge, SessionState::Crashed).await;
        let outcome = bridge.stop().await.unwrap();
        assert!(!outcome.graceful);
        assert_eq!(bridge.status(), SessionState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_deadline_runs_behind_an_infinite_search() {
        let (bridge, received) = bridge(Behavior::default());
        bridge.start().await.unwrap();

        let search = bridge
            .submit(Verb::Go, vec![("infinite".to_string(), String::new())], None)
            .await
            .unwrap();
        let ready = bridge
            .submit(Verb::IsReady, Vec::new(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let ready_id = ready.command_id();
        assert_eq!(ready.await, Err(BridgeError::Timeout { command_id: ready_id }));

        // Only the handshake's isready ever reached the engine.
        assert_eq!(lines_starting(&received, "isready"), ["isready"]);
        assert_eq!(bridge.status(), SessionState::Running);

        bridge.send(Verb::Stop, Vec::new(), None).await.unwrap();
        assert_eq!(search.await.unwrap().best_move(), Some("h2e2"));
        assert_eq!(lines_starting(&received, "isready"), ["isready"]);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_ignoring_stop_after_cancel_is_declared_crashed() {
        let config = BridgeConfig::default()
            .with_stop_grace(Duration::from_millis(200))
            .with_probe_timeout(Duration::from_secs(2));
        let (bridge, received) = scripted(
            Behavior {
                search_time: Duration::from_secs(60),
                ignore_stop: true,
                ..Default::default()
            },
            config,
        );
        bridge.start().await.unwrap();

        let mut search = bridge.submit(Verb::Go, go(30), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        search.cancel();
        let search_id = search.command_id();
        assert_eq!(search.await, Err(BridgeError::Cancelled { command_id: search_id }));

        let started = Instant::now();
        assert_eq!(
            bridge.send(Verb::IsReady, Vec::new(), None).await,
            Err(BridgeError::EngineCrashed)
        );
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(bridge.status(), SessionState::Crashed);
        assert_eq!(lines_starting(&received, "stop"), ["stop"]);
        assert_eq!(lines_starting(&received, "isready"), ["isready"]);

        let outcome = bridge.stop().await.unwrap();
        assert!(!outcome.graceful);
    }

    #[tokio::test]
    async fn engine_exit_on_go_fails_search_and_queue() {
        let (bridge, _) = bridge(Behavior {
            exit_on_go: Some(3),
            ..Default::default()
        });
        bridge.start().await.unwrap();
        let mut events = bridge.events();

        let search = bridge.submit(Verb::Go, go(10), None).await.unwrap();
        let ready = bridge.submit(Verb::IsReady, Vec::new(), None).await.unwrap();
        let next = bridge.submit(Verb::Go, go(4), None).await.unwrap();

        assert_eq!(search.await, Err(BridgeError::EngineCrashed));
        assert_eq!(ready.await, Err(BridgeError::EngineCrashed));
        assert_eq!(next.await, Err(BridgeError::EngineCrashed));
        assert_eq!(bridge.status(), SessionState::Crashed);

        let mut codes = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::EngineExit { code } = event {
                codes.push(code);
            }
        }
        assert_eq!(codes, [Some(3)]);
        assert_eq!(bridge.stop().await.unwrap().exit_code, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_queued_and_running_commands() {
        let (bridge, received) = bridge(Behavior {
            search_time: Duration::from_secs(60),
            ..Default::default()
        });
        bridge.start().await.unwrap();

        let mut running = bridge.submit(Verb::Go, go(30), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let mut queued = bridge.submit(Verb::Go, go(5), None).await.unwrap();

        queued.cancel();
        let queued_id = queued.command_id();
        assert_eq!(queued.await, Err(BridgeError::Cancelled { command_id: queued_id }));

        running.cancel();
        let running_id = running.command_id();
        assert_eq!(running.await, Err(BridgeError::Cancelled { command_id: running_id }));

        assert_eq!(
            bridge.send(Verb::IsReady, Vec::new(), None).await,
            Ok(Reply::Ready)
        );
        assert_eq!(lines_starting(&received, "go"), ["go depth 30"]);
        assert_eq!(lines_starting(&received, "stop"), ["stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_reply_cancels_it() {
        let (bridge, received) = bridge(Behavior {
            search_time: Duration::from_secs(60),
            ..Default::default()
        });
        bridge.start().await.unwrap();

        let pending = bridge.submit(Verb::Go, go(30), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        drop(pending);

        assert_eq!(
            bridge.send(Verb::IsReady, Vec::new(), None).await,
            Ok(Reply::Ready)
        );
        assert_eq!(lines_starting(&received, "stop"), ["stop"]);
    }

    #[tokio::test]
    async fn stop_command_bypasses_the_queue() {
        let (bridge, _) = bridge(Behavior::default());
        bridge.start().await.unwrap();

        let search = bridge
            .submit(Verb::Go, vec![("infinite".to_string(), String::new())], None)
            .await
            .unwrap();
        let sent = bridge.send(Verb::Stop, Vec::new(), None).await.unwrap();
        assert_eq!(sent, Reply::Sent);
        assert_eq!(search.await.unwrap().best_move(), Some("h2e2"));
    }

    #[tokio::test]
    async fn stop_fails_outstanding_search_with_session_dead() {
        let (bridge, received) = bridge(Behavior {
            search_time: Duration::from_secs(60),
            ..Default::default()
        });
        bridge.start().await.unwrap();

        let search = bridge.submit(Verb::Go, go(30), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = bridge.stop().await.unwrap();
        assert!(outcome.graceful);
        assert_eq!(search.await, Err(BridgeError::SessionDead));

        let tail: Vec<String> = received.lock().unwrap().iter().rev().take(2).cloned().collect();
        assert_eq!(tail, ["quit", "stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_ignoring_quit_is_killed() {
        let (bridge, _) = bridge(Behavior {
            ignore_quit: true,
            ..Default::default()
        });
        bridge.start().await.unwrap();
        let outcome = bridge.stop().await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome {
                graceful: false,
                exit_code: None
            }
        );
        assert_eq!(bridge.status(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn start_and_send_preconditions() {
        let (bridge, _) = bridge(Behavior::default());
        assert_eq!(
            bridge.send(Verb::IsReady, Vec::new(), None).await,
            Err(BridgeError::SessionDead)
        );
        assert_eq!(bridge.stop().await, Err(BridgeError::SessionDead));

        bridge.start().await.unwrap();
        assert_eq!(bridge.start().await.unwrap_err(), BridgeError::SessionActive);

        assert!(matches!(
            bridge.send(Verb::Quit, Vec::new(), None).await,
            Err(BridgeError::InvalidCommand(_))
        ));
        let injected = vec![("name".to_string(), "Hash\nquit".to_string())];
        assert!(matches!(
            bridge.send(Verb::SetOption, injected, None).await,
            Err(BridgeError::InvalidCommand(_))
        ));
        assert_eq!(bridge.status(), SessionState::Running);
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn custom_verbs_cannot_pose_as_builtins() {
        let (bridge, received) = bridge(Behavior::default());
        bridge.start().await.unwrap();

        for verb in ["quit", "go", "isready"] {
            assert!(matches!(
                bridge.send(Verb::Custom(verb.into()), Vec::new(), None).await,
                Err(BridgeError::InvalidCommand(_))
            ));
        }
        assert_eq!(bridge.status(), SessionState::Running);
        assert!(lines_starting(&received, "quit").is_empty());
        assert!(lines_starting(&received, "go").is_empty());
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unattributed_engine_errors_become_events() {
        let (bridge, _) = bridge(Behavior::default());
        bridge.start().await.unwrap();
        let mut events = bridge.events();

        let sent = bridge
            .send(Verb::Custom("frobnicate".into()), Vec::new(), None)
            .await
            .unwrap();
        assert_eq!(sent, Reply::Sent);
        // isready is answered after the error line, so the event is already out.
        bridge.send(Verb::IsReady, Vec::new(), None).await.unwrap();

        let mut messages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::EngineError { message } = event {
                messages.push(message);
            }
        }
        assert_eq!(
            messages,
            ["Unknown command: 'frobnicate'. Type help for more information."]
        );
    }

    #[tokio::test]
    async fn command_ids_keep_increasing_across_restarts() {
        let (bridge, _) = bridge(Behavior::default());
        bridge.start().await.unwrap();
        let first = bridge.submit(Verb::IsReady, Vec::new(), None).await.unwrap();
        let first_id = first.command_id();
        first.await.unwrap();
        bridge.stop().await.unwrap();

        bridge.start().await.unwrap();
        let second = bridge.submit(Verb::IsReady, Vec::new(), None).await.unwrap();
        assert!(second.command_id() > first_id);
        second.await.unwrap();
        bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn subscribers_see_lifecycle() {
        let (bridge, _) = bridge(Behavior::default());
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let _sub = bridge.subscribe(move |event: EngineEvent| {
            if let EngineEvent::StateChanged { to, .. } = event {
                sink_seen.lock().unwrap().push(to);
            }
        });

        bridge.start().await.unwrap();
        bridge.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while seen.lock().unwrap().len() < 4 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            seen.lock().unwrap().as_slice(),
            [
                SessionState::Starting,
                SessionState::Running,
                SessionState::Stopping,
                SessionState::Stopped
            ]
        );
    }
}
