//! Command/response pump: the single writer and reader of one engine session.
//!
//! One reader task decodes engine output and forwards it to the pump loop.
//! The loop owns the writer, the pending table and the process, and is the
//! only place any of them change. Submissions move from the submit channel
//! into a local queue as soon as they arrive, so their deadlines run while
//! they wait. A queued command is written only while the pending table is
//! empty, so it is never sent before the previous one's terminal event.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::Instrument;
use uuid::Uuid;

use crate::bridge::codec::CodecError;
use crate::bridge::protocol::{Command, CommandClass, CommandId, ResponseEvent, Verb};
use crate::error::BridgeError;
use crate::events::{EngineEvent, EventHub};
use crate::pending::{Completion, PendingRequest, PendingTable, ReplySender};
use crate::process::EngineProcess;
use crate::request::Reply;
use crate::session::{
    EngineFramedRead, EngineFramedWrite, INTERNAL_COMMAND_ID, SessionState, StopOutcome,
};

const INBOUND_CAPACITY: usize = 256;
/// How long an engine gets to finish exiting after its output closed.
const EXIT_DRAIN: Duration = Duration::from_millis(250);
/// How long SIGTERM gets before the engine is killed.
const TERM_WAIT: Duration = Duration::from_millis(500);

/// A queued caller command.
pub(crate) struct Submission {
    pub command: Command,
    pub submitted_at: Instant,
    pub reply: ReplySender,
    /// Queue capacity held until the command is written or dropped.
    pub slot: OwnedSemaphorePermit,
}

impl Submission {
    fn deadline(&self) -> Option<Instant> {
        self.command.deadline.map(|d| self.submitted_at + d)
    }
}

/// Out-of-band requests to the pump. Never queued behind commands.
pub(crate) enum PumpMsg {
    Cancel(CommandId),
    /// `stop`/`ponderhit`, written immediately.
    Control {
        command: Command,
        reply: ReplySender,
    },
    Shutdown {
        grace: Duration,
    },
}

enum Inbound {
    Event(Result<ResponseEvent, BridgeError>),
    Closed(Option<String>),
}

/// The engine can no longer be talked to.
struct EngineLost(String);

pub(crate) struct PumpParts {
    pub session_id: Uuid,
    pub process: EngineProcess,
    pub reader: EngineFramedRead,
    pub writer: EngineFramedWrite,
    pub hub: Arc<EventHub>,
    pub queue_capacity: usize,
    pub probe_timeout: Duration,
}

pub(crate) struct PumpHandle {
    commands: mpsc::UnboundedSender<Submission>,
    control: mpsc::UnboundedSender<PumpMsg>,
    slots: Arc<Semaphore>,
    task: JoinHandle<StopOutcome>,
}

impl PumpHandle {
    pub fn commands(&self) -> mpsc::UnboundedSender<Submission> {
        self.commands.clone()
    }

    /// Permits bounding how many submissions may wait in the queue.
    pub fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.slots)
    }

    pub fn control(&self) -> mpsc::UnboundedSender<PumpMsg> {
        self.control.clone()
    }

    /// Stop the engine and wait for the pump to finish. If the pump already
    /// ended (crash), its final outcome is returned.
    pub async fn shutdown(self, grace: Duration) -> StopOutcome {
        let _ = self.control.send(PumpMsg::Shutdown { grace });
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Pump task failed");
                StopOutcome::forced(None)
            }
        }
    }
}

pub(crate) fn spawn(parts: PumpParts) -> PumpHandle {
    let span = tracing::info_span!("engine_session", session_id = %parts.session_id);

    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let slots = Arc::new(Semaphore::new(parts.queue_capacity));
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

    let reader_task = tokio::spawn(read_engine(parts.reader, inbound_tx).instrument(span.clone()));

    let pump = Pump {
        process: parts.process,
        writer: parts.writer,
        inbound: inbound_rx,
        commands: commands_rx,
        control: control_rx,
        slots: Arc::clone(&slots),
        queue: VecDeque::new(),
        table: PendingTable::new(),
        early_cancels: HashSet::new(),
        last_received: INTERNAL_COMMAND_ID,
        hub: parts.hub,
        probe_timeout: parts.probe_timeout,
        reader_task,
    };
    let task = tokio::spawn(pump.run().instrument(span));

    PumpHandle {
        commands: commands_tx,
        control: control_tx,
        slots,
        task,
    }
}

async fn read_engine(mut reader: EngineFramedRead, tx: mpsc::Sender<Inbound>) {
    loop {
        match reader.next().await {
            Some(Ok(item)) => {
                if tx.send(Inbound::Event(item)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                let _ = tx.send(Inbound::Closed(Some(e.to_string()))).await;
                break;
            }
            None => {
                let _ = tx.send(Inbound::Closed(None)).await;
                break;
            }
        }
    }
    tracing::debug!("Engine reader task exiting");
}

struct Pump {
    process: EngineProcess,
    writer: EngineFramedWrite,
    inbound: mpsc::Receiver<Inbound>,
    commands: mpsc::UnboundedReceiver<Submission>,
    control: mpsc::UnboundedReceiver<PumpMsg>,
    slots: Arc<Semaphore>,
    /// Received but not yet written, in submission order.
    queue: VecDeque<Submission>,
    table: PendingTable,
    /// Cancels for commands still sitting in the submit channel.
    early_cancels: HashSet<CommandId>,
    /// Submission ids are increasing, so anything above this is still in the channel.
    last_received: CommandId,
    hub: Arc<EventHub>,
    probe_timeout: Duration,
    reader_task: JoinHandle<()>,
}

impl Pump {
    async fn run(mut self) -> StopOutcome {
        loop {
            if let Err(lost) = self.dispatch_queued().await {
                return self.crash(lost).await;
            }
            let deadline = self.next_deadline();

            tokio::select! {
                biased;

                msg = self.control.recv() => match msg {
                    Some(PumpMsg::Cancel(command_id)) => {
                        if let Err(lost) = self.cancel(command_id).await {
                            return self.crash(lost).await;
                        }
                    }
                    Some(PumpMsg::Control { command, reply }) => {
                        if let Err(lost) = self.write_control(command, reply).await {
                            return self.crash(lost).await;
                        }
                    }
                    Some(PumpMsg::Shutdown { grace }) => return self.shutdown(grace).await,
                    None => {
                        tracing::debug!("Bridge dropped; shutting engine down");
                        return self.shutdown(Duration::ZERO).await;
                    }
                },

                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Event(Ok(event))) => self.on_event(event),
                    Some(Inbound::Event(Err(e))) => {
                        tracing::debug!(error = %e, "Dropping unparseable engine line");
                    }
                    Some(Inbound::Closed(error)) => {
                        let reason = match error {
                            Some(e) => format!("engine output failed: {e}"),
                            None => "engine output closed".to_string(),
                        };
                        return self.crash(EngineLost(reason)).await;
                    }
                    None => return self.crash(EngineLost("engine reader stopped".into())).await,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Err(lost) = self.on_deadlines().await {
                        return self.crash(lost).await;
                    }
                }

                submission = self.commands.recv() => match submission {
                    Some(submission) => self.enqueue(submission),
                    None => {
                        tracing::debug!("Submit channel closed; shutting engine down");
                        return self.shutdown(Duration::ZERO).await;
                    }
                },
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let queued = self.queue.iter().filter_map(Submission::deadline).min();
        match (self.table.next_deadline(), queued) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn enqueue(&mut self, submission: Submission) {
        let command_id = submission.command.id;
        self.last_received = self.last_received.max(command_id);
        if self.early_cancels.remove(&command_id) {
            tracing::debug!(command_id, "Dropping command cancelled before it arrived");
            return;
        }
        self.queue.push_back(submission);
    }

    /// Write queued commands while nothing is outstanding.
    async fn dispatch_queued(&mut self) -> Result<(), EngineLost> {
        while self.table.is_empty()
            && let Some(submission) = self.queue.pop_front()
        {
            self.dispatch(submission).await?;
        }
        Ok(())
    }

    async fn write(&mut self, command: &Command) -> Result<String, CodecError> {
        let line = command.encode()?;
        self.writer.send(line.as_str()).await?;
        tracing::debug!(command_id = command.id, verb = %command.verb, "Sent command");
        Ok(line)
    }

    async fn write_internal(&mut self, verb: Verb) -> Result<String, EngineLost> {
        let command = Command::new(INTERNAL_COMMAND_ID, verb, Vec::new());
        self.write(&command)
            .await
            .map_err(|e| EngineLost(format!("failed to send {}: {e}", command.verb)))
    }

    async fn dispatch(&mut self, submission: Submission) -> Result<(), EngineLost> {
        let deadline = submission.deadline();
        let Submission {
            command,
            reply,
            slot,
            ..
        } = submission;
        drop(slot);
        let command_id = command.id;

        if deadline.is_some_and(|d| d <= Instant::now()) {
            tracing::warn!(command_id, "Command deadline elapsed while queued");
            let _ = reply.send(Err(BridgeError::Timeout { command_id }));
            return Ok(());
        }

        if !self.process.is_alive() {
            let _ = reply.send(Err(BridgeError::EngineCrashed));
            return Err(EngineLost("engine exited while idle".into()));
        }

        let line = match self.write(&command).await {
            Ok(line) => line,
            Err(CodecError::Command(e)) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
            Err(CodecError::Io(e)) => {
                let _ = reply.send(Err(BridgeError::EngineCrashed));
                return Err(EngineLost(format!("failed to write command {command_id}: {e}")));
            }
        };

        let class = command.verb.class();
        if class.awaits_reply() {
            self.table.push(
                PendingRequest::new(command_id, class, line, Completion::Caller(reply))
                    .with_deadline(deadline),
            );
        } else {
            let _ = reply.send(Ok(Reply::Sent));
        }
        Ok(())
    }

    async fn write_control(&mut self, command: Command, reply: ReplySender) -> Result<(), EngineLost> {
        match self.write(&command).await {
            Ok(_) => {
                let _ = reply.send(Ok(Reply::Sent));
                Ok(())
            }
            Err(CodecError::Command(e)) => {
                let _ = reply.send(Err(e));
                Ok(())
            }
            Err(CodecError::Io(e)) => {
                let _ = reply.send(Err(BridgeError::EngineCrashed));
                Err(EngineLost(format!("failed to write {}: {e}", command.verb)))
            }
        }
    }

    fn on_event(&mut self, event: ResponseEvent) {
        match event {
            ResponseEvent::Info(info) => self.hub.publish(EngineEvent::Info(info)),
            ResponseEvent::Error { message } => match self.table.take_quoted_error(&message) {
                Some(entry) => {
                    tracing::warn!(command_id = entry.command_id, %message, "Engine rejected command");
                    if let Some(Completion::Caller(tx)) = entry.completion {
                        let _ = tx.send(Err(BridgeError::Engine(message)));
                    }
                }
                None => {
                    tracing::warn!(%message, "Engine reported an error");
                    self.hub.publish(EngineEvent::EngineError { message });
                }
            },
            event @ (ResponseEvent::Ready | ResponseEvent::UciOk | ResponseEvent::BestMove { .. }) => {
                match self.table.take_answered(&event) {
                    Some(entry) => complete(entry, event),
                    None => {
                        tracing::debug!(event = event.tag(), "Dropping terminal event with no pending command");
                    }
                }
            }
            ResponseEvent::Id { .. } | ResponseEvent::Option(_) | ResponseEvent::EngineExit { .. } => {
                tracing::debug!(event = event.tag(), "Ignoring engine metadata");
            }
        }
    }

    async fn on_deadlines(&mut self) -> Result<(), EngineLost> {
        let now = Instant::now();
        if let Some(command_id) = self.table.stalled(now) {
            return Err(EngineLost(format!(
                "engine never finished abandoned command {command_id}"
            )));
        }

        for submission in std::mem::take(&mut self.queue) {
            if submission.deadline().is_some_and(|d| d <= now) {
                let command_id = submission.command.id;
                tracing::warn!(command_id, "Command deadline elapsed while queued");
                let _ = submission.reply.send(Err(BridgeError::Timeout { command_id }));
            } else {
                self.queue.push_back(submission);
            }
        }

        let mut needs_probe = false;
        for expired in self.table.expire(now, now + self.probe_timeout) {
            match expired.completion {
                Completion::Caller(tx) => {
                    tracing::warn!(
                        command_id = expired.command_id,
                        class = ?expired.class,
                        "Command deadline elapsed"
                    );
                    let _ = tx.send(Err(BridgeError::Timeout {
                        command_id: expired.command_id,
                    }));
                    if expired.class == CommandClass::Search {
                        self.write_internal(Verb::Stop).await?;
                    }
                    needs_probe = true;
                }
                Completion::Probe => {
                    return Err(EngineLost("engine did not answer the liveness probe".into()));
                }
            }
        }

        if needs_probe && !self.table.has_probe() {
            let line = self.write_internal(Verb::IsReady).await?;
            tracing::debug!(timeout = ?self.probe_timeout, "Probing engine liveness");
            self.table.push(
                PendingRequest::new(INTERNAL_COMMAND_ID, CommandClass::Sync, line, Completion::Probe)
                    .with_deadline(Some(Instant::now() + self.probe_timeout)),
            );
        }
        Ok(())
    }

    async fn cancel(&mut self, command_id: CommandId) -> Result<(), EngineLost> {
        if let Some(pos) = self.queue.iter().position(|s| s.command.id == command_id) {
            // The caller settled itself; the command is simply never written.
            self.queue.remove(pos);
            tracing::debug!(command_id, "Dropped queued command");
            return Ok(());
        }
        if command_id > self.last_received {
            self.early_cancels.insert(command_id);
            return Ok(());
        }
        match self.table.discard(command_id, Instant::now() + self.probe_timeout) {
            Some((class, tx)) => {
                tracing::info!(command_id, class = ?class, "Command cancelled");
                let _ = tx.send(Err(BridgeError::Cancelled { command_id }));
                if class == CommandClass::Search {
                    self.write_internal(Verb::Stop).await?;
                }
            }
            None => tracing::debug!(command_id, "Cancel for a command that already finished"),
        }
        Ok(())
    }

    /// Complete everything still outstanding with `err`.
    fn fail_outstanding(&mut self, err: BridgeError) {
        for entry in self.table.drain() {
            if let Some(Completion::Caller(tx)) = entry.completion {
                let _ = tx.send(Err(err.clone()));
            }
        }
        self.slots.close();
        self.commands.close();
        while let Ok(submission) = self.commands.try_recv() {
            self.queue.push_back(submission);
        }
        for submission in self.queue.drain(..) {
            let _ = submission.reply.send(Err(err.clone()));
        }
        self.control.close();
        while let Ok(msg) = self.control.try_recv() {
            if let PumpMsg::Control { reply, .. } = msg {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    async fn crash(mut self, EngineLost(reason): EngineLost) -> StopOutcome {
        self.reader_task.abort();
        let exit_code = match timeout(EXIT_DRAIN, self.process.wait()).await {
            Ok(code) => code,
            Err(_) => self.process.kill().await,
        };
        tracing::error!(%reason, ?exit_code, "Engine session crashed");

        self.hub.set_state(SessionState::Crashed);
        self.hub.publish(EngineEvent::EngineExit { code: exit_code });
        self.fail_outstanding(BridgeError::EngineCrashed);
        StopOutcome::forced(exit_code)
    }

    async fn shutdown(mut self, grace: Duration) -> StopOutcome {
        let searching = self.table.has_search();
        self.fail_outstanding(BridgeError::SessionDead);

        if searching && let Err(EngineLost(reason)) = self.write_internal(Verb::Stop).await {
            tracing::debug!(%reason, "Could not send stop");
        }
        if let Err(EngineLost(reason)) = self.write_internal(Verb::Quit).await {
            tracing::debug!(%reason, "Could not send quit");
        }

        // Keep draining output so the engine never blocks on a full pipe while exiting.
        let process = &mut self.process;
        let inbound = &mut self.inbound;
        let exited = timeout(grace, async move {
            loop {
                tokio::select! {
                    code = process.wait() => return code,
                    msg = inbound.recv() => {
                        if msg.is_none() {
                            return process.wait().await;
                        }
                    }
                }
            }
        })
        .await;
        self.reader_task.abort();

        match exited {
            Ok(exit_code) => {
                tracing::info!(?exit_code, "Engine exited");
                StopOutcome {
                    graceful: true,
                    exit_code,
                }
            }
            Err(_) => {
                tracing::warn!(?grace, "Engine ignored quit; sending SIGTERM");
                self.process.terminate();
                match timeout(TERM_WAIT, self.process.wait()).await {
                    Ok(exit_code) => StopOutcome::forced(exit_code),
                    Err(_) => {
                        tracing::warn!("Engine ignored SIGTERM; killing");
                        StopOutcome::forced(self.process.kill().await)
                    }
                }
            }
        }
    }
}

fn complete(entry: PendingRequest, event: ResponseEvent) {
    match entry.completion {
        Some(Completion::Caller(tx)) => {
            tracing::debug!(command_id = entry.command_id, event = event.tag(), "Command completed");
            if let Some(reply) = Reply::from_terminal(event) {
                let _ = tx.send(Ok(reply));
            }
        }
        Some(Completion::Probe) => tracing::debug!("Engine answered liveness probe"),
        None => tracing::debug!(
            command_id = entry.command_id,
            event = event.tag(),
            "Discarding late reply to abandoned command"
        ),
    }
}
