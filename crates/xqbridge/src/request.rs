//! Caller-side handle for a submitted command.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::protocol::{CommandId, ResponseEvent};
use crate::error::{BridgeError, Result};
use crate::pump::PumpMsg;

/// Typed reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Ready,
    UciOk,
    BestMove {
        mv: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        ponder: Option<String>,
    },
    /// The command was written and expects no reply.
    Sent,
}

impl Reply {
    pub(crate) fn from_terminal(event: ResponseEvent) -> Option<Self> {
        match event {
            ResponseEvent::Ready => Some(Self::Ready),
            ResponseEvent::UciOk => Some(Self::UciOk),
            ResponseEvent::BestMove { mv, ponder } => Some(Self::BestMove { mv, ponder }),
            _ => None,
        }
    }

    pub fn best_move(&self) -> Option<&str> {
        match self {
            Self::BestMove { mv, .. } => Some(mv),
            _ => None,
        }
    }
}

/// A command in flight. Await it for the reply.
///
/// Dropping an unfinished handle cancels the command, unless [`disarm`]ed.
///
/// [`disarm`]: PendingReply::disarm
#[must_use = "dropping a PendingReply cancels the command"]
pub struct PendingReply {
    command_id: CommandId,
    rx: oneshot::Receiver<Result<Reply>>,
    control: mpsc::UnboundedSender<PumpMsg>,
    /// Settled locally by `cancel()` or a reply found while cancelling.
    settled: Option<Result<Reply>>,
    armed: bool,
}

impl PendingReply {
    pub(crate) fn new(
        command_id: CommandId,
        rx: oneshot::Receiver<Result<Reply>>,
        control: mpsc::UnboundedSender<PumpMsg>,
    ) -> Self {
        Self {
            command_id,
            rx,
            control,
            settled: None,
            armed: true,
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.command_id
    }

    /// Cancel the command. Never blocks; the handle then resolves to
    /// [`BridgeError::Cancelled`] unless the reply had already arrived.
    pub fn cancel(&mut self) {
        if !self.armed {
            return;
        }
        self.armed = false;
        match self.rx.try_recv() {
            Ok(result) => self.settled = Some(result),
            Err(oneshot::error::TryRecvError::Empty) => {
                tracing::debug!(command_id = self.command_id, "Cancelling command");
                let _ = self.control.send(PumpMsg::Cancel(self.command_id));
                self.settled = Some(Err(BridgeError::Cancelled {
                    command_id: self.command_id,
                }));
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.settled = Some(Err(BridgeError::SessionDead));
            }
        }
    }

    /// Keep the command running even if this handle is dropped.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Future for PendingReply {
    type Output = Result<Reply>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.settled.take() {
            return Poll::Ready(result);
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(result) => {
                self.armed = false;
                Poll::Ready(result.unwrap_or(Err(BridgeError::SessionDead)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.control.send(PumpMsg::Cancel(self.command_id));
        }
    }
}
