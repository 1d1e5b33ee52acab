//! Table of dispatched commands waiting for their terminal event.
//!
//! Entries are kept in dispatch order. A terminal event completes the oldest
//! entry whose class it answers. An entry whose caller has gone (timed out or
//! cancelled) stays in the table as *discarded* until the engine's late reply
//! arrives, so that reply cannot be mistaken for the next command's. A
//! discarded entry carries a drain deadline; past it the engine is lost.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::bridge::protocol::{CommandClass, CommandId, ResponseEvent};
use crate::error::Result;
use crate::request::Reply;

pub(crate) type ReplySender = oneshot::Sender<Result<Reply>>;

/// Who is waiting on an entry.
pub(crate) enum Completion {
    Caller(ReplySender),
    /// Internal `isready` liveness probe.
    Probe,
}

pub(crate) struct PendingRequest {
    pub command_id: CommandId,
    pub class: CommandClass,
    /// The encoded line, used to attribute engine error messages.
    pub line: String,
    pub deadline: Option<Instant>,
    /// `None` once discarded.
    pub completion: Option<Completion>,
}

impl PendingRequest {
    pub fn new(command_id: CommandId, class: CommandClass, line: String, completion: Completion) -> Self {
        Self {
            command_id,
            class,
            line,
            deadline: None,
            completion: Some(completion),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn is_awaiting(&self) -> bool {
        self.completion.is_some()
    }
}

/// An awaiting entry whose deadline passed. The entry itself stays discarded.
pub(crate) struct Expired {
    pub command_id: CommandId,
    pub class: CommandClass,
    pub completion: Completion,
}

#[derive(Default)]
pub(crate) struct PendingTable {
    entries: VecDeque<PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: PendingRequest) {
        self.entries.push_back(request);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove the oldest entry answered by `event`.
    pub fn take_answered(&mut self, event: &ResponseEvent) -> Option<PendingRequest> {
        let pos = self.entries.iter().position(|e| e.class.is_answered_by(event))?;
        self.entries.remove(pos)
    }

    /// Remove the oldest caller entry whose line `message` quotes.
    pub fn take_quoted_error(&mut self, message: &str) -> Option<PendingRequest> {
        let pos = self.entries.iter().position(|e| {
            matches!(e.completion, Some(Completion::Caller(_))) && message.contains(e.line.as_str())
        })?;
        self.entries.remove(pos)
    }

    /// Detach the caller from `command_id`, leaving the entry discarded.
    ///
    /// The engine still owes the entry its terminal event, and must deliver it
    /// by `drain_by`.
    pub fn discard(&mut self, command_id: CommandId, drain_by: Instant) -> Option<(CommandClass, ReplySender)> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.command_id == command_id && matches!(e.completion, Some(Completion::Caller(_))))?;
        entry.deadline = Some(drain_by);
        match entry.completion.take() {
            Some(Completion::Caller(tx)) => Some((entry.class, tx)),
            _ => None,
        }
    }

    /// Discard every awaiting entry whose deadline is at or before `now`. The
    /// discarded entries must drain by `drain_by`.
    pub fn expire(&mut self, now: Instant, drain_by: Instant) -> Vec<Expired> {
        let mut expired = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.deadline.is_some_and(|d| d <= now)
                && let Some(completion) = entry.completion.take()
            {
                entry.deadline = Some(drain_by);
                expired.push(Expired {
                    command_id: entry.command_id,
                    class: entry.class,
                    completion,
                });
            }
        }
        expired
    }

    /// A discarded entry whose terminal event is overdue.
    pub fn stalled(&self, now: Instant) -> Option<CommandId> {
        self.entries
            .iter()
            .find(|e| !e.is_awaiting() && e.deadline.is_some_and(|d| d <= now))
            .map(|e| e.command_id)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().filter_map(|e| e.deadline).min()
    }

    /// Whether a `go` is still outstanding, answered or not.
    pub fn has_search(&self) -> bool {
        self.entries.iter().any(|e| e.class == CommandClass::Search)
    }

    pub fn has_probe(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(e.completion, Some(Completion::Probe)))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PendingRequest> + '_ {
        self.entries.drain(..)
    }
}
