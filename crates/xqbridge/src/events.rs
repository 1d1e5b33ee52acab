//! Progress and lifecycle events published to subscribers.
//!
//! Delivery goes through a bounded broadcast buffer so a slow subscriber never
//! stalls the pump. A subscriber that falls behind loses the oldest events and
//! is told how many it missed. Replies to commands never travel this way.

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::bridge::protocol::InfoEvent;
use crate::session::SessionState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Search progress.
    Info(InfoEvent),
    /// Engine error text that could not be tied to a command.
    EngineError { message: String },
    /// The engine went away without being asked to.
    EngineExit { code: Option<i32> },
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
}

/// Consumer of [`EngineEvent`]s, driven from its own task.
pub trait EventSink: Send + 'static {
    fn on_event(&mut self, event: EngineEvent);

    /// Called when `missed` events were dropped because this sink fell behind.
    fn on_lagged(&mut self, missed: u64) {
        let _ = missed;
    }
}

impl<F> EventSink for F
where
    F: FnMut(EngineEvent) + Send + 'static,
{
    fn on_event(&mut self, event: EngineEvent) {
        self(event)
    }
}

/// Live subscription; delivery stops when this is dropped.
#[must_use = "dropping a Subscription stops event delivery"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Shared fan-out point for events and lifecycle state.
pub(crate) struct EventHub {
    events: broadcast::Sender<EngineEvent>,
    state: watch::Sender<SessionState>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (state, _) = watch::channel(SessionState::Idle);
        Self { events, state }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Err only means nobody is listening.
        let _ = self.events.send(event);
    }

    pub fn receiver(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn set_state(&self, to: SessionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::info!(?from, ?to, "Session state changed");
            self.publish(EngineEvent::StateChanged { from, to });
        }
    }

    pub fn subscribe(&self, mut sink: impl EventSink) -> Subscription {
        let mut rx = self.receiver();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event subscriber lagging; oldest events dropped");
                        sink.on_lagged(missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Event subscription ended");
        });
        Subscription { task }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn info(depth: u32) -> EngineEvent {
        EngineEvent::Info(InfoEvent {
            depth: Some(depth),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn closure_sink_receives_events_in_order() {
        let hub = EventHub::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let _sub = hub.subscribe(move |event: EngineEvent| sink_seen.lock().unwrap().push(event));

        hub.publish(info(1));
        hub.publish(info(2));
        hub.set_state(SessionState::Starting);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while seen.lock().unwrap().len() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], info(1));
        assert_eq!(seen[1], info(2));
        assert_eq!(
            seen[2],
            EngineEvent::StateChanged {
                from: SessionState::Idle,
                to: SessionState::Starting
            }
        );
    }

    #[tokio::test]
    async fn lagging_receiver_loses_oldest() {
        let hub = EventHub::new(2);
        let mut rx = hub.receiver();
        for depth in 1..=5 {
            hub.publish(info(depth));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap(), info(4));
        assert_eq!(rx.recv().await.unwrap(), info(5));
    }

    #[test]
    fn same_state_is_not_republished() {
        let hub = EventHub::new(4);
        let mut rx = hub.receiver();
        hub.set_state(SessionState::Idle);
        assert!(rx.try_recv().is_err());
        hub.set_state(SessionState::Running);
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::StateChanged { to: SessionState::Running, .. })
        ));
        assert_eq!(hub.state(), SessionState::Running);
    }

    #[test]
    fn events_serialize_tagged() {
        insta::assert_json_snapshot!(
            [
                EngineEvent::EngineExit { code: None },
                EngineEvent::StateChanged {
                    from: SessionState::Running,
                    to: SessionState::Crashed
                },
            ],
            @r#"
        [
          {
            "type": "engine_exit",
            "code": null
          },
          {
            "type": "state_changed",
            "from": "RUNNING",
            "to": "CRASHED"
          }
        ]
        "#
        );
    }
}
