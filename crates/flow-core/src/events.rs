//! Typed event bus for session changes
//!
//! A [`FlowSession`](crate::session::FlowSession) publishes a closed set of
//! [`FlowEvent`]s: rebuilds, variable table changes, execution updates, canvas
//! lock transitions, version swaps and warnings. Consumers attach an
//! [`EventSink`] and receive a [`Subscription`] guard; dropping the guard
//! detaches the sink.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::execution::ExecutionStatus;
use crate::overlay::{CanvasState, NodeExecutionState};
use crate::types::NodeId;

/// Trait for receiving session events
///
/// This abstracts over the transport (channel, UI bridge, test buffer).
pub trait EventSink: Send + Sync {
    /// Deliver an event
    ///
    /// Returns an error if the event could not be delivered (e.g. channel
    /// closed); the bus then drops the sink.
    fn send(&self, event: FlowEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    /// The receiving side of a channel sink is gone
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// A node whose execution state changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStateChange {
    pub node_id: NodeId,
    pub state: NodeExecutionState,
}

/// Events published by a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FlowEvent {
    /// Nodes and edges were re-derived from the task list
    #[serde(rename_all = "camelCase")]
    GraphRebuilt { node_count: usize, edge_count: usize },

    /// The canonical task list changed
    #[serde(rename_all = "camelCase")]
    TasksChanged { task_count: usize },

    /// A task was patched without rebuilding; a flush is outstanding
    #[serde(rename_all = "camelCase")]
    RebuildPending { node_id: NodeId },

    /// The variable table was regenerated
    #[serde(rename_all = "camelCase")]
    VariablesChanged { variable_count: usize },

    /// A poll changed node states
    #[serde(rename_all = "camelCase")]
    ExecutionUpdated {
        instance_id: String,
        status: Option<ExecutionStatus>,
        changed: Vec<NodeStateChange>,
    },

    /// The canvas lock moved
    #[serde(rename_all = "camelCase")]
    CanvasStateChanged { from: CanvasState, to: CanvasState },

    /// The canvas is hidden during a version swap and revealed afterwards
    #[serde(rename_all = "camelCase")]
    CanvasVisibility { visible: bool },

    /// A workflow version was loaded
    #[serde(rename_all = "camelCase")]
    VersionChanged {
        workflow_id: String,
        from: Option<u32>,
        to: u32,
        read_only: bool,
    },

    /// Something the user should be told about, e.g. a rejected edit
    #[serde(rename_all = "camelCase")]
    Warning { message: String },

    /// Polling gave up after bounded retries
    #[serde(rename_all = "camelCase")]
    PollFailed {
        instance_id: String,
        attempts: u32,
        message: String,
    },
}

impl FlowEvent {
    /// Warning event carrying `message`
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
#[derive(Default)]
pub struct VecEventSink {
    events: Mutex<Vec<FlowEvent>>,
}

impl VecEventSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<FlowEvent> {
        self.events.lock().clone()
    }

    /// Take all collected events, leaving the sink empty
    pub fn drain(&self) -> Vec<FlowEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: FlowEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// A sink that forwards events to an unbounded channel
///
/// Event volume is low (a handful per edit or poll), so an unbounded channel
/// never blocks the session on a slow consumer.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelEventSink {
    /// Sink forwarding into `sender`
    pub fn new(sender: mpsc::UnboundedSender<FlowEvent>) -> Self {
        Self { sender }
    }
}

impl EventSink for ChannelEventSink {
    fn send(&self, event: FlowEvent) -> Result<(), EventError> {
        self.sender
            .send(event)
            .map_err(|_| EventError::channel_closed())
    }
}

type Subscribers = Vec<(Uuid, Arc<dyn EventSink>)>;

/// Fan-out of [`FlowEvent`]s to subscribed sinks
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    /// Bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink until the returned guard is dropped
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        let id = Uuid::new_v4();
        self.subscribers.lock().push((id, sink));
        Subscription {
            id,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    /// Attach a channel and return its receiving end
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<FlowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(ChannelEventSink::new(sender)));
        (subscription, receiver)
    }

    /// Deliver an event to every subscriber
    ///
    /// Sinks are called outside the lock so a sink may subscribe or
    /// unsubscribe while handling an event.
    pub fn publish(&self, event: FlowEvent) {
        let subscribers: Subscribers = self.subscribers.lock().clone();
        let mut closed = Vec::new();
        for (id, sink) in &subscribers {
            if let Err(e) = sink.send(event.clone()) {
                log::debug!("Dropping subscriber {}: {}", id, e);
                closed.push(*id);
            }
        }
        if !closed.is_empty() {
            self.subscribers
                .lock()
                .retain(|(id, _)| !closed.contains(id));
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Guard for an attached sink; detaches it on drop
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: Uuid,
    subscribers: Weak<Mutex<Subscribers>>,
}

impl Subscription {
    /// Id the bus knows this subscription by
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Detach now; equivalent to dropping the guard
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_event_sink() {
        let bus = EventBus::new();
        let sink = Arc::new(VecEventSink::new());
        let _subscription = bus.subscribe(sink.clone());

        bus.publish(FlowEvent::GraphRebuilt {
            node_count: 4,
            edge_count: 3,
        });

        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FlowEvent::GraphRebuilt { node_count, .. } => assert_eq!(*node_count, 4),
            _ => panic!("Expected GraphRebuilt event"),
        }
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let sink = Arc::new(VecEventSink::new());
        let subscription = bus.subscribe(sink.clone());
        assert_eq!(bus.subscriber_count(), 1);

        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(FlowEvent::warning("ignored"));
        assert!(sink.events().is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let bus = EventBus::new();
        let subscription = bus.subscribe(Arc::new(VecEventSink::new()));
        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::new();
        let (_subscription, mut receiver) = bus.subscribe_channel();

        bus.publish(FlowEvent::CanvasVisibility { visible: false });
        assert_eq!(
            receiver.recv().await,
            Some(FlowEvent::CanvasVisibility { visible: false })
        );
    }

    #[test]
    fn test_closed_channel_is_dropped() {
        let bus = EventBus::new();
        let (_subscription, receiver) = bus.subscribe_channel();
        drop(receiver);

        bus.publish(FlowEvent::warning("nobody listening"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(FlowEvent::CanvasStateChanged {
            from: CanvasState::Edit,
            to: CanvasState::WaitToRunning,
        })
        .unwrap();
        assert_eq!(json["type"], "canvasStateChanged");
        assert_eq!(json["to"], "WAIT_TO_RUNNING");
    }
}
