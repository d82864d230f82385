//! Message bus for plan lifecycle events
//!
//! The dispatcher publishes an event at each plan and step transition.
//! Subscribers (the CLI progress output, tests) receive them over bounded
//! channels. Publishing never waits: when a subscriber's channel is full the
//! event is dropped for that subscriber, so a slow reader cannot stall a plan.

use crate::conductor::types::{PlanState, StepStatus};
use sdk::types::Capability;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event types that can be subscribed to
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventType {
    PlanStarted,
    StepStarted,
    StepFinished,
    StepSkipped,
    PlanFinished,
    /// Subscribe to all event types
    All,
}

/// Events published on the message bus
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PlanStarted {
        plan_id: String,
        steps: usize,
    },
    StepStarted {
        plan_id: String,
        step_id: String,
        capability: Capability,
        tool: String,
        confidence: f64,
    },
    /// A step that ran reached Succeeded or Failed
    StepFinished {
        plan_id: String,
        step_id: String,
        status: StepStatus,
        findings: usize,
        duration_ms: u64,
    },
    StepSkipped {
        plan_id: String,
        step_id: String,
        reason: String,
    },
    PlanFinished {
        plan_id: String,
        state: PlanState,
    },
}

impl Event {
    /// Get the event type for this event
    pub fn event_type(&self) -> EventType {
        match self {
            Event::PlanStarted { .. } => EventType::PlanStarted,
            Event::StepStarted { .. } => EventType::StepStarted,
            Event::StepFinished { .. } => EventType::StepFinished,
            Event::StepSkipped { .. } => EventType::StepSkipped,
            Event::PlanFinished { .. } => EventType::PlanFinished,
        }
    }

    pub fn plan_id(&self) -> &str {
        match self {
            Event::PlanStarted { plan_id, .. }
            | Event::StepStarted { plan_id, .. }
            | Event::StepFinished { plan_id, .. }
            | Event::StepSkipped { plan_id, .. }
            | Event::PlanFinished { plan_id, .. } => plan_id,
        }
    }
}

/// Message bus for pub/sub communication between components
///
/// Cloning is cheap; every clone publishes to the same subscribers.
#[derive(Clone, Default)]
pub struct MessageBus {
    channels: Arc<Mutex<HashMap<EventType, Vec<mpsc::Sender<Event>>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a specific event type, or [`EventType::All`].
    ///
    /// The channel holds at most `CHANNEL_BUFFER_SIZE` undelivered events.
    pub async fn subscribe(&self, event_type: EventType) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(event_type).or_default().push(tx);
        rx
    }

    /// Publish an event to its type's subscribers and to `All` subscribers.
    ///
    /// Closed subscribers are pruned. Full subscribers miss the event.
    pub async fn publish(&self, event: Event) {
        let mut channels = self.channels.lock().await;
        let event_type = event.event_type();

        for key in [event_type, EventType::All] {
            if let Some(subscribers) = channels.get_mut(&key) {
                subscribers.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        trace!(?event_type, "Subscriber channel full, event dropped");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.channels.lock().await.values().map(Vec::len).sum()
    }
}
