//! Event bus for pub/sub messaging
//!
//! Carries container and build state transitions from the container
//! controller and the scheduler to their consumers. Builds observe their
//! containers, groups observe their builds and the orchestrator observes
//! groups; all of it flows through this one broadcast channel, so handlers
//! never re-enter the state mutation that produced an event.

use tokio::sync::broadcast;

use crate::build::BuildInfo;
use crate::docker::ContainerState;

/// Events that can be published through the event bus
#[derive(Debug, Clone)]
pub enum Event {
    /// A container transitioned state
    Container {
        /// Container id
        id: String,
        /// New state
        state: ContainerState,
        /// Exit code, present from Exited onwards
        exit_code: Option<i32>,
    },

    /// A build started running
    BuildBegun(BuildInfo),

    /// A build ended
    BuildEnded(BuildInfo),

    /// The first build of a group started running; fired at most once per group
    GroupFirstBuildBegun(BuildInfo),

    /// The last build of a group ended; fired at most once per group
    GroupLastBuildEnded(BuildInfo),
}

/// Event bus for broadcasting events to multiple subscribers
///
/// Uses tokio broadcast channels for efficient pub/sub messaging.
/// Subscribers that fall behind will lose messages (lagged).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with default capacity (4096 events)
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    /// Create a new event bus with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event bus
    ///
    /// Returns a receiver that will receive all events published after
    /// subscribing. If the subscriber falls behind, it will receive a
    /// `RecvError::Lagged` error.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    ///
    /// If there are no subscribers, the event is silently dropped.
    /// Returns the number of receivers that received the event.
    pub fn publish(&self, event: Event) -> usize {
        // Ignore send errors (no receivers)
        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new();

        let mut rx = bus.subscribe();

        bus.publish(Event::Container {
            id: "abcd".into(),
            state: ContainerState::Exited,
            exit_code: Some(0),
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::Container {
                state: ContainerState::Exited,
                exit_code: Some(0),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();

        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::Container {
            id: "abcd".into(),
            state: ContainerState::Removed,
            exit_code: Some(137),
        });

        for rx in [&mut rx1, &mut rx2] {
            let event = rx.recv().await.unwrap();
            assert!(matches!(event, Event::Container { .. }));
        }
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();

        assert_eq!(bus.subscriber_count(), 0);

        let _rx1 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let _rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
    }
}
