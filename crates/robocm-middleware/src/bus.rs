//! Topic-based publish/subscribe event bus.
//!
//! Built on [`tokio::sync::broadcast`] so every subscriber sees every event
//! on its topic and a slow subscriber only ever hurts itself (it lags and
//! skips, it never blocks publishers).
//!
//! # Topics
//!
//! | Topic | Traffic |
//! |---|---|
//! | [`Topic::Perception`] | Raw perception notifications from robots and sensors |
//! | [`Topic::SystemAlerts`] | Saturation, capacity and shutdown alerts |
//!
//! Queries do not travel over the bus: they need a reply, see
//! [`crate::query`].

use robocm_types::{CmError, Event, EventPayload};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (events buffered before slow subscribers lag).
pub const DEFAULT_CAPACITY: usize = 256;

/// Routing lanes on the [`EventBus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Generalized-list notifications, one event per observation.
    Perception,
    /// Operational alerts.
    SystemAlerts,
}

/// Shared event bus.  Clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    perception: broadcast::Sender<Event>,
    system_alerts: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus; `capacity` applies to every topic independently.
    pub fn new(capacity: usize) -> Self {
        let (perception, _) = broadcast::channel(capacity);
        let (system_alerts, _) = broadcast::channel(capacity);
        Self {
            perception,
            system_alerts,
        }
    }

    /// Publish `event` on `topic`.
    ///
    /// Returns the number of subscribers handed the event.
    ///
    /// # Errors
    ///
    /// [`CmError::Channel`] when nobody is subscribed to `topic`.
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, CmError> {
        self.topic_sender(topic)
            .send(event)
            .map_err(|_| CmError::Channel(format!("no subscribers for topic {topic:?}")))
    }

    /// Publish a perception notification from `source`.
    pub fn notify(&self, source: impl Into<String>, text: impl Into<String>) -> Result<usize, CmError> {
        self.publish_to(
            Topic::Perception,
            Event::new(source, EventPayload::Notification(text.into())),
        )
    }

    /// Publish a system alert.  Having no listeners is not an error here:
    /// alerts are also logged by whoever raises them.
    pub fn alert(&self, component: &str, code: u32, message: impl Into<String>) -> usize {
        let event = Event::new(
            component,
            EventPayload::SystemAlert {
                component: component.to_string(),
                code,
                message: message.into(),
            },
        );
        self.publish_to(Topic::SystemAlerts, event).unwrap_or(0)
    }

    /// Subscribe to one topic.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    /// Number of live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.topic_sender(topic).receiver_count()
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::Perception => &self.perception,
            Topic::SystemAlerts => &self.system_alerts,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single [`Topic`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event.
    ///
    /// `Err(Lagged(n))` means `n` events were skipped; `Err(Closed)` means
    /// every sender is gone.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Wait for the next event, logging and skipping over lag.
    ///
    /// Returns `None` once the bus is closed.
    pub async fn next(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = ?self.topic, lagged_by = n, "subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn notify_reaches_perception_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut a = bus.subscribe_to(Topic::Perception);
        let mut b = bus.subscribe_to(Topic::Perception);

        assert_eq!(bus.notify("AMR_LIFT1", "(robotDegree \"AMR_LIFT1\" 90)")?, 2);

        for rx in [&mut a, &mut b] {
            let event = rx.recv().await?;
            assert_eq!(event.source, "AMR_LIFT1");
            assert!(matches!(event.payload, EventPayload::Notification(ref t) if t.contains("robotDegree")));
        }
        Ok(())
    }

    #[test]
    fn publish_without_subscribers_is_a_channel_error() {
        let bus = EventBus::default();
        assert!(matches!(bus.notify("x", "(a)"), Err(CmError::Channel(_))));
        // Alerts tolerate an empty audience.
        assert_eq!(bus.alert("test", 1, "nobody listening"), 0);
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        let _perception = bus.subscribe_to(Topic::Perception);

        bus.notify("AMR_LIFT1", "(robotStatus \"AMR_LIFT1\" \"idle\")")?;

        let result = tokio::time::timeout(Duration::from_millis(50), alerts.recv()).await;
        assert!(result.is_err(), "alert subscriber must not see perception events");
        Ok(())
    }

    #[tokio::test]
    async fn alert_carries_code_and_component() {
        let bus = EventBus::default();
        let mut alerts = bus.subscribe_to(Topic::SystemAlerts);
        assert_eq!(bus.alert("pipeline", 502, "capacity"), 1);
        let event = alerts.next().await.unwrap();
        match event.payload {
            EventPayload::SystemAlert { component, code, .. } => {
                assert_eq!(component, "pipeline");
                assert_eq!(code, 502);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(16);
        let mut slow = bus.subscribe_to(Topic::Perception);
        for i in 0..200 {
            let _ = bus.notify("flood", format!("(robotSpeed \"AMR_LIFT1\" {i})"));
        }
        assert!(matches!(
            slow.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        // `next` skips past the lag and resumes with the oldest retained event.
        assert!(slow.next().await.is_some());
    }

    #[tokio::test]
    async fn next_returns_none_when_bus_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_to(Topic::Perception);
        drop(bus);
        assert!(rx.next().await.is_none());
    }
}
