//! Headless, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message on its topic without any single
//! subscriber blocking the publisher or the others.
//!
//! # Topics
//!
//! Topics are plain strings (`/dvrk/ECM/robot_state`, …).  A channel is
//! created lazily the first time a topic is published to or subscribed to,
//! so publishers and subscribers may come up in any order.
//!
//! | Call | Delivery |
//! |---|---|
//! | [`EventBus::publish`] | every current subscriber of the topic |
//! | [`EventBus::publish_latched`] | every current subscriber, and replayed to later ones |
//!
//! Publishing to a topic nobody listens to is a normal condition and returns
//! `Ok(0)`: the bus gives no delivery guarantee beyond "delivered to whoever
//! is subscribed right now".

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dvrk_types::{ArmError, BusMessage};
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default per-topic channel capacity (messages buffered before a slow
/// subscriber starts lagging).
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug)]
struct TopicChannel {
    sender: broadcast::Sender<BusMessage>,
    /// Last latched message, replayed to new subscribers.
    latched: Option<BusMessage>,
}

impl TopicChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            latched: None,
        }
    }

    fn send(&self, message: BusMessage) -> usize {
        let topic = message.topic.clone();
        match self.sender.send(message) {
            Ok(n) => n,
            Err(broadcast::error::SendError(_)) => {
                trace!(topic = %topic, "no subscribers; message dropped");
                0
            }
        }
    }
}

/// Shared event bus. Wrap it in an `Arc` to hand it to publishers and
/// subscribers; all handles see the same topic channels.
#[derive(Debug)]
pub struct EventBus {
    capacity: usize,
    topics: Mutex<HashMap<String, TopicChannel>>,
}

impl EventBus {
    /// Create a new bus.  `capacity` applies to every topic channel
    /// independently and is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Publish `message` on `message.topic`.
    ///
    /// Returns the number of subscribers that were handed the message.
    ///
    /// # Errors
    ///
    /// [`ArmError::Channel`] if the topic name is not absolute.
    pub fn publish(&self, message: BusMessage) -> Result<usize, ArmError> {
        validate_topic(&message.topic)?;
        let mut topics = self.lock();
        let channel = topics
            .entry(message.topic.clone())
            .or_insert_with(|| TopicChannel::new(self.capacity));
        Ok(channel.send(message))
    }

    /// Publish `message` and retain it as the topic's latched value.
    ///
    /// Subscribers that join later receive the latched message first.  A
    /// newer latched publish replaces the older one.
    pub fn publish_latched(&self, message: BusMessage) -> Result<usize, ArmError> {
        validate_topic(&message.topic)?;
        let mut topics = self.lock();
        let channel = topics
            .entry(message.topic.clone())
            .or_insert_with(|| TopicChannel::new(self.capacity));
        channel.latched = Some(message.clone());
        Ok(channel.send(message))
    }

    /// Subscribe to `topic`.
    ///
    /// The subscription is live as soon as this returns: every message
    /// published afterwards is delivered to the returned receiver.
    pub fn subscribe(&self, topic: &str) -> TopicReceiver {
        let mut topics = self.lock();
        let channel = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicChannel::new(self.capacity));
        TopicReceiver {
            topic: topic.to_string(),
            pending: channel.latched.clone(),
            receiver: channel.sender.subscribe(),
        }
    }

    /// Number of live subscribers on `topic` (0 for unknown topics).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .get(topic)
            .map(|c| c.sender.receiver_count())
            .unwrap_or(0)
    }

    /// All topics that have been published to or subscribed to, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TopicChannel>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

fn validate_topic(topic: &str) -> Result<(), ArmError> {
    if topic.len() < 2 || !topic.starts_with('/') {
        return Err(ArmError::Channel(format!(
            "invalid topic name {topic:?}: expected an absolute name such as /dvrk/ECM/robot_state"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

/// An async receiver bound to a single topic.
///
/// Obtained via [`EventBus::subscribe`].
pub struct TopicReceiver {
    topic: String,
    pending: Option<BusMessage>,
    receiver: broadcast::Receiver<BusMessage>,
}

impl TopicReceiver {
    /// Wait for the next message on this topic.
    ///
    /// A latched message present at subscription time is yielded first.  When
    /// the receiver lags behind the publisher the dropped messages are logged
    /// and skipped.  Returns `None` once the bus has been dropped.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "topic receiver lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Return the next already-delivered message without waiting.
    pub fn try_recv(&mut self) -> Option<BusMessage> {
        if let Some(message) = self.pending.take() {
            return Some(message);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = %self.topic, lagged_by = n, "topic receiver lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// The topic this receiver is bound to.
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvrk_types::Payload;
    use std::time::Duration;

    fn message(topic: &str, token: &str) -> BusMessage {
        BusMessage::new(topic, "dvrk-middleware::test", Payload::Text(token.to_string()))
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("/dvrk/ECM/robot_state");

        let sent = message("/dvrk/ECM/robot_state", "DVRK_READY");
        assert_eq!(bus.publish(sent.clone()).unwrap(), 1);

        let received = rx.recv().await.expect("message must arrive");
        assert_eq!(received.id, sent.id);
        assert_eq!(received.payload, Payload::Text("DVRK_READY".into()));
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        let delivered = bus.publish(message("/dvrk/ECM/set_robot_state", "Home"));
        assert_eq!(delivered, Ok(0));
    }

    #[test]
    fn relative_topic_names_are_rejected() {
        let bus = EventBus::default();
        assert!(matches!(
            bus.publish(message("robot_state", "x")),
            Err(ArmError::Channel(_))
        ));
        assert!(bus.publish_latched(message("/", "x")).is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_message() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe("/a/b");
        let mut rx2 = bus.subscribe("/a/b");
        assert_eq!(bus.subscriber_count("/a/b"), 2);

        let sent = message("/a/b", "x");
        bus.publish(sent.clone()).unwrap();

        assert_eq!(rx1.recv().await.unwrap().id, sent.id);
        assert_eq!(rx2.recv().await.unwrap().id, sent.id);
    }

    #[tokio::test]
    async fn subscriber_does_not_receive_other_topics() {
        let bus = EventBus::default();
        let mut goal_rx = bus.subscribe("/dvrk/ECM/goal_reached");
        let _state_rx = bus.subscribe("/dvrk/ECM/robot_state");

        bus.publish(message("/dvrk/ECM/robot_state", "DVRK_READY"))
            .unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), goal_rx.recv()).await;
        assert!(result.is_err(), "goal_reached must not see robot_state traffic");
    }

    #[tokio::test]
    async fn latched_message_is_replayed_to_late_subscribers() {
        let bus = EventBus::default();
        bus.publish_latched(message("/dvrk/ECM/set_robot_state", "Home"))
            .unwrap();
        bus.publish_latched(message("/dvrk/ECM/set_robot_state", "DVRK_POSITION_JOINT"))
            .unwrap();

        let mut late = bus.subscribe("/dvrk/ECM/set_robot_state");
        let replayed = late.recv().await.unwrap();
        assert_eq!(replayed.payload, Payload::Text("DVRK_POSITION_JOINT".into()));
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn plain_publish_is_not_replayed() {
        let bus = EventBus::default();
        bus.publish(message("/x/y", "gone")).unwrap();
        let mut late = bus.subscribe("/x/y");
        assert!(late.try_recv().is_none());
    }

    #[tokio::test]
    async fn lagging_receiver_skips_to_retained_messages() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe("/flood");
        for i in 0..20 {
            bus.publish(message("/flood", &i.to_string())).unwrap();
        }
        // The four most recent messages are still buffered.
        let first = slow.recv().await.unwrap();
        assert_eq!(first.payload, Payload::Text("16".into()));
    }

    #[tokio::test]
    async fn receiver_ends_when_bus_is_dropped() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe("/gone");
        drop(bus);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn topics_are_listed_sorted() {
        let bus = EventBus::default();
        let _b = bus.subscribe("/b");
        bus.publish(message("/a", "x")).unwrap();
        assert_eq!(bus.topics(), vec!["/a".to_string(), "/b".to_string()]);
        assert_eq!(bus.subscriber_count("/a"), 0);
        assert_eq!(bus.subscriber_count("/unknown"), 0);
    }
}
