//! [`BusAdapter`] – the seam between arm-level code and the transport.
//!
//! Higher layers never touch [`EventBus`] receivers directly.  They publish
//! payloads by topic and register one handler per inbound topic; the adapter
//! owns the delivery tasks that pump messages from the bus into those
//! handlers.
//!
//! # Delivery model
//!
//! * One Tokio task per subscribed topic, so handlers for different topics
//!   run concurrently with each other and with the caller.
//! * A handler is invoked once per inbound message, in publish order for its
//!   topic.  Handlers must not block; they are expected to forward the
//!   payload somewhere (typically an event latch) and return.
//! * Dropping the adapter aborts every delivery task it spawned.

use std::sync::Arc;

use dvrk_types::{ArmError, BusMessage, Payload};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::EventBus;

/// Publishes on behalf of one component and routes inbound topics to
/// handlers.
pub struct BusAdapter {
    bus: Arc<EventBus>,
    source: String,
    deliveries: Vec<JoinHandle<()>>,
}

impl BusAdapter {
    /// Create an adapter that stamps outbound messages with `source`.
    pub fn new(bus: Arc<EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
            deliveries: Vec::new(),
        }
    }

    /// Fire-and-forget publish.  Returns the number of subscribers reached.
    pub fn publish(&self, topic: &str, payload: Payload) -> Result<usize, ArmError> {
        debug!(topic, kind = payload.kind(), "publish");
        self.bus
            .publish(BusMessage::new(topic, self.source.clone(), payload))
    }

    /// Publish and latch, so subscribers that join later still see the most
    /// recent command.
    pub fn publish_latched(&self, topic: &str, payload: Payload) -> Result<usize, ArmError> {
        debug!(topic, kind = payload.kind(), "publish latched");
        self.bus
            .publish_latched(BusMessage::new(topic, self.source.clone(), payload))
    }

    /// Route every message arriving on `topic` to `handler`.
    ///
    /// The subscription is registered before this returns, so nothing
    /// published afterwards is missed.
    ///
    /// # Errors
    ///
    /// [`ArmError::Channel`] when called outside a Tokio runtime.
    pub fn subscribe<F>(&mut self, topic: &str, mut handler: F) -> Result<(), ArmError>
    where
        F: FnMut(Payload) + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| {
            ArmError::Channel(format!("cannot subscribe to {topic} outside a Tokio runtime: {e}"))
        })?;
        let mut receiver = self.bus.subscribe(topic);
        let delivery = runtime.spawn(async move {
            while let Some(message) = receiver.recv().await {
                debug!(topic = %message.topic, source = %message.source, "deliver");
                handler(message.payload);
            }
            debug!(topic = %receiver.topic(), "delivery ended: bus closed");
        });
        self.deliveries.push(delivery);
        Ok(())
    }

    /// Number of topics this adapter is subscribed to.
    pub fn subscription_count(&self) -> usize {
        self.deliveries.len()
    }
}

impl Drop for BusAdapter {
    fn drop(&mut self) {
        for delivery in self.deliveries.drain(..) {
            delivery.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn handler_receives_payloads_in_order() {
        let bus = Arc::new(EventBus::default());
        let mut adapter = BusAdapter::new(Arc::clone(&bus), "test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter
            .subscribe("/dvrk/ECM/robot_state", move |payload| {
                let _ = tx.send(payload);
            })
            .unwrap();

        let publisher = BusAdapter::new(Arc::clone(&bus), "sim");
        publisher
            .publish("/dvrk/ECM/robot_state", Payload::Text("DVRK_HOMING_POWERING".into()))
            .unwrap();
        publisher
            .publish("/dvrk/ECM/robot_state", Payload::Text("DVRK_READY".into()))
            .unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Payload::Text("DVRK_HOMING_POWERING".into()))
        );
        assert_eq!(rx.recv().await, Some(Payload::Text("DVRK_READY".into())));
        assert_eq!(adapter.subscription_count(), 1);
    }

    #[tokio::test]
    async fn outbound_messages_carry_the_source() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe("/dvrk/ECM/set_robot_state");
        let adapter = BusAdapter::new(Arc::clone(&bus), "dvrk-kernel::session");

        let reached = adapter
            .publish_latched("/dvrk/ECM/set_robot_state", Payload::Text("Home".into()))
            .unwrap();
        assert_eq!(reached, 1);

        let message = rx.recv().await.unwrap();
        assert_eq!(message.source, "dvrk-kernel::session");
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let bus = Arc::new(EventBus::default());
        let mut adapter = BusAdapter::new(bus, "test");
        let result = adapter.subscribe("/dvrk/ECM/robot_state", |_| {});
        assert!(matches!(result, Err(ArmError::Channel(_))));
        assert_eq!(adapter.subscription_count(), 0);
    }

    #[tokio::test]
    async fn dropping_adapter_stops_delivery() {
        let bus = Arc::new(EventBus::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut adapter = BusAdapter::new(Arc::clone(&bus), "test");
            adapter
                .subscribe("/dvrk/ECM/goal_reached", move |payload| {
                    let _ = tx.send(payload);
                })
                .unwrap();
        }
        tokio::task::yield_now().await;

        let _ = bus.publish(BusMessage::new(
            "/dvrk/ECM/goal_reached",
            "sim",
            Payload::Flag(true),
        ));
        let result = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        // Either nothing arrives or the sender was dropped with the task.
        assert!(!matches!(result, Ok(Some(_))));
    }
}
