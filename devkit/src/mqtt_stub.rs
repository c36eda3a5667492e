//! Recording stand-in for the MQTT transport.
//!
//! Implements `TelemetryLink`, so an uplink session built on the stub
//! behaves like one on a real broker connection, minus the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use gridsim_core::link::{LinkError, TelemetryLink};

#[derive(Debug, Clone, PartialEq)]
pub struct StubMessage {
    pub topic: String,
    pub payload: String,
}

#[derive(Clone, Default)]
pub struct MqttStub {
    published: Arc<Mutex<Vec<StubMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    fail_publishes: Arc<AtomicBool>,
}

impl MqttStub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail, to exercise soft-failure paths.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<StubMessage> {
        self.published.lock().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().clone()
    }

    /// Payloads published on one topic, in order.
    pub fn messages_on(&self, topic: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    pub fn last_on(&self, topic: &str) -> Option<String> {
        self.messages_on(topic).pop()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.subscriptions.lock().clear();
    }
}

#[async_trait]
impl TelemetryLink for MqttStub {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(LinkError::Publish("stubbed publish failure".to_string()));
        }
        self.published.lock().push(StubMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.subscriptions.lock().push(topic.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_in_order() {
        let stub = MqttStub::new();
        stub.publish("s/us", "200,c8y_Voltage,230,V,t0").await.unwrap();
        stub.publish("s/us", "200,c8y_Current,10,A,t0").await.unwrap();
        stub.publish("s/ds", "ignored").await.unwrap();

        let rows = stub.messages_on("s/us");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].starts_with("200,c8y_Voltage"));
        assert_eq!(stub.last_on("s/us").unwrap(), "200,c8y_Current,10,A,t0");
    }

    #[tokio::test]
    async fn failing_mode_rejects_publishes() {
        let stub = MqttStub::new();
        stub.set_fail_publishes(true);
        assert!(stub.publish("s/us", "row").await.is_err());
        assert!(stub.published().is_empty());

        stub.set_fail_publishes(false);
        assert!(stub.publish("s/us", "row").await.is_ok());
    }

    #[tokio::test]
    async fn tracks_subscriptions() {
        let stub = MqttStub::new();
        stub.subscribe("s/ds").await.unwrap();
        assert_eq!(stub.subscriptions(), vec!["s/ds".to_string()]);
    }
}
