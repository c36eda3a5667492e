//! The transport seam between the uplink session and the MQTT client.
//!
//! The production implementation wraps `rumqttc::AsyncClient`; the devkit
//! stub records messages so uplink behavior can be tested without a broker.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("not connected")]
    NotConnected,
}

#[async_trait]
pub trait TelemetryLink: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), LinkError>;
    async fn subscribe(&self, topic: &str) -> Result<(), LinkError>;
}
