/*!
GridSim DevKit - stubs and fixtures for broker-free development

Lets the uplink session and the supervisor be exercised without a live MQTT
broker or a populated data directory:
- `MqttStub` records every publish/subscribe for assertions
- `TestDataDir` scaffolds a temp data directory with stores and settings
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MqttStub, StubMessage};
pub use test_utils::TestDataDir;
