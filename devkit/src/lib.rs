/*!
# Gateway DevKit - stubs and utilities for bridge development

Lets the gateway run without an OPC UA server or an MQTT broker:
- `MockBroker`: in-memory broker channel recording publishes and subscriptions
- `MockEndpoint`: in-memory control endpoint with failure and latency injection
- `TestHarness`: wires both into a `Gateway` and provides wait helpers
*/

pub mod endpoint_stub;
pub mod mqtt_stub;
pub mod test_utils;

pub use endpoint_stub::MockEndpoint;
pub use mqtt_stub::{MockBroker, MockMessage};
pub use test_utils::TestHarness;
