//! Communication channels (MQTT).
//!
//! Channel trait so the lifecycle can connect, subscribe, and tear down a broker connection.
//! Inbound messages are sent to the dispatcher for pipeline processing.

mod handle;
mod inbound;
mod mqtt;

pub use handle::{Channel, ChannelError};
pub use inbound::InboundMessage;
pub use mqtt::MqttChannel;
