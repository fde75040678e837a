//! Relay core library: MQTT prompt intake, script generation over HTTP,
//! local script execution, and the process lifecycle tying them together.

pub mod channels;
pub mod config;
pub mod exec;
pub mod lifecycle;
pub mod llm;
pub mod pipeline;
