//! Inbound message from a channel: handed to the dispatcher for pipeline processing.

/// One delivery from the broker. The payload is undecoded; the pipeline parses it.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}
