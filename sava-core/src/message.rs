use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

/// Opaque identifier issued by the message store when a message is stored.
/// All components refer to stored messages through handles; the payload is
/// only reachable via the store or a shared `Arc<Message>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle(pub u64);

impl Display for MessageHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "msg-{}", self.0)
    }
}

/// An immutable message: payload plus headers, owned by the store.
/// Never mutated after creation; shared freely across queues and in-flight
/// deliveries. Per-queue delivery state lives on the message instance, not
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    // The actual payload of the message
    pub payload: Vec<u8>,
    // User-defined properties/attributes
    pub headers: HashMap<String, String>,
    // Identifies the producer's name
    pub producer_name: String,
    // Timestamp for when the message was published (ms since epoch)
    pub publish_time: u64,
    // Delivery priority, only consulted by priority-ordered queues
    pub priority: u8,
    // Optional time-to-live; expired instances are swept by the queue engine
    pub ttl: Option<Duration>,
}

impl Message {
    pub fn size(&self) -> usize {
        self.payload.len()
    }
}
