//! Message envelopes crossing the driver boundary.
use crate::domino_error;
use crate::error::ErrorKind;
use anyhow::Result;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// Broker assigned name of a queue.
pub type QueueHandle = String;

/// Transport properties the messaging patterns rely on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageProperties {
    /// Identifier echoed in the reply of a request.
    pub correlation_id: Option<String>,
    /// The queue where the reply is expected.
    pub reply_to: Option<QueueHandle>,
}

impl MessageProperties {
    pub fn correlation_id(mut self, value: &str) -> Self {
        self.correlation_id = Some(value.to_string());
        self
    }

    pub fn reply_to(mut self, value: &str) -> Self {
        self.reply_to = Some(value.to_string());
        self
    }
}

/// A message delivered by the driver to a listening queue.
///
/// With the `delivery_tag` the consumer can acknowledge the message.
#[derive(Clone, Default)]
pub struct Delivery {
    /// The queue the message was consumed from.
    pub queue: QueueHandle,
    pub delivery_tag: u64,
    /// Empty for messages sent directly to a queue.
    pub exchange: String,
    /// The topic for broadcasts, the queue name for direct sends.
    pub routing_key: String,
    pub properties: MessageProperties,
    /// JSON encoded payload.
    pub body: Bytes,
}

impl Delivery {
    /// Decode the payload as arbitrary JSON.
    pub fn json(&self) -> Result<Value> {
        self.content()
    }

    /// Decode the payload into `T`.
    pub fn content<T: DeserializeOwned>(&self) -> Result<T> {
        match serde_json::from_slice(&self.body) {
            Ok(value) => Ok(value),
            Err(e) => domino_error!(
                ErrorKind::DecodeFailure,
                format!("Cannot decode message {} from {}: {}", self.delivery_tag, self.queue, e)
            ),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = String::from_utf8_lossy(&self.body[..std::cmp::min(64usize, self.body.len())]);

        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("properties", &self.properties)
            .field("body", &body.to_string())
            .finish()
    }
}

/// What an `EventQueue` listener gets: the topic and the decoded content.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub key: String,
    pub content: Value,
}
