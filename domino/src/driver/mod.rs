//! The capability set a broker driver provides to the messaging patterns.
//!
//! The queue objects never talk to the network, everything goes through a [`Driver`] which is
//! shared between them as an `Arc<dyn Driver>`.
pub mod memory;
pub mod topic;

use crate::message::{Delivery, MessageProperties, QueueHandle};
use anyhow::Result;
use async_trait::async_trait;
use bitflags::bitflags;
use serde_json::Value;
use tokio::sync::mpsc;

/// The driver pushes the consumed messages of a queue into this sink, one by one.
pub type DeliverySink = mpsc::UnboundedSender<Delivery>;
/// The receiving end of a [`DeliverySink`].
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct QueueFlags: u8 {
        /// The queue survives a broker restart.
        const DURABLE = 0b0000_0001;
        /// Only the declaring connection can use the queue.
        const EXCLUSIVE = 0b0000_0010;
        /// The queue is deleted when its last consumer goes away.
        const AUTO_DELETE = 0b0000_0100;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ConsumeFlags: u8 {
        /// The broker considers a message acknowledged as soon as it is delivered.
        const NO_ACK = 0b0000_0001;
    }
}

#[async_trait]
pub trait Driver: Send + Sync {
    /// Connect to the broker and prepare the broadcast exchange.
    async fn start(&self) -> Result<()>;

    /// Declare a named queue, or get the handle of an existing one. With an empty name the broker
    /// generates a unique name.
    async fn create_queue(&self, name: &str, flags: QueueFlags) -> Result<QueueHandle>;

    /// Declare a fresh, exclusive queue with a broker generated name. Pass
    /// [`QueueFlags::AUTO_DELETE`] to get rid of it together with its consumer.
    async fn create_private_queue(&self, flags: QueueFlags) -> Result<QueueHandle> {
        self.create_queue("", flags | QueueFlags::EXCLUSIVE).await
    }

    /// Send `payload` directly to `queue`.
    async fn send(&self, queue: &str, payload: &Value, properties: MessageProperties) -> Result<()>;

    /// Publish `payload` on the broadcast exchange under `topic`.
    async fn broadcast(&self, topic: &str, payload: &Value) -> Result<()>;

    /// Bind `queue` to the broadcast exchange with the `topic` pattern.
    async fn subscribe(&self, queue: &str, topic: &str) -> Result<()>;

    async fn unsubscribe(&self, queue: &str, topic: &str) -> Result<()>;

    /// Start consuming `queue`. The messages are pushed to `sink` until the consumer goes away,
    /// that is when the receiving end of `sink` is dropped. With [`ConsumeFlags::NO_ACK`] the
    /// deliveries must not be acked.
    async fn listen(&self, queue: &str, flags: ConsumeFlags, sink: DeliverySink) -> Result<()>;

    /// Acknowledge a consumed message.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}
