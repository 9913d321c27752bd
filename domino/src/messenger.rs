use crate::config::MessengerConfig;
use crate::domino_error;
use crate::driver::memory::InMemoryDriver;
use crate::driver::{ConsumeFlags, Driver, QueueFlags};
use crate::error::ErrorKind;
use crate::event_queue::EventQueue;
use crate::message::{Delivery, MessageProperties, QueueHandle};
use crate::request_queue::RequestQueue;
use crate::response_queue::ResponseQueue;
use anyhow::Result;
use log::{debug, error, info};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell};

/// Entry point of the messaging patterns. It holds one driver and every queue object created by
/// the messenger shares that driver.
pub struct Messenger {
    config: MessengerConfig,
    driver: Arc<dyn Driver>,
    requests: OnceCell<Arc<RequestQueue>>,
}

impl Messenger {
    pub fn new(driver: Arc<dyn Driver>, config: MessengerConfig) -> Self {
        Messenger {
            config,
            driver,
            requests: OnceCell::new(),
        }
    }

    /// Messenger over an in-process broker.
    pub fn in_memory(config: MessengerConfig) -> Self {
        let driver = Arc::new(InMemoryDriver::new(config.driver.clone()));

        Self::new(driver, config)
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn driver(&self) -> Arc<dyn Driver> {
        self.driver.clone()
    }

    /// Connect the driver.
    pub async fn start(&self) -> Result<()> {
        info!("Start messenger on {}", self.config.driver.url);

        self.driver.start().await
    }

    /// Send `payload` directly to `queue`.
    pub async fn send<T: Serialize + ?Sized>(&self, payload: &T, queue: &str) -> Result<()> {
        let payload = serde_json::to_value(payload)?;

        self.driver.send(queue, &payload, MessageProperties::default()).await
    }

    /// Broadcast `payload` under `topic`.
    pub async fn broadcast<T: Serialize + ?Sized>(&self, topic: &str, payload: &T) -> Result<()> {
        let payload = serde_json::to_value(payload)?;

        self.driver.broadcast(topic, &payload).await
    }

    /// Answer an RPC request: send `payload` to the `reply_to` queue of the request, with its
    /// correlation id.
    pub async fn reply<T: Serialize + ?Sized>(&self, request: &Delivery, payload: &T) -> Result<()> {
        let Some(reply_to) = request.properties.reply_to.as_deref() else {
            return domino_error!(
                ErrorKind::PreconditionFailed,
                format!("Message {} has no reply-to queue", request.delivery_tag)
            );
        };

        let mut properties = MessageProperties::default();
        properties.correlation_id = request.properties.correlation_id.clone();

        let payload = serde_json::to_value(payload)?;

        self.driver.send(reply_to, &payload, properties).await
    }

    /// Consume `queue` and call `callback` with every message. Acking is up to the callback's
    /// owner, see [`Messenger::ack`].
    pub async fn listen<F>(&self, queue: &str, callback: F) -> Result<()>
    where
        F: Fn(Delivery) + Send + 'static,
    {
        let (sink, mut stream) = mpsc::unbounded_channel();

        self.driver.listen(queue, ConsumeFlags::empty(), sink).await?;

        let queue = queue.to_string();

        tokio::spawn(async move {
            while let Some(delivery) = stream.recv().await {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(delivery))).is_err() {
                    error!("Listener of {queue} panicked");
                }
            }

            debug!("Listening on {queue} stopped");
        });

        Ok(())
    }

    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.driver.ack(delivery).await
    }

    /// Declare a named queue.
    pub async fn create_queue(&self, name: &str) -> Result<QueueHandle> {
        self.driver.create_queue(name, QueueFlags::empty()).await
    }

    pub async fn create_private_queue(&self) -> Result<QueueHandle> {
        self.driver.create_private_queue(QueueFlags::empty()).await
    }

    pub fn response_queue(&self) -> ResponseQueue {
        ResponseQueue::new(self.driver.clone())
    }

    pub fn event_queue(&self) -> EventQueue {
        EventQueue::new(self.driver.clone())
    }

    /// A new request queue with the configured default timeout. It needs to be started.
    pub fn request_queue(&self) -> RequestQueue {
        RequestQueue::new(self.driver.clone()).with_timeout(self.config.request.timeout())
    }

    /// Send a request via the shared request queue of the messenger and wait for the reply. The
    /// shared queue is created and started on first use.
    pub async fn request<T: Serialize + ?Sized>(&self, payload: &T, queue: &str) -> Result<Delivery> {
        let requests = self
            .requests
            .get_or_try_init(|| async {
                let rq = self.request_queue();

                rq.start().await?;

                Ok::<_, anyhow::Error>(Arc::new(rq))
            })
            .await?;

        requests.request(payload, queue).await
    }
}
