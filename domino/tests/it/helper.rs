#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use domino::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A driver call as the recording driver saw it.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CreateQueue(String),
    Send(String),
    Broadcast(String),
    Subscribe(String, String),
    Unsubscribe(String, String),
    Listen(String),
    Ack(u64),
}

/// Delegates to an in-memory broker and records the calls made through it. It can also push
/// raw messages to the listeners, bypassing the broker.
pub struct RecordingDriver {
    pub broker: InMemoryDriver,
    calls: Mutex<Vec<Call>>,
    sinks: Mutex<HashMap<String, DeliverySink>>,
    failing_subscribes: AtomicUsize,
}

impl RecordingDriver {
    pub fn new() -> Self {
        RecordingDriver {
            broker: InMemoryDriver::new(DriverConfig::default()),
            calls: Mutex::new(vec![]),
            sinks: Mutex::new(HashMap::new()),
            failing_subscribes: AtomicUsize::new(0),
        }
    }

    pub async fn started() -> Arc<Self> {
        let driver = Arc::new(Self::new());

        driver.start().await.unwrap();

        driver
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn acks(&self, delivery_tag: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == Call::Ack(delivery_tag))
            .count()
    }

    pub fn ack_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Ack(_))).count()
    }

    /// Deliver a raw body to the listener of `queue`, like a broker would do it.
    pub fn inject(&self, queue: &str, delivery_tag: u64, body: &str, properties: MessageProperties) {
        let sinks = self.sinks.lock().unwrap();
        let sink = sinks.get(queue).expect("nobody listens on the queue");

        sink.send(Delivery {
            queue: queue.to_string(),
            delivery_tag,
            exchange: "".to_string(),
            routing_key: queue.to_string(),
            properties,
            body: Bytes::copy_from_slice(body.as_bytes()),
        })
        .unwrap();
    }

    /// The next `n` subscribe calls fail with a connectivity error.
    pub fn fail_subscribes(&self, n: usize) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn start(&self) -> Result<()> {
        self.broker.start().await
    }

    async fn create_queue(&self, name: &str, flags: QueueFlags) -> Result<QueueHandle> {
        let queue = self.broker.create_queue(name, flags).await?;

        self.record(Call::CreateQueue(queue.clone()));

        Ok(queue)
    }

    async fn send(&self, queue: &str, payload: &Value, properties: MessageProperties) -> Result<()> {
        self.record(Call::Send(queue.to_string()));

        self.broker.send(queue, payload, properties).await
    }

    async fn broadcast(&self, topic: &str, payload: &Value) -> Result<()> {
        self.record(Call::Broadcast(topic.to_string()));

        self.broker.broadcast(topic, payload).await
    }

    async fn subscribe(&self, queue: &str, topic: &str) -> Result<()> {
        self.record(Call::Subscribe(queue.to_string(), topic.to_string()));

        let failing = self
            .failing_subscribes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if failing {
            return domino_error!(ErrorKind::ConnectivityFailure, format!("Cannot bind {queue} to {topic}"));
        }

        self.broker.subscribe(queue, topic).await
    }

    async fn unsubscribe(&self, queue: &str, topic: &str) -> Result<()> {
        self.record(Call::Unsubscribe(queue.to_string(), topic.to_string()));

        self.broker.unsubscribe(queue, topic).await
    }

    async fn listen(&self, queue: &str, flags: ConsumeFlags, sink: DeliverySink) -> Result<()> {
        self.record(Call::Listen(queue.to_string()));
        self.sinks.lock().unwrap().insert(queue.to_string(), sink.clone());

        self.broker.listen(queue, flags, sink).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.record(Call::Ack(delivery.delivery_tag));

        self.broker.ack(delivery).await
    }
}

pub async fn recv_with_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    let sleep = tokio::time::sleep(Duration::from_millis(500));
    tokio::pin!(sleep);

    tokio::select! {
        value = rx.recv() => {
            value
        }
        _ = &mut sleep => {
            None
        }
    }
}

/// Listens for values in the channel and if it doesn't get any, returns true. A closed channel
/// counts as getting nothing.
pub async fn recv_nothing<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> bool {
    let sleep = tokio::time::sleep(Duration::from_millis(100));
    tokio::pin!(sleep);

    tokio::select! {
        Some(_) = rx.recv() => {
            false
        }
        _ = &mut sleep => {
            true
        }
    }
}

/// Poll `condition` until it holds or a second passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    condition()
}

pub fn to_domino_error<T: std::fmt::Debug>(result: Result<T>) -> DominoError {
    result.unwrap_err().downcast::<DominoError>().unwrap()
}

/// A listener which forwards what it gets into a channel.
pub fn forwarder<T: Clone + Send + 'static>() -> (
    impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<T>,
) {
    let (tx, rx) = mpsc::unbounded_channel();

    (
        move |value: &T| {
            tx.send(value.clone())
                .map_err(|_| anyhow::anyhow!("Test receiver is gone"))
        },
        rx,
    )
}
