//! In-process broker implementing the [`Driver`] capabilities.
//!
//! The broker state is owned by a single task which receives commands through an mpsc channel
//! and answers through the oneshot channel embedded in the command. The task is spawned by
//! [`Driver::start`], before that every operation fails with a connectivity error.
//!
//! Semantics follow an AMQP broker with a default exchange and one topic exchange:
//!   - sending to a queue goes through the default exchange, routing key is the queue name
//!   - broadcasts go to the topic exchange and are routed by the bindings
//!   - messages wait in the queue until a consumer arrives
//!   - every delivery has a unique delivery tag and it stays unacked until it is acked, unless
//!     the consumer listens in no-ack mode
//!   - when a consumer goes away its unacked messages are requeued, an auto-delete queue is
//!     deleted with its bindings
use super::topic::match_routing_key;
use super::{ConsumeFlags, DeliverySink, Driver, QueueFlags};
use crate::config::DriverConfig;
use crate::domino_error;
use crate::error::ErrorKind;
use crate::logerr;
use crate::message::{Delivery, MessageProperties, QueueHandle};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, trace, warn};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T>>;

#[derive(Debug)]
enum BrokerCommand {
    DeclareQueue {
        name: String,
        flags: QueueFlags,
        result: Reply<QueueHandle>,
    },
    Bind {
        queue_name: String,
        routing_key: String,
        result: Reply<()>,
    },
    Unbind {
        queue_name: String,
        routing_key: String,
        result: Reply<()>,
    },
    Publish {
        message: StoredMessage,
        result: Reply<()>,
    },
    Consume {
        queue_name: String,
        flags: ConsumeFlags,
        sink: DeliverySink,
        result: Reply<()>,
    },
    /// The receiver of `sink` has been dropped.
    ConsumerGone {
        queue_name: String,
        sink: DeliverySink,
    },
    Ack {
        delivery_tag: u64,
        result: Reply<()>,
    },
    GetBindings {
        queue_name: String,
        result: Reply<Vec<String>>,
    },
    GetUnacked {
        queue_name: String,
        result: Reply<usize>,
    },
}

#[derive(Clone, Debug)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Bytes,
}

#[derive(Debug)]
struct TopicBinding {
    routing_key: String,
    queue_name: String,
}

#[derive(Debug)]
struct Consumer {
    sink: DeliverySink,
    no_ack: bool,
}

#[derive(Debug)]
struct QueueState {
    flags: QueueFlags,
    consumer: Option<Consumer>,
    messages: VecDeque<StoredMessage>,
}

#[derive(Debug)]
struct Unacked {
    queue_name: String,
    message: StoredMessage,
}

struct BrokerState {
    /// For the consumer watchers, it doesn't keep the command loop alive.
    commands: mpsc::WeakSender<BrokerCommand>,
    broadcast_exchange: String,
    queues: HashMap<String, QueueState>,
    bindings: Vec<TopicBinding>,
    /// Delivered but not yet acked messages by delivery tag.
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
}

/// A broker living in the memory of the process. Cloning is not supported, share it with an
/// `Arc`.
pub struct InMemoryDriver {
    config: DriverConfig,
    command_sink: Mutex<Option<mpsc::Sender<BrokerCommand>>>,
}

impl InMemoryDriver {
    pub fn new(config: DriverConfig) -> Self {
        InMemoryDriver {
            config,
            command_sink: Mutex::new(None),
        }
    }

    /// The topic patterns `queue` is bound with, in binding order.
    pub async fn bindings(&self, queue: &str) -> Result<Vec<String>> {
        let queue_name = queue.to_string();

        self.call(|result| BrokerCommand::GetBindings { queue_name, result })
            .await
    }

    /// Number of messages delivered from `queue` and not acked yet.
    pub async fn unacked(&self, queue: &str) -> Result<usize> {
        let queue_name = queue.to_string();

        self.call(|result| BrokerCommand::GetUnacked { queue_name, result })
            .await
    }

    fn sink(&self) -> Result<mpsc::Sender<BrokerCommand>> {
        let guard = self.command_sink.lock().unwrap_or_else(|p| p.into_inner());

        match guard.as_ref() {
            Some(sink) => Ok(sink.clone()),
            None => domino_error!(ErrorKind::ConnectivityFailure, "Driver is not started"),
        }
    }

    async fn call<T, F>(&self, command: F) -> Result<T>
    where
        F: FnOnce(Reply<T>) -> BrokerCommand,
    {
        let sink = self.sink()?;
        let (tx, rx) = oneshot::channel();

        if sink.send(command(tx)).await.is_err() {
            return domino_error!(ErrorKind::ConnectivityFailure, "Broker has stopped");
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => domino_error!(ErrorKind::ConnectivityFailure, "Broker dropped the command"),
        }
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &Value, properties: MessageProperties) -> Result<()> {
        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties,
            body: Bytes::from(serde_json::to_vec(payload)?),
        };

        self.call(|result| BrokerCommand::Publish { message, result }).await
    }
}

#[async_trait]
impl Driver for InMemoryDriver {
    async fn start(&self) -> Result<()> {
        let mut guard = self.command_sink.lock().unwrap_or_else(|p| p.into_inner());

        if guard.is_some() {
            debug!("Broker {} is already started", self.config.url);

            return Ok(());
        }

        info!(
            "Start in-memory broker for {} with exchange {}",
            self.config.url, self.config.broadcast_exchange
        );

        let (sink, stream) = mpsc::channel(16);
        let mut state = BrokerState {
            commands: sink.downgrade(),
            broadcast_exchange: self.config.broadcast_exchange.clone(),
            queues: HashMap::new(),
            bindings: vec![],
            unacked: HashMap::new(),
            next_delivery_tag: 1,
        };

        tokio::spawn(async move {
            state.command_loop(stream).await;
        });

        *guard = Some(sink);

        Ok(())
    }

    async fn create_queue(&self, name: &str, flags: QueueFlags) -> Result<QueueHandle> {
        let name = name.to_string();

        self.call(|result| BrokerCommand::DeclareQueue { name, flags, result })
            .await
    }

    async fn send(&self, queue: &str, payload: &Value, properties: MessageProperties) -> Result<()> {
        self.publish("", queue, payload, properties).await
    }

    async fn broadcast(&self, topic: &str, payload: &Value) -> Result<()> {
        let exchange = self.config.broadcast_exchange.clone();

        self.publish(&exchange, topic, payload, MessageProperties::default())
            .await
    }

    async fn subscribe(&self, queue: &str, topic: &str) -> Result<()> {
        let queue_name = queue.to_string();
        let routing_key = topic.to_string();

        self.call(|result| BrokerCommand::Bind {
            queue_name,
            routing_key,
            result,
        })
        .await
    }

    async fn unsubscribe(&self, queue: &str, topic: &str) -> Result<()> {
        let queue_name = queue.to_string();
        let routing_key = topic.to_string();

        self.call(|result| BrokerCommand::Unbind {
            queue_name,
            routing_key,
            result,
        })
        .await
    }

    async fn listen(&self, queue: &str, flags: ConsumeFlags, sink: DeliverySink) -> Result<()> {
        let queue_name = queue.to_string();

        self.call(|result| BrokerCommand::Consume {
            queue_name,
            flags,
            sink,
            result,
        })
        .await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let delivery_tag = delivery.delivery_tag;

        self.call(|result| BrokerCommand::Ack { delivery_tag, result })
            .await
    }
}

fn not_found<T>(queue_name: &str) -> Result<T> {
    domino_error!(
        ErrorKind::PreconditionFailed,
        format!("NOT_FOUND - no queue '{queue_name}'")
    )
}

impl BrokerState {
    async fn command_loop(&mut self, mut commands: mpsc::Receiver<BrokerCommand>) {
        use BrokerCommand::*;

        while let Some(command) = commands.recv().await {
            trace!("Command {command:?}");

            match command {
                DeclareQueue { name, flags, result } => {
                    logerr!(result.send(Ok(self.handle_declare(name, flags))));
                }
                Bind {
                    queue_name,
                    routing_key,
                    result,
                } => {
                    logerr!(result.send(self.handle_bind(queue_name, routing_key)));
                }
                Unbind {
                    queue_name,
                    routing_key,
                    result,
                } => {
                    self.bindings
                        .retain(|b| !(b.queue_name == queue_name && b.routing_key == routing_key));

                    logerr!(result.send(Ok(())));
                }
                Publish { message, result } => {
                    logerr!(result.send(self.handle_publish(message)));
                }
                Consume {
                    queue_name,
                    flags,
                    sink,
                    result,
                } => {
                    logerr!(result.send(self.handle_consume(queue_name, flags, sink)));
                }
                ConsumerGone { queue_name, sink } => {
                    let current = self
                        .queues
                        .get_mut(&queue_name)
                        .filter(|q| q.consumer.as_ref().is_some_and(|c| c.sink.same_channel(&sink)));

                    // a replaced consumer is already forgotten
                    if let Some(queue) = current {
                        queue.consumer = None;

                        self.consumer_gone(&queue_name);
                    }
                }
                Ack { delivery_tag, result } => {
                    let r = match self.unacked.remove(&delivery_tag) {
                        Some(Unacked { queue_name, .. }) => {
                            trace!("Ack {delivery_tag} on {queue_name}");
                            Ok(())
                        }
                        None => domino_error!(
                            ErrorKind::PreconditionFailed,
                            format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")
                        ),
                    };

                    logerr!(result.send(r));
                }
                GetBindings { queue_name, result } => {
                    let keys = self
                        .bindings
                        .iter()
                        .filter(|b| b.queue_name == queue_name)
                        .map(|b| b.routing_key.clone())
                        .collect();

                    logerr!(result.send(Ok(keys)));
                }
                GetUnacked { queue_name, result } => {
                    let count = self.unacked.values().filter(|u| u.queue_name == queue_name).count();

                    logerr!(result.send(Ok(count)));
                }
            }
        }

        debug!("Broker command loop exited");
    }

    /// Declare means if the queue hasn't existed yet, it creates that.
    fn handle_declare(&mut self, name: String, flags: QueueFlags) -> QueueHandle {
        let name = if name.is_empty() {
            format!("amq.gen-{:032x}", rand::random::<u128>())
        } else {
            name
        };

        if !self.queues.contains_key(&name) {
            debug!("Declare queue {name} {flags:?}");

            self.queues.insert(
                name.clone(),
                QueueState {
                    flags,
                    consumer: None,
                    messages: VecDeque::new(),
                },
            );
        }

        name
    }

    fn handle_bind(&mut self, queue_name: String, routing_key: String) -> Result<()> {
        if !self.queues.contains_key(&queue_name) {
            return not_found(&queue_name);
        }

        let exists = self
            .bindings
            .iter()
            .any(|b| b.queue_name == queue_name && b.routing_key == routing_key);

        if !exists {
            debug!("Bind {queue_name} to {} with {routing_key}", self.broadcast_exchange);

            self.bindings.push(TopicBinding {
                routing_key,
                queue_name,
            });
        }

        Ok(())
    }

    fn handle_publish(&mut self, message: StoredMessage) -> Result<()> {
        if message.exchange.is_empty() {
            if !self.queues.contains_key(&message.routing_key) {
                return not_found(&message.routing_key);
            }

            let queue_name = message.routing_key.clone();

            self.enqueue(&queue_name, message);

            return Ok(());
        }

        if message.exchange != self.broadcast_exchange {
            return domino_error!(
                ErrorKind::PreconditionFailed,
                format!("NOT_FOUND - no exchange '{}'", message.exchange)
            );
        }

        // A queue gets the message once even if more of its bindings match.
        let mut targets: Vec<String> = vec![];

        for b in &self.bindings {
            if match_routing_key(&b.routing_key, &message.routing_key) && !targets.contains(&b.queue_name) {
                targets.push(b.queue_name.clone());
            }
        }

        if targets.is_empty() {
            trace!("Broadcast {} is not routed", message.routing_key);
        }

        for queue_name in targets {
            self.enqueue(&queue_name, message.clone());
        }

        Ok(())
    }

    fn handle_consume(&mut self, queue_name: String, flags: ConsumeFlags, sink: DeliverySink) -> Result<()> {
        match self.queues.get_mut(&queue_name) {
            Some(queue) => {
                if queue.consumer.is_some() {
                    debug!("Replace consumer of {queue_name}");
                }

                queue.consumer = Some(Consumer {
                    sink: sink.clone(),
                    no_ack: flags.contains(ConsumeFlags::NO_ACK),
                });
            }
            None => return not_found(&queue_name),
        }

        self.watch_consumer(queue_name.clone(), sink);
        self.flush(&queue_name);

        Ok(())
    }

    /// Report to the command loop when the receiver of the consumer is dropped.
    fn watch_consumer(&self, queue_name: String, sink: DeliverySink) {
        let commands = self.commands.clone();

        tokio::spawn(async move {
            sink.closed().await;

            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(BrokerCommand::ConsumerGone { queue_name, sink }).await;
            }
        });
    }

    fn enqueue(&mut self, queue_name: &str, message: StoredMessage) {
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue.messages.push_back(message);
        }

        self.flush(queue_name);
    }

    /// Deliver the waiting messages of a queue to its consumer.
    fn flush(&mut self, queue_name: &str) {
        let mut consumer_gone = false;

        if let Some(queue) = self.queues.get_mut(queue_name) {
            let Some((consumer, no_ack)) = queue.consumer.as_ref().map(|c| (c.sink.clone(), c.no_ack)) else {
                return;
            };

            while let Some(message) = queue.messages.pop_front() {
                let delivery_tag = self.next_delivery_tag;

                let delivery = Delivery {
                    queue: queue_name.to_string(),
                    delivery_tag,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    properties: message.properties.clone(),
                    body: message.body.clone(),
                };

                if consumer.send(delivery).is_err() {
                    queue.messages.push_front(message);
                    queue.consumer = None;
                    consumer_gone = true;

                    break;
                }

                self.next_delivery_tag += 1;

                if !no_ack {
                    self.unacked.insert(
                        delivery_tag,
                        Unacked {
                            queue_name: queue_name.to_string(),
                            message,
                        },
                    );
                }
            }
        }

        if consumer_gone {
            self.consumer_gone(queue_name);
        }
    }

    fn consumer_gone(&mut self, queue_name: &str) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.queue_name == queue_name)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let returned: Vec<StoredMessage> = tags
            .iter()
            .filter_map(|tag| self.unacked.remove(tag))
            .map(|u| u.message)
            .collect();

        let auto_delete = self
            .queues
            .get(queue_name)
            .map(|q| q.flags.contains(QueueFlags::AUTO_DELETE))
            .unwrap_or(false);

        if auto_delete {
            info!("Delete auto-delete queue {queue_name}, its consumer is gone");

            self.queues.remove(queue_name);
            self.bindings.retain(|b| b.queue_name != queue_name);
        } else if let Some(queue) = self.queues.get_mut(queue_name) {
            warn!(
                "Consumer of {queue_name} is gone, {} unacked messages are requeued",
                returned.len()
            );

            for message in returned.into_iter().rev() {
                queue.messages.push_front(message);
            }
        }
    }
}
