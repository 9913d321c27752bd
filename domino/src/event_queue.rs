//! Publish/subscribe consumer.
//!
//! An `EventQueue` owns a private queue bound to topics of the broadcast exchange. Topics can be
//! subscribed before the queue exists, those subscriptions are kept in order and applied when
//! the queue is created during [`EventQueue::start`].
use crate::domino_error;
use crate::driver::{ConsumeFlags, DeliverySink, DeliveryStream, Driver, QueueFlags};
use crate::error::ErrorKind;
use crate::listener::{ListenerHandle, Listeners};
use crate::message::{Delivery, Event, QueueHandle};
use anyhow::Result;
use log::{debug, error, info, trace};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, PartialEq)]
enum SubscriptionState {
    /// Topics requested while the queue isn't active, in request order. The queue is already
    /// there if an earlier activation failed after creating it.
    AwaitingQueue {
        pending: Vec<String>,
        queue: Option<QueueHandle>,
    },
    Active { queue: QueueHandle },
}

/// Drives the subscriptions of a queue from "no queue yet" to "bound to the topics".
///
/// The state lock is held during the driver calls, so subscriptions and the start are applied
/// in the order they were requested.
pub(crate) struct SubscriptionCoordinator {
    driver: Arc<dyn Driver>,
    state: tokio::sync::Mutex<SubscriptionState>,
}

impl SubscriptionCoordinator {
    pub(crate) fn new(driver: Arc<dyn Driver>) -> Self {
        SubscriptionCoordinator {
            driver,
            state: tokio::sync::Mutex::new(SubscriptionState::AwaitingQueue {
                pending: vec![],
                queue: None,
            }),
        }
    }

    /// Create the private queue, bind the pending topics and start listening with `sink`. If any
    /// step fails the pending topics are kept and the coordinator remains inactive. A queue
    /// created by a failed activation is reused by the next one.
    pub(crate) async fn activate(&self, sink: DeliverySink) -> Result<QueueHandle> {
        let mut state = self.state.lock().await;

        let (pending, created) = match &mut *state {
            SubscriptionState::AwaitingQueue { pending, queue } => (pending.clone(), queue),
            SubscriptionState::Active { queue } => {
                return domino_error!(ErrorKind::AlreadyStarted, format!("Event queue {queue} is already started"));
            }
        };

        let queue = match created.clone() {
            Some(queue) => {
                debug!("Reuse queue {queue} of a failed start");

                queue
            }
            None => {
                let queue = self.driver.create_private_queue(QueueFlags::AUTO_DELETE).await?;

                *created = Some(queue.clone());

                queue
            }
        };

        for topic in &pending {
            debug!("Apply pending subscription {topic} on {queue}");

            self.driver.subscribe(&queue, topic).await?;
        }

        // events are never acked
        self.driver.listen(&queue, ConsumeFlags::NO_ACK, sink).await?;

        *state = SubscriptionState::Active { queue: queue.clone() };

        Ok(queue)
    }

    pub(crate) async fn subscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        match &mut *state {
            SubscriptionState::Active { queue } => self.driver.subscribe(queue, topic).await,
            SubscriptionState::AwaitingQueue { pending, .. } => {
                trace!("Buffer subscription {topic}");

                pending.push(topic.to_string());

                Ok(())
            }
        }
    }

    pub(crate) async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut state = self.state.lock().await;

        match &mut *state {
            SubscriptionState::Active { queue } => self.driver.unsubscribe(queue, topic).await,
            SubscriptionState::AwaitingQueue { pending, queue } => {
                pending.retain(|t| t != topic);

                // a failed start may have bound it already
                match queue {
                    Some(queue) => self.driver.unsubscribe(queue, topic).await,
                    None => Ok(()),
                }
            }
        }
    }

    #[cfg(test)]
    async fn pending(&self) -> Vec<String> {
        match &*self.state.lock().await {
            SubscriptionState::AwaitingQueue { pending, .. } => pending.clone(),
            SubscriptionState::Active { .. } => vec![],
        }
    }
}

/// Subscribes to topics and delivers the matching broadcasts to the registered listeners.
///
/// ```no_run
/// use domino::{EventQueue, InMemoryDriver, DriverConfig, Driver};
/// use std::sync::Arc;
///
/// async fn events() -> anyhow::Result<()> {
///     let driver = Arc::new(InMemoryDriver::new(DriverConfig::default()));
///     driver.start().await?;
///
///     let events = EventQueue::new(driver.clone());
///     events.subscribe("orders.created").await?;
///     events.on_event(|event| {
///         println!("{} {}", event.key, event.content);
///         Ok(())
///     });
///     events.start().await?;
///
///     Ok(())
/// }
/// ```
pub struct EventQueue {
    coordinator: SubscriptionCoordinator,
    queue: OnceLock<QueueHandle>,
    listeners: Arc<Listeners<Event>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        EventQueue {
            coordinator: SubscriptionCoordinator::new(driver),
            queue: OnceLock::new(),
            listeners: Arc::new(Listeners::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// Create the private queue, apply the subscriptions made so far and start dispatching the
    /// events.
    pub async fn start(&self) -> Result<()> {
        let (sink, stream) = mpsc::unbounded_channel();

        let queue = self.coordinator.activate(sink).await?;

        info!("Event queue {queue} is active");

        let listeners = self.listeners.clone();
        let handle = tokio::spawn(dispatch_loop(queue.clone(), stream, listeners));

        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        let _ = self.queue.set(queue);

        Ok(())
    }

    /// Subscribe to a topic pattern. Before the start the topic is buffered.
    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.coordinator.subscribe(topic).await
    }

    /// Unsubscribe from a topic pattern. Before the start it only removes the topic from the
    /// buffer, it isn't an error if it wasn't there.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.coordinator.unsubscribe(topic).await
    }

    /// Register a listener for the events. The returned handle removes it.
    pub fn on_event<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    /// The private queue, once the event queue is active.
    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue.get().cloned()
    }

    pub fn is_active(&self) -> bool {
        self.queue.get().is_some()
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(queue: QueueHandle, mut stream: DeliveryStream, listeners: Arc<Listeners<Event>>) {
    while let Some(delivery) = stream.recv().await {
        if let Err(e) = dispatch(&delivery, &listeners) {
            error!("Cannot dispatch event {:?} {:?}", delivery, e);
        }
    }

    debug!("Event queue {queue} stopped");
}

fn dispatch(delivery: &Delivery, listeners: &Listeners<Event>) -> Result<()> {
    let event = Event {
        key: delivery.routing_key.clone(),
        content: delivery.json()?,
    };

    trace!("Dispatch event {} to {} listeners", event.key, listeners.len());

    listeners.dispatch(&event);

    Ok(())
}
