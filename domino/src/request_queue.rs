//! Client side of RPC over messaging.
//!
//! Every request gets a fresh correlation id and a single-use reply slot in the pending
//! registry. The replies of all requests arrive on the same private queue; the dispatcher looks
//! up the slot by the correlation id of the reply, removes it and resolves it. So one slot is
//! resolved at most once, duplicated or late replies are acked and dropped.
//!
//! A slot is removed from the registry when
//!   - the matching reply arrives
//!   - the timeout of the request expires
//!   - the [`PendingReply`] is dropped before resolution
//!   - the reply stream ends, then all waiters get a cancelled error
use crate::domino_error;
use crate::driver::{ConsumeFlags, DeliveryStream, Driver, QueueFlags};
use crate::error::{DominoError, ErrorKind};
use crate::logerr;
use crate::message::{Delivery, MessageProperties, QueueHandle};
use anyhow::Result;
use log::{debug, error, info, trace, warn};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

type ReplySlot = oneshot::Sender<Result<Delivery>>;
type Registry = Mutex<HashMap<String, ReplySlot>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ReplySlot>> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}

pub struct RequestQueue {
    driver: Arc<dyn Driver>,
    queue: OnceLock<QueueHandle>,
    starting: tokio::sync::Mutex<()>,
    registry: Arc<Registry>,
    default_timeout: Option<Duration>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// The reply of a request, resolved once by the request queue.
///
/// Awaiting it gives the reply message itself, so the transport fields are available as well as
/// the content. Dropping it before the reply arrives cancels the request: the slot is removed
/// and a late reply will be dropped.
#[must_use = "the reply is lost if the pending reply is not awaited"]
pub struct PendingReply {
    correlation_id: String,
    receiver: oneshot::Receiver<Result<Delivery>>,
    registry: Weak<Registry>,
    deadline: Option<(Duration, Pin<Box<tokio::time::Sleep>>)>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    fn forget(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(&self.correlation_id).is_some(),
            None => false,
        }
    }
}

impl Future for PendingReply {
    type Output = Result<Delivery>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Poll::Ready(result) = Pin::new(&mut self.receiver).poll(cx) {
            return Poll::Ready(match result {
                Ok(reply) => reply,
                Err(_) => domino_error!(
                    ErrorKind::Cancelled,
                    format!("Request {} is abandoned", self.correlation_id)
                ),
            });
        }

        if let Some((timeout, sleep)) = self.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                let timeout = *timeout;

                self.forget();

                return Poll::Ready(domino_error!(
                    ErrorKind::Timeout,
                    format!("No reply for {} in {:?}", self.correlation_id, timeout)
                ));
            }
        }

        Poll::Pending
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.forget() {
            debug!("Request {} is cancelled", self.correlation_id);
        }
    }
}

impl RequestQueue {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        RequestQueue {
            driver,
            queue: OnceLock::new(),
            starting: tokio::sync::Mutex::new(()),
            registry: Arc::new(Mutex::new(HashMap::new())),
            default_timeout: None,
            dispatcher: Mutex::new(None),
        }
    }

    /// Requests without an explicit timeout give up after `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Create the private reply-to queue and start listening on it.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.starting.lock().await;

        if let Some(queue) = self.queue.get() {
            return domino_error!(ErrorKind::AlreadyStarted, format!("Request queue {queue} is already started"));
        }

        let queue = self.driver.create_private_queue(QueueFlags::AUTO_DELETE).await?;
        let (sink, stream) = mpsc::unbounded_channel();

        self.driver.listen(&queue, ConsumeFlags::empty(), sink).await?;

        info!("Request queue {queue} is active");

        let handle = tokio::spawn(dispatch_loop(
            queue.clone(),
            stream,
            self.registry.clone(),
            self.driver.clone(),
        ));

        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        let _ = self.queue.set(queue);

        Ok(())
    }

    /// Send `payload` to `queue` and wait for the reply. The default timeout applies.
    pub async fn request<T: Serialize + ?Sized>(&self, payload: &T, queue: &str) -> Result<Delivery> {
        let payload = serde_json::to_value(payload)?;

        self.send_request(&payload, queue, self.default_timeout).await?.await
    }

    /// Send `payload` to `queue` and wait for the reply at most `timeout` long.
    pub async fn request_timeout<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        queue: &str,
        timeout: Duration,
    ) -> Result<Delivery> {
        let payload = serde_json::to_value(payload)?;

        self.send_request(&payload, queue, Some(timeout)).await?.await
    }

    /// Send the request and return the pending reply without waiting for it. Many requests can
    /// be in flight at the same time, each of them gets its own reply.
    pub async fn send_request(&self, payload: &Value, queue: &str, timeout: Option<Duration>) -> Result<PendingReply> {
        let reply_to = match self.queue.get() {
            Some(q) => q.clone(),
            None => return domino_error!(ErrorKind::PrematureUse, "Request queue is not started"),
        };

        let correlation_id = Uuid::new_v4().as_hyphenated().to_string();
        let (tx, rx) = oneshot::channel();

        lock(&self.registry).insert(correlation_id.clone(), tx);

        // If the send fails, dropping the pending reply removes the slot.
        let pending = PendingReply {
            correlation_id: correlation_id.clone(),
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
            deadline: timeout.map(|t| (t, Box::pin(tokio::time::sleep(t)))),
        };

        trace!("Request {correlation_id} to {queue}");

        let properties = MessageProperties::default()
            .reply_to(&reply_to)
            .correlation_id(&correlation_id);

        self.driver.send(queue, payload, properties).await?;

        Ok(pending)
    }

    /// Number of requests waiting for their replies.
    pub fn pending(&self) -> usize {
        lock(&self.registry).len()
    }

    /// The reply-to queue, once the request queue is active.
    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue.get().cloned()
    }

    pub fn is_active(&self) -> bool {
        self.queue.get().is_some()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(queue: QueueHandle, mut stream: DeliveryStream, registry: Arc<Registry>, driver: Arc<dyn Driver>) {
    while let Some(delivery) = stream.recv().await {
        resolve(&registry, &delivery);

        logerr!(driver.ack(&delivery).await);
    }

    let abandoned: Vec<_> = lock(&registry).drain().collect();

    for (correlation_id, slot) in abandoned {
        let err = DominoError::new(ErrorKind::Cancelled, format!("Reply queue {queue} is closed"));

        if slot.send(Err(anyhow::Error::new(err))).is_err() {
            trace!("Waiter of {correlation_id} is gone");
        }
    }

    debug!("Request queue {queue} stopped");
}

/// Resolve the pending request of the reply. A reply which cannot be decoded resolves the
/// request with the decode error.
fn resolve(registry: &Registry, delivery: &Delivery) {
    let decoded = delivery.json();

    let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
        warn!("Reply without correlation id is dropped {:?}", delivery);

        return;
    };

    let slot = lock(registry).remove(correlation_id);

    match slot {
        Some(slot) => {
            if let Err(e) = &decoded {
                error!("Reply of {correlation_id} cannot be decoded {:?}", e);
            }

            if slot.send(decoded.map(|_| delivery.clone())).is_err() {
                debug!("Requester of {correlation_id} is gone");
            }
        }
        None => {
            warn!(
                "{:?} reply {correlation_id} is dropped, there is no pending request",
                ErrorKind::UnmatchedReply
            );
        }
    }
}
