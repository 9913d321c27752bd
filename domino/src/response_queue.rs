//! Reply sink of the server side of RPC.
use crate::domino_error;
use crate::driver::{ConsumeFlags, DeliveryStream, Driver, QueueFlags};
use crate::error::ErrorKind;
use crate::listener::{ListenerHandle, Listeners};
use crate::message::QueueHandle;
use crate::logerr;
use anyhow::Result;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owns a private queue and hands the decoded payload of every message to the registered
/// listeners. Each message is acked once, after all the listeners ran, even if some of them
/// failed.
pub struct ResponseQueue {
    driver: Arc<dyn Driver>,
    queue: OnceLock<QueueHandle>,
    starting: tokio::sync::Mutex<()>,
    listeners: Arc<Listeners<Value>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ResponseQueue {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        ResponseQueue {
            driver,
            queue: OnceLock::new(),
            starting: tokio::sync::Mutex::new(()),
            listeners: Arc::new(Listeners::new()),
            dispatcher: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let _guard = self.starting.lock().await;

        if let Some(queue) = self.queue.get() {
            return domino_error!(ErrorKind::AlreadyStarted, format!("Response queue {queue} is already started"));
        }

        let queue = self.driver.create_private_queue(QueueFlags::AUTO_DELETE).await?;
        let (sink, stream) = mpsc::unbounded_channel();

        self.driver.listen(&queue, ConsumeFlags::empty(), sink).await?;

        info!("Response queue {queue} is active");

        let handle = tokio::spawn(dispatch_loop(
            queue.clone(),
            stream,
            self.listeners.clone(),
            self.driver.clone(),
        ));

        *self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        let _ = self.queue.set(queue);

        Ok(())
    }

    /// Register a listener of the decoded payloads. The returned handle removes it.
    pub fn on_response<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners.add(callback)
    }

    pub fn queue(&self) -> Option<QueueHandle> {
        self.queue.get().cloned()
    }

    pub fn is_active(&self) -> bool {
        self.queue.get().is_some()
    }
}

impl Drop for ResponseQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    queue: QueueHandle,
    mut stream: DeliveryStream,
    listeners: Arc<Listeners<Value>>,
    driver: Arc<dyn Driver>,
) {
    while let Some(delivery) = stream.recv().await {
        match delivery.json() {
            Ok(content) => {
                let failed = listeners.dispatch(&content);

                if failed > 0 {
                    warn!("{failed} listeners failed on message {} of {queue}", delivery.delivery_tag);
                }
            }
            Err(e) => {
                error!("Error {:?}", e);
            }
        }

        logerr!(driver.ack(&delivery).await);
    }

    debug!("Response queue {queue} stopped");
}
