//! Messaging patterns over a pluggable broker driver.
//!
//! Three queue objects are built on top of a [`Driver`]:
//!   - [`EventQueue`] subscribes to topics and dispatches the broadcasts
//!   - [`ResponseQueue`] dispatches the messages sent to its private queue
//!   - [`RequestQueue`] sends requests and resolves them when their replies arrive
//!
//! The [`Messenger`] creates them over one shared driver.
//!
//! ```no_run
//! use domino::{Messenger, MessengerConfig};
//! use serde_json::json;
//!
//! async fn rpc() -> anyhow::Result<()> {
//!     let messenger = Messenger::in_memory(MessengerConfig::default());
//!     messenger.start().await?;
//!
//!     let requests = messenger.request_queue();
//!     requests.start().await?;
//!
//!     let reply = requests.request(&json!({"a": 1}), "svc.echo").await?;
//!     println!("{}", reply.json()?);
//!
//!     Ok(())
//! }
//! ```
mod dev;
pub use dev::setup_logger;

pub mod config;
pub use config::{DriverConfig, MessengerConfig, RequestConfig};

pub mod driver;
pub use driver::memory::InMemoryDriver;
pub use driver::{ConsumeFlags, DeliverySink, DeliveryStream, Driver, QueueFlags};

pub mod error;
pub use error::{DominoError, ErrorKind};

mod event_queue;
pub use event_queue::EventQueue;

mod listener;
pub use listener::{ListenerFn, ListenerHandle};

mod message;
pub use message::{Delivery, Event, MessageProperties, QueueHandle};

mod messenger;
pub use messenger::Messenger;

mod request_queue;
pub use request_queue::{PendingReply, RequestQueue};

mod response_queue;
pub use response_queue::ResponseQueue;
