//! # ironbus
//!
//! A broker-less message-bus runtime: reliable, ordered, at-least-once
//! delivery of application messages across in-process and pluggable
//! networked transports, with a durable SQLite-backed inbox/outbox for
//! crash recovery. No external broker process.
//!
//! The pieces:
//!
//! - [`Envelope`]: the unit of transmission and persistence
//! - [`MessageRouter`]: message type -> endpoints, with delivery rules
//! - [`transport`]: the endpoint/sender/listener contracts plus the
//!   built-in in-process transport, batching and inline senders
//! - [`store`]: the transactional inbox/outbox on SQLite
//! - [`continuation`]: the failure-handling decision machine
//! - [`MessageBus`]: all of it assembled, built via [`message_bus`]
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced {
//!     sku: String,
//! }
//!
//! impl ironbus::Message for OrderPlaced {
//!     fn message_type() -> &'static str {
//!         "orders.placed"
//!     }
//! }
//!
//! # async fn demo() -> Result<(), ironbus::Error> {
//! let bus = ironbus::message_bus().start().await?;
//!
//! bus.open_local_endpoint(
//!     "local://orders".parse().unwrap(),
//!     ironbus::EndpointMode::Durable,
//! )?;
//! bus.subscribe("orders.placed", "local://orders".parse().unwrap())?;
//!
//! bus.handlers().register::<OrderPlaced, _, _>(|order, _ctx| async move {
//!     println!("placed {}", order.sku);
//!     Ok(())
//! });
//!
//! bus.send(&OrderPlaced { sku: "A-1".into() }).await?;
//! # Ok(()) }
//! ```

pub mod config;
pub mod continuation;
pub mod durability;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod receiver;
pub mod routing;
pub mod runtime;
pub mod scheduled;
pub mod serialization;
pub mod store;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use continuation::{
    Continuation, FailureAction, FailurePolicies, FailureRule, HandlerFailure,
};
pub use envelope::{Envelope, EnvelopeStatus};
pub use error::Error;
pub use handler::{HandlerContext, HandlerRegistry, HandlerResult};
pub use routing::{DeliveryOptions, Message, MessageRouter};
pub use runtime::{message_bus, MessageBus, OutboxTransaction};
pub use transport::{Endpoint, EndpointMode, EndpointRole};
