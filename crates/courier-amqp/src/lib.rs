//! # courier-amqp
//!
//! AMQP transport for courier.
//!
//! - [`server`]: [`AmqpServer`], which consumes one queue, optionally bound
//!   to an exchange, and publishes replies to each request's `replyTo`
//! - [`broker`]: the channel operations the server relies on
//! - [`lapin_broker`]: those operations over a real broker connection
//! - [`memory`]: an in-process broker that records every call
//!
//! With `wildcards` enabled, registered patterns double as routing keys and
//! may use `*` (one segment) and `#` (any number of segments).

#![deny(unsafe_code)]

pub mod broker;
pub mod context;
pub mod errors;
pub mod lapin_broker;
pub mod memory;
pub mod server;

pub use broker::{BrokerChannel, BrokerConnector, BrokerSession, Delivery, DeliveryStream};
pub use context::AmqpContext;
pub use errors::{BrokerError, Result};
pub use lapin_broker::LapinConnector;
pub use memory::{BrokerOp, MemoryBroker, Published, Recorded};
pub use server::{AmqpServer, AmqpServerBuilder};
