// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Application Manager
//!
//! Messaging core for services that talk to RabbitMQ with at-least-once
//! delivery: a supervised connection that reconnects on its own, an
//! idempotent exchange/queue/dead-letter topology, a publisher with confirms
//! and bounded exponential-backoff retry, and a pool of prefetch-limited
//! consumers that retry failed deliveries through TTL holding queues before
//! dead-lettering them.
//!
//! ```no_run
//! use rabbitmq_manager::{handler_fn, RabbitMQApplicationManager, RabbitMQConfigs};
//! use std::{collections::BTreeMap, time::Duration};
//!
//! # async fn run() -> Result<(), rabbitmq_manager::errors::AmqpError> {
//! let mut manager = RabbitMQApplicationManager::from_configs(RabbitMQConfigs::load()?)?;
//! manager.register_consumer("orders", handler_fn(|delivery| async move {
//!     println!("received {} bytes", delivery.payload.len());
//!     Ok(())
//! }));
//!
//! manager.startup().await?;
//! manager.publish("orders", b"hello".to_vec(), BTreeMap::new()).await?;
//! manager.shutdown(Duration::from_secs(10)).await;
//! # Ok(())
//! # }
//! ```

mod consumer;
mod otel;

#[cfg(test)]
mod mock_broker;

pub mod channel;
pub mod configs;
pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod headers;
pub mod manager;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;
pub mod transport;

pub use configs::RabbitMQConfigs;
pub use connection::ConnectionState;
pub use envelope::{InboundDelivery, OutboundEnvelope};
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, ConsumerHandler};
pub use headers::HeaderValue;
pub use manager::RabbitMQApplicationManager;
pub use publisher::RabbitMQPublisher;
pub use retry::RetryPolicy;
