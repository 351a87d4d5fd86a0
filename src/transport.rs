// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! The traits every component uses to talk to the broker. The production
//! implementation lives in [`crate::channel`] and is backed by lapin; tests
//! provide in-memory implementations.

use crate::{
    configs::BrokerEndpoint,
    envelope::{InboundDelivery, OutboundEnvelope},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries for one subscription. It ends when the subscription is
/// cancelled or the channel is closed.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Opens connections to a broker endpoint.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live broker connection that multiplexes channels.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// Resolves once the transport reports the connection as lost.
    async fn closed(&self);

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel on a broker connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Puts the channel in publisher confirm mode.
    async fn enable_confirms(&self) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries on the channel.
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &OutboundEnvelope,
    ) -> Result<Confirmation, AmqpError>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Stops a subscription; deliveries already received stay unacked.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), AmqpError>;
}
