// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the exchanges, queues and bindings the application manager relies
//! on. For every registered queue the topology contains:
//!
//! - a dead-letter queue `<queue>.dlq` bound to the dead-letter exchange,
//! - the primary queue bound to the primary exchange, carrying the message
//!   TTL and pointing its own dead-letter target at the dead-letter exchange,
//! - one holding queue per retry tier, `<queue>.retry.<tier>`, whose TTL is
//!   the backoff delay of that tier and which dead-letters back into the
//!   primary queue through the default exchange.
//!
//! Publishes that exhaust their retries land in
//! `<dead-letter-exchange>.publish-failed`.
//!
//! Declaration is idempotent. Redeclaring an object with different arguments
//! is rejected by the broker and surfaces as `AmqpError::ConfigurationError`.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, DEFAULT_EXCHANGE},
    queue::{QueueBinding, QueueDefinition},
    retry::RetryPolicy,
    transport::BrokerChannel,
};
use async_trait::async_trait;
use tracing::{debug, error};

/// Routing key of publishes dead-lettered by the publisher
pub const PUBLISH_FAILED_ROUTING_KEY: &str = "publish-failed";

pub fn dead_letter_queue_name(queue: &str) -> String {
    format!("{}.dlq", queue)
}

pub fn retry_queue_name(queue: &str, tier: u32) -> String {
    format!("{}.retry.{}", queue, tier)
}

pub fn publish_failed_queue_name(dead_letter_exchange: &str) -> String {
    format!("{}.{}", dead_letter_exchange, PUBLISH_FAILED_ROUTING_KEY)
}

/// Something that can be declared on a broker channel.
#[async_trait]
pub trait Topology: Send + Sync {
    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError>;
}

/// Exchange, queue and dead-letter layout of the application.
///
/// Immutable once built; shared between startup and reconnects.
#[derive(Debug, Clone)]
pub struct AmqpTopology {
    exchange: String,
    dead_letter_exchange: String,
    message_ttl: Option<u32>,
    durable: bool,
    policy: RetryPolicy,
    queues: Vec<QueueDefinition>,
}

impl AmqpTopology {
    pub fn new(cfg: &RabbitMQConfigs) -> Result<AmqpTopology, AmqpError> {
        Ok(AmqpTopology {
            exchange: cfg.exchange.clone(),
            dead_letter_exchange: cfg.dead_letter_exchange.clone(),
            message_ttl: (cfg.message_ttl_ms > 0).then_some(cfg.message_ttl_ms),
            durable: cfg.durable,
            policy: cfg.retry_policy()?,
            queues: vec![],
        })
    }

    /// Adds a primary queue to the topology.
    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.retain(|q| q.name != def.name);
        self.queues.push(def);
        self
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange
    }

    pub fn dead_letter_exchange_name(&self) -> &str {
        &self.dead_letter_exchange
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn primary_exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange)
            .direct()
            .durable_if(self.durable)
    }

    pub fn dead_letter_exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.dead_letter_exchange)
            .direct()
            .durable_if(self.durable)
    }

    /// The registered queue with its dead-letter target and TTL filled in.
    pub fn primary_queue(&self, def: &QueueDefinition) -> QueueDefinition {
        let mut queue = def
            .clone()
            .durable_if(self.durable || def.durable)
            .dead_letter(&self.dead_letter_exchange, &def.name);

        if queue.ttl.is_none() {
            queue.ttl = self.message_ttl;
        }
        queue
    }

    pub fn dead_letter_queue(&self, queue: &str) -> QueueDefinition {
        QueueDefinition::new(&dead_letter_queue_name(queue)).durable_if(self.durable)
    }

    /// Holding queues, one per retry tier, each delaying by the backoff of
    /// its tier before handing the message back to `queue`.
    pub fn retry_queues(&self, queue: &str) -> Vec<QueueDefinition> {
        (0..self.policy.max_attempts())
            .map(|tier| {
                let ttl = u32::try_from(self.policy.next_delay(tier).as_millis()).unwrap_or(u32::MAX);

                QueueDefinition::new(&retry_queue_name(queue, tier))
                    .durable_if(self.durable)
                    .ttl(ttl)
                    .dead_letter(DEFAULT_EXCHANGE, queue)
            })
            .collect()
    }

    fn publish_failed_queue(&self) -> QueueDefinition {
        QueueDefinition::new(&publish_failed_queue_name(&self.dead_letter_exchange))
            .durable_if(self.durable)
    }

    async fn declare_exchange(
        &self,
        channel: &dyn BrokerChannel,
        def: &ExchangeDefinition,
    ) -> Result<(), AmqpError> {
        channel.declare_exchange(def).await.inspect_err(|err| {
            error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
        })?;

        debug!("exchange: {} was created", def.name());
        Ok(())
    }

    async fn declare_bound_queue(
        &self,
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.declare_queue(channel, def).await?;

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            def.name, exchange, routing_key
        );

        channel
            .bind_queue(
                &QueueBinding::new(&def.name)
                    .exchange(exchange)
                    .routing_key(routing_key),
            )
            .await
            .inspect_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
            })
    }

    async fn declare_queue(
        &self,
        channel: &dyn BrokerChannel,
        def: &QueueDefinition,
    ) -> Result<(), AmqpError> {
        channel.declare_queue(def).await.inspect_err(|err| {
            error!(error = err.to_string(), name = def.name(), "error to declare the queue");
        })?;

        debug!("queue: {} was created", def.name);
        Ok(())
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    /// Declares, in order: the dead-letter exchange, the dead-letter queues,
    /// the primary exchange, the primary queues and their retry tiers.
    async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.declare_exchange(channel, &self.dead_letter_exchange())
            .await?;

        self.declare_bound_queue(
            channel,
            &self.publish_failed_queue(),
            &self.dead_letter_exchange,
            PUBLISH_FAILED_ROUTING_KEY,
        )
        .await?;

        for def in &self.queues {
            self.declare_bound_queue(
                channel,
                &self.dead_letter_queue(&def.name),
                &self.dead_letter_exchange,
                &def.name,
            )
            .await?;
        }

        self.declare_exchange(channel, &self.primary_exchange())
            .await?;

        for def in &self.queues {
            self.declare_bound_queue(
                channel,
                &self.primary_queue(def),
                &self.exchange,
                def.binding_key(),
            )
            .await?;

            for retry in self.retry_queues(&def.name) {
                self.declare_queue(channel, &retry).await?;
            }
        }

        debug!("topology was declared");
        Ok(())
    }
}
