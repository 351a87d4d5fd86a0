// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Application Manager
//!
//! Composition root of the messaging core. It is built once from a validated
//! [`RabbitMQConfigs`] and wires the connection supervisor, the topology, the
//! publisher and the consumer pool together.
//!
//! ```text
//! startup:  connect -> declare topology -> start consumers
//! shutdown: stop intake -> drain (until deadline) -> close connection
//! ```
//!
//! Any failure during startup is returned to the caller and the connection is
//! closed again; there is no partially started state.

use crate::{
    channel::LapinConnector,
    configs::RabbitMQConfigs,
    connection::{ConnectionState, ConnectionSupervisor},
    dispatcher::ConsumerPool,
    envelope::OutboundEnvelope,
    errors::AmqpError,
    handler::ConsumerHandler,
    headers::HeaderValue,
    publisher::RabbitMQPublisher,
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology},
    transport::BrokerConnector,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracing::{error, info, warn};

pub struct RabbitMQApplicationManager {
    configs: RabbitMQConfigs,
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Arc<RabbitMQPublisher>,
    pool: ConsumerPool,
}

impl RabbitMQApplicationManager {
    /// Validates `cfg` and builds the manager on top of `connector`. Nothing
    /// touches the network before [`startup`](Self::startup).
    ///
    /// # Parameters
    /// * `cfg` - Broker, topology and retry settings
    /// * `connector` - Opens the broker connections
    ///
    /// # Returns
    /// The manager, or a `ConfigurationError` when `cfg` is invalid
    pub fn new(
        cfg: RabbitMQConfigs,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<RabbitMQApplicationManager, AmqpError> {
        cfg.validate()?;
        let policy = cfg.retry_policy()?;

        let supervisor = ConnectionSupervisor::new(
            connector,
            cfg.endpoint(),
            policy,
            cfg.connect_timeout(),
        );

        let publisher = RabbitMQPublisher::new(
            supervisor.clone(),
            &cfg.exchange,
            &cfg.dead_letter_exchange,
            policy,
            cfg.publisher_confirm_timeout(),
        );

        let pool = ConsumerPool::new(supervisor.clone(), &cfg)?;

        Ok(RabbitMQApplicationManager {
            configs: cfg,
            supervisor,
            publisher,
            pool,
        })
    }

    /// Manager connected through lapin.
    pub fn from_configs(cfg: RabbitMQConfigs) -> Result<RabbitMQApplicationManager, AmqpError> {
        RabbitMQApplicationManager::new(cfg, Arc::new(LapinConnector))
    }

    /// Registers `handler` on `queue`, bound to the primary exchange with the
    /// queue name as routing key.
    pub fn register_consumer(&mut self, queue: &str, handler: Arc<dyn ConsumerHandler>) {
        self.register_queue(QueueDefinition::new(queue), handler);
    }

    /// Registers `handler` on a fully described queue.
    pub fn register_queue(&mut self, def: QueueDefinition, handler: Arc<dyn ConsumerHandler>) {
        self.pool.register(def, handler);
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.configs
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    /// Shared publisher for request handlers.
    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    fn topology(&self) -> Result<AmqpTopology, AmqpError> {
        Ok(self
            .pool
            .queues()
            .into_iter()
            .fold(AmqpTopology::new(&self.configs)?, |topology, queue| {
                topology.queue(queue)
            }))
    }

    pub async fn startup(&self) -> Result<(), AmqpError> {
        let started = self.start().await;

        if let Err(err) = &started {
            error!(error = err.to_string(), "amqp startup failed");
            self.pool.stop_intake();
            self.pool.drain(Duration::ZERO).await;
            self.supervisor.close().await;
        }

        started
    }

    async fn start(&self) -> Result<(), AmqpError> {
        let topology = Arc::new(self.topology()?);

        self.supervisor.connect().await?;

        let channel = self.supervisor.channel().await?;
        let declared = topology.declare(channel.as_ref()).await;
        let _ = channel.close().await;
        declared?;

        self.supervisor.redeclare_on_reconnect(topology);
        self.pool.start().await?;

        info!(
            app = %self.configs.app_name,
            publish_budget_ms = self.publisher.worst_case_latency().as_millis() as u64,
            "amqp application manager started"
        );
        Ok(())
    }

    /// Stops intake, waits up to `deadline` for in-flight handlers, then
    /// closes the connection. Deliveries still unacknowledged at that point
    /// go back to the broker.
    pub async fn shutdown(&self, deadline: Duration) {
        info!(deadline_ms = deadline.as_millis() as u64, "amqp shutdown requested");

        self.pool.stop_intake();
        if !self.pool.drain(deadline).await {
            warn!("in-flight deliveries released unacknowledged");
        }

        self.supervisor.close().await;
    }

    /// Publishes `payload` to the primary exchange with `routing_key`.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, HeaderValue>,
    ) -> Result<(), AmqpError> {
        self.publisher.publish(routing_key, payload, headers).await
    }

    pub async fn publish_json<T: Serialize>(
        &self,
        routing_key: &str,
        value: &T,
        headers: BTreeMap<String, HeaderValue>,
    ) -> Result<(), AmqpError> {
        let envelope = OutboundEnvelope::json(routing_key, value, headers)?;
        self.publisher.publish_envelope(envelope).await
    }
}
