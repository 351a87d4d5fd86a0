// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! lapin-backed implementation of the transport traits. `LapinConnector`
//! establishes connections to the RabbitMQ server, `LapinConnection` hands out
//! channels and reports connection loss, and `LapinChannel` maps each
//! transport operation onto the matching AMQP method.

use crate::{
    configs::BrokerEndpoint,
    envelope::{InboundDelivery, OutboundEnvelope},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::MessageHeaders,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, BrokerConnection, BrokerConnector, Confirmation, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm,
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinConnector;

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn connect(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!(host = endpoint.host, port = endpoint.port, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(endpoint.connection_name.clone()));

        let conn = match Connection::connect_uri(endpoint.uri(), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let lost = Arc::new(Notify::new());
        let notify = lost.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            notify.notify_one();
        });

        Ok(Arc::new(LapinConnection { conn, lost }))
    }
}

/// A lapin connection plus the signal raised by its error callback.
pub struct LapinConnection {
    conn: Connection,
    lost: Arc<Notify>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel_id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    async fn closed(&self) {
        if !self.conn.status().connected() {
            return;
        }
        self.lost.notified().await;
    }

    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}

/// A lapin channel.
pub struct LapinChannel {
    channel: Channel,
}

/// Broker refusals are configuration problems; anything else is the channel.
fn declaration_error(err: lapin::Error, name: &str) -> AmqpError {
    error!(error = err.to_string(), name, "error to declare");
    match err {
        lapin::Error::ProtocolError(_) => {
            AmqpError::ConfigurationError(format!("`{}` rejected: {}", name, err))
        }
        other => AmqpError::ChannelError(other.to_string()),
    }
}

fn to_inbound(queue: &str, delivery: Delivery) -> InboundDelivery {
    let props = &delivery.properties;

    InboundDelivery {
        delivery_tag: delivery.delivery_tag,
        queue: queue.to_owned(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        message_id: props.message_id().as_ref().map(|v| v.to_string()),
        kind: props.kind().as_ref().map(|v| v.to_string()),
        content_type: props.content_type().as_ref().map(|v| v.to_string()),
        headers: MessageHeaders::from_field_table(props.headers().as_ref()),
        payload: delivery.data,
    }
}

fn properties(envelope: &OutboundEnvelope) -> BasicProperties {
    let props = BasicProperties::default()
        .with_content_type(ShortString::from(envelope.content_type()))
        .with_message_id(ShortString::from(envelope.message_id()))
        .with_timestamp(envelope.created_at().timestamp().max(0) as u64)
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(envelope.headers().to_field_table());

    match envelope.kind() {
        Some(kind) => props.with_type(ShortString::from(kind)),
        None => props,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        self.channel
            .exchange_declare(
                &def.name,
                (&def.kind).into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map_err(|err| declaration_error(err, &def.name))
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| declaration_error(err, &def.name))
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| declaration_error(err, &binding.queue_name))
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &OutboundEnvelope,
    ) -> Result<Confirmation, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                envelope.payload(),
                properties(envelope),
            )
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        match confirm.await {
            Ok(publisher_confirm::Confirmation::Nack(_)) => Ok(Confirmation::Nack),
            Ok(_) => Ok(Confirmation::Ack),
            Err(err) => Err(AmqpError::ChannelError(err.to_string())),
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::ConsumerError(err.to_string())
            })?;

        let queue = queue.to_owned();
        Ok(consumer
            .map(move |result| {
                result
                    .map(|delivery| to_inbound(&queue, delivery))
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error while nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}
