// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Processes a single delivery: runs the registered handler inside a consumer
//! span and settles the delivery according to the outcome.
//!
//! - handler success: the delivery is acknowledged;
//! - handler failure with retries left: a copy carrying `x-retry-count + 1`
//!   is published to the holding queue of the current tier, and the original
//!   is acknowledged only after the broker confirmed the copy;
//! - retries exhausted: the delivery is published to the dead-letter exchange
//!   with `x-failure-reason` set, then acknowledged.
//!
//! If the hand-off publish is not confirmed within the confirm timeout the
//! original is negatively acknowledged with requeue, so a message is never
//! dropped and the slot never waits on the broker for good.

use crate::{
    dispatcher::ConsumerDefinition,
    envelope::{InboundDelivery, OutboundEnvelope},
    errors::{AmqpError, HandlerError},
    exchange::DEFAULT_EXCHANGE,
    otel,
    topology::retry_queue_name,
    transport::{BrokerChannel, Confirmation},
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Consumes and settles one delivery from `def.queue`.
///
/// Every path ends with the delivery acked or nacked on `channel`, except a
/// failing ack itself, which leaves the delivery to be redelivered when the
/// channel closes.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: InboundDelivery,
    def: &ConsumerDefinition,
    channel: &dyn BrokerChannel,
) -> Result<(), AmqpError> {
    let retry_count = delivery.retry_count();
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, def.queue_name());

    debug!(
        queue = def.queue_name(),
        delivery_tag = delivery.delivery_tag,
        retry_count,
        redelivered = delivery.redelivered,
        "received message"
    );

    let result = AssertUnwindSafe(def.handler.exec(&ctx, &delivery))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(HandlerError::new(panic_reason(panic.as_ref()))));

    let failure = match result {
        Ok(()) => {
            debug!("message successfully processed");
            return match channel.ack(delivery.delivery_tag).await {
                Err(err) => {
                    error!(error = err.to_string(), "error while ack msg");
                    span.record_error(&err);
                    span.set_status(Status::error("error to ack msg"));
                    Err(AmqpError::AckMessageError)
                }
                Ok(()) => {
                    span.set_status(Status::Ok);
                    Ok(())
                }
            };
        }
        Err(failure) => failure,
    };

    span.record_error(&failure);

    if !def.policy.is_exhausted(retry_count) {
        warn!(
            reason = %failure.reason,
            retry_count, "error while handling msg, requeuing for later"
        );

        let tier = retry_queue_name(def.queue_name(), retry_count);
        let mut headers = delivery.headers.clone();
        headers.retry_count = retry_count + 1;
        let copy = delivery.to_envelope(&tier, headers);

        let handed_off = hand_off(channel, DEFAULT_EXCHANGE, &tier, &copy, def.confirm_timeout).await;
        return settle(channel, &delivery, handed_off, &mut span, AmqpError::RequeuingMessageError).await;
    }

    error!(
        reason = %failure.reason,
        retry_count, "too many attempts, sending to dlq"
    );

    let mut headers = delivery.headers.clone();
    headers.failure_reason = Some(failure.reason.clone());
    let copy = delivery.to_envelope(def.queue_name(), headers);

    let handed_off = hand_off(
        channel,
        &def.dead_letter_exchange,
        def.queue_name(),
        &copy,
        def.confirm_timeout,
    )
    .await;
    settle(channel, &delivery, handed_off, &mut span, AmqpError::PublishingToDLQError).await
}

async fn hand_off(
    channel: &dyn BrokerChannel,
    exchange: &str,
    routing_key: &str,
    envelope: &OutboundEnvelope,
    confirm_timeout: Duration,
) -> bool {
    match timeout(confirm_timeout, channel.publish(exchange, routing_key, envelope)).await {
        Ok(Ok(Confirmation::Ack)) => true,
        Ok(Ok(Confirmation::Nack)) => {
            warn!(exchange, routing_key, "broker refused the message");
            false
        }
        Ok(Err(err)) => {
            error!(error = err.to_string(), exchange, routing_key, "error while publishing msg");
            false
        }
        Err(_) => {
            warn!(
                exchange,
                routing_key,
                timeout_ms = confirm_timeout.as_millis() as u64,
                "publisher confirm timed out"
            );
            false
        }
    }
}

/// Acks the original once its copy is confirmed, otherwise puts it back on
/// the queue.
async fn settle(
    channel: &dyn BrokerChannel,
    delivery: &InboundDelivery,
    handed_off: bool,
    span: &mut impl Span,
    hand_off_error: AmqpError,
) -> Result<(), AmqpError> {
    if !handed_off {
        span.set_status(Status::error(Cow::from(hand_off_error.to_string())));

        if let Err(err) = channel.nack(delivery.delivery_tag, true).await {
            error!(error = err.to_string(), "error while nack msg");
            return Err(AmqpError::NackMessageError);
        }
        return Err(hand_off_error);
    }

    if let Err(err) = channel.ack(delivery.delivery_tag).await {
        error!(error = err.to_string(), "error while ack msg");
        span.set_status(Status::error("error to ack msg"));
        return Err(AmqpError::AckMessageError);
    }

    span.set_status(Status::error("message handling failed"));
    Ok(())
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());

    format!("handler panicked: {}", message)
}
