// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes envelopes to the primary exchange with publisher confirms. An
//! attempt fails when the broker nacks, when the confirmation does not arrive
//! within the confirm timeout, or when no channel is available. Failed
//! attempts are retried with the shared backoff; once the retries are used up
//! the envelope is sent to the dead-letter exchange with an
//! `x-failure-reason` header and the caller gets `AmqpError::PublishExhausted`.
//!
//! Every retry reuses the same envelope, so the message id is stable across
//! attempts.

use crate::{
    connection::{ConnectionState, ConnectionSupervisor},
    envelope::OutboundEnvelope,
    errors::AmqpError,
    headers::HeaderValue,
    otel,
    retry::RetryPolicy,
    topology::PUBLISH_FAILED_ROUTING_KEY,
    transport::{BrokerChannel, Confirmation},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Source of the confirm-mode channel the publisher sends on.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Fails immediately when the broker connection is not usable.
    fn ensure_connected(&self) -> Result<(), AmqpError>;

    async fn publish_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

#[async_trait]
impl ChannelProvider for ConnectionSupervisor {
    fn ensure_connected(&self) -> Result<(), AmqpError> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(AmqpError::ConnectionClosed),
            state => Err(AmqpError::ConnectionError(format!(
                "broker connection is {:?}",
                state
            ))),
        }
    }

    async fn publish_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        ConnectionSupervisor::publish_channel(self).await
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AttemptOutcome {
    Pending,
    Confirmed,
    Failed(String),
}

/// One try at getting an envelope confirmed.
struct DeliveryAttempt<'a> {
    envelope: &'a OutboundEnvelope,
    number: u32,
    retry_at: Option<Instant>,
    outcome: AttemptOutcome,
}

impl<'a> DeliveryAttempt<'a> {
    fn first(envelope: &'a OutboundEnvelope) -> Self {
        DeliveryAttempt {
            envelope,
            number: 0,
            retry_at: None,
            outcome: AttemptOutcome::Pending,
        }
    }

    fn failure_reason(&self) -> &str {
        match &self.outcome {
            AttemptOutcome::Failed(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Debug for DeliveryAttempt<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryAttempt")
            .field("message_id", &self.envelope.message_id())
            .field("number", &self.number)
            .field("retry_at", &self.retry_at)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// Confirm-tracked publisher, safe to share between concurrent callers.
pub struct RabbitMQPublisher {
    provider: Arc<dyn ChannelProvider>,
    exchange: String,
    dead_letter_exchange: String,
    policy: RetryPolicy,
    confirm_timeout: Duration,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher
    ///
    /// # Parameters
    /// * `provider` - Hands out the shared confirm-mode channel
    /// * `exchange` - Exchange every message is published to
    /// * `dead_letter_exchange` - Receives messages whose attempts are exhausted
    /// * `policy` - Backoff and number of retries after the first attempt
    /// * `confirm_timeout` - Longest wait for a single broker confirmation
    ///
    /// # Returns
    /// A publisher that can be shared between tasks
    pub fn new(
        provider: Arc<dyn ChannelProvider>,
        exchange: &str,
        dead_letter_exchange: &str,
        policy: RetryPolicy,
        confirm_timeout: Duration,
    ) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            provider,
            exchange: exchange.to_owned(),
            dead_letter_exchange: dead_letter_exchange.to_owned(),
            policy,
            confirm_timeout,
        })
    }

    /// Upper bound on the time a publish call can take.
    pub fn worst_case_latency(&self) -> Duration {
        self.confirm_timeout * (self.policy.max_attempts() + 2) + self.policy.total_backoff()
    }

    /// Builds an envelope and publishes it.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: Vec<u8>,
        headers: BTreeMap<String, HeaderValue>,
    ) -> Result<(), AmqpError> {
        let envelope = OutboundEnvelope::new(routing_key, payload, headers)?;
        self.publish_envelope(envelope).await
    }

    /// Publishes `envelope` and waits for its confirmation, retrying with
    /// backoff. Returns `ConnectionError` without publishing when the broker
    /// connection is down at call time.
    pub async fn publish_envelope(&self, envelope: OutboundEnvelope) -> Result<(), AmqpError> {
        self.provider.ensure_connected().inspect_err(|err| {
            warn!(
                error = err.to_string(),
                message_id = envelope.message_id(),
                "refusing to publish while disconnected"
            );
        })?;

        let mut headers = envelope.headers().clone();
        otel::inject(&Context::current(), &mut headers);
        let envelope = envelope.with_headers(headers);

        let started = Instant::now();
        let mut attempt = DeliveryAttempt::first(&envelope);

        loop {
            attempt.outcome = self.try_publish(&envelope).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if attempt.outcome == AttemptOutcome::Confirmed {
                info!(
                    message_id = envelope.message_id(),
                    attempt = attempt.number,
                    elapsed_ms,
                    "message confirmed"
                );
                return Ok(());
            }

            warn!(
                message_id = envelope.message_id(),
                attempt = attempt.number,
                elapsed_ms,
                reason = attempt.failure_reason(),
                "publish attempt failed"
            );

            if self.policy.is_exhausted(attempt.number) {
                break;
            }

            let delay = self.policy.next_delay(attempt.number);
            attempt.retry_at = Some(Instant::now() + delay);
            debug!(
                message_id = envelope.message_id(),
                attempt = attempt.number,
                delay_ms = delay.as_millis() as u64,
                "scheduling publish retry"
            );
            sleep(delay).await;

            attempt.number += 1;
            attempt.outcome = AttemptOutcome::Pending;
        }

        self.dead_letter(&attempt).await;

        Err(AmqpError::PublishExhausted {
            message_id: envelope.message_id().to_owned(),
            attempts: attempt.number + 1,
        })
    }

    async fn try_publish(&self, envelope: &OutboundEnvelope) -> AttemptOutcome {
        let attempt = async {
            let channel = self.provider.publish_channel().await?;
            channel
                .publish(&self.exchange, envelope.routing_key(), envelope)
                .await
        };

        match timeout(self.confirm_timeout, attempt).await {
            Ok(Ok(Confirmation::Ack)) => AttemptOutcome::Confirmed,
            Ok(Ok(Confirmation::Nack)) => AttemptOutcome::Failed("broker nack".to_owned()),
            Ok(Err(err)) => AttemptOutcome::Failed(err.to_string()),
            Err(_) => AttemptOutcome::Failed(format!(
                "confirmation timed out after {}ms",
                self.confirm_timeout.as_millis()
            )),
        }
    }

    /// Sends the exhausted envelope to the dead-letter exchange. Failures are
    /// logged; the caller already gets `PublishExhausted`.
    async fn dead_letter(&self, attempt: &DeliveryAttempt<'_>) {
        let envelope = attempt.envelope;
        let mut headers = envelope.headers().clone();
        headers.failure_reason = Some(attempt.failure_reason().to_owned());
        headers.original_routing_key = Some(envelope.routing_key().to_owned());
        let dead = envelope.clone().with_headers(headers);

        error!(
            message_id = envelope.message_id(),
            attempts = attempt.number + 1,
            "too many attempts, sending to dlq"
        );

        let publish = async {
            let channel = self.provider.publish_channel().await?;
            channel
                .publish(&self.dead_letter_exchange, PUBLISH_FAILED_ROUTING_KEY, &dead)
                .await
        };

        match timeout(self.confirm_timeout, publish).await {
            Ok(Ok(Confirmation::Ack)) => {}
            Ok(Ok(Confirmation::Nack)) => {
                error!(message_id = envelope.message_id(), "dlq publish was nacked");
            }
            Ok(Err(err)) => {
                error!(
                    error = err.to_string(),
                    message_id = envelope.message_id(),
                    "error while sending to dlq"
                );
            }
            Err(_) => {
                error!(message_id = envelope.message_id(), "dlq publish was not confirmed");
            }
        }
    }
}
