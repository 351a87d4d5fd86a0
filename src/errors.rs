// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Messaging Core
//!
//! `AmqpError` is the error every broker-facing operation returns. Its variants
//! follow the failure taxonomy of the application manager: configuration errors
//! are fatal and never retried, connection errors are retried by the
//! supervisor, and publish exhaustion is surfaced to the caller once the
//! backoff sequence has run out.
//!
//! `HandlerError` is the error consumer handlers return for business-logic
//! failures; it never escapes the consumer pool except through the
//! dead-letter path.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid settings or a topology object the broker refused to redeclare
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The broker is unreachable or the connection dropped
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// The connection was closed through an explicit shutdown
    #[error("connection closed")]
    ConnectionClosed,

    /// Error creating or using a channel from an established connection
    #[error("channel error: {0}")]
    ChannelError(String),

    /// A publish failed confirmation on every attempt and was dead-lettered
    #[error("message `{message_id}` was not confirmed after {attempts} attempts")]
    PublishExhausted { message_id: String, attempts: u32 },

    /// Caller supplied a header that is reserved for the messaging core
    #[error("header `{0}` is reserved")]
    InvalidHeader(String),

    /// Error subscribing to or reading from a queue
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error handing a failed message to its retry tier
    #[error("failure to requeuing message")]
    RequeuingMessageError,

    /// Error publishing a message to the dead-letter exchange
    #[error("failure to publish to dlq")]
    PublishingToDLQError,

    /// Error serializing a payload
    #[error("failure to serialize payload: {0}")]
    SerializationError(String),
}

impl AmqpError {
    /// Whether the error is caused by the transport rather than by the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_)
        )
    }
}

/// Failure returned by a consumer handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct HandlerError {
    pub reason: String,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError {
            reason: reason.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(reason: String) -> Self {
        HandlerError { reason }
    }
}

impl From<&str> for HandlerError {
    fn from(reason: &str) -> Self {
        HandlerError::new(reason)
    }
}
