// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelopes
//!
//! `OutboundEnvelope` is what the publisher sends, `InboundDelivery` is what a
//! consumer slot hands to a handler.

use crate::{
    errors::AmqpError,
    headers::{HeaderValue, MessageHeaders},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for opaque payloads
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// An immutable message waiting to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    message_id: String,
    routing_key: String,
    payload: Vec<u8>,
    content_type: String,
    kind: Option<String>,
    headers: MessageHeaders,
    created_at: DateTime<Utc>,
}

impl OutboundEnvelope {
    /// Builds an envelope with a fresh message id. Caller metadata must not use
    /// reserved header keys.
    pub fn new(
        routing_key: &str,
        payload: Vec<u8>,
        metadata: BTreeMap<String, HeaderValue>,
    ) -> Result<OutboundEnvelope, AmqpError> {
        Ok(OutboundEnvelope {
            message_id: Uuid::new_v4().to_string(),
            routing_key: routing_key.to_owned(),
            payload,
            content_type: OCTET_STREAM_CONTENT_TYPE.to_owned(),
            kind: None,
            headers: MessageHeaders::from_metadata(metadata)?,
            created_at: Utc::now(),
        })
    }

    /// Builds an envelope whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(
        routing_key: &str,
        value: &T,
        metadata: BTreeMap<String, HeaderValue>,
    ) -> Result<OutboundEnvelope, AmqpError> {
        let payload = serde_json::to_vec(value)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))?;

        Ok(OutboundEnvelope::new(routing_key, payload, metadata)?.with_content_type(JSON_CONTENT_TYPE))
    }

    /// Keeps a caller supplied id instead of the generated one.
    pub fn with_message_id(mut self, message_id: &str) -> Self {
        if !message_id.is_empty() {
            self.message_id = message_id.to_owned();
        }
        self
    }

    pub fn with_kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn with_content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_owned();
        self
    }

    pub(crate) fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// A message received from a queue, owned by one consumer slot until it is
/// acked or nacked.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

impl InboundDelivery {
    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count
    }

    /// Copy of the delivery to be published again, keeping its message id so
    /// downstream consumers can detect redelivery.
    pub(crate) fn to_envelope(&self, routing_key: &str, headers: MessageHeaders) -> OutboundEnvelope {
        let mut envelope = OutboundEnvelope {
            message_id: self
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            routing_key: routing_key.to_owned(),
            payload: self.payload.clone(),
            content_type: self
                .content_type
                .clone()
                .unwrap_or_else(|| OCTET_STREAM_CONTENT_TYPE.to_owned()),
            kind: self.kind.clone(),
            headers,
            created_at: Utc::now(),
        };
        if envelope.content_type.is_empty() {
            envelope.content_type = OCTET_STREAM_CONTENT_TYPE.to_owned();
        }
        envelope
    }

    /// Deserializes a JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.payload)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }
}
