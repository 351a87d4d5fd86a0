// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Headers
//!
//! Typed view over the AMQP header table. The messaging core owns a closed set
//! of fields (`x-retry-count`, `x-failure-reason` and the original routing key
//! of dead-lettered publishes); everything else is caller metadata carried in
//! an open map and validated at the boundary.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;

/// Retry counter maintained by the consumer pool
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Reason attached to a message when it is finally dead-lettered
pub const AMQP_HEADERS_FAILURE_REASON: &str = "x-failure-reason";
/// Routing key a dead-lettered publish was originally sent with
pub const AMQP_HEADERS_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Header the broker adds when it dead-letters a message
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";

const RESERVED_HEADERS: [&str; 4] = [
    AMQP_HEADERS_RETRY_COUNT,
    AMQP_HEADERS_FAILURE_REASON,
    AMQP_HEADERS_ORIGINAL_ROUTING_KEY,
    AMQP_HEADERS_X_DEATH,
];

/// Value of a caller-supplied header.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Str(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Str(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Str(v) => Some(v),
            _ => None,
        }
    }

    fn to_amqp(&self) -> AMQPValue {
        match self {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.clone())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        }
    }

    fn from_amqp(value: &AMQPValue) -> Option<HeaderValue> {
        match value {
            AMQPValue::LongString(v) => Some(HeaderValue::Str(
                String::from_utf8_lossy(v.as_bytes()).into_owned(),
            )),
            AMQPValue::ShortString(v) => Some(HeaderValue::Str(v.as_str().to_owned())),
            AMQPValue::Boolean(v) => Some(HeaderValue::Bool(*v)),
            AMQPValue::Double(v) => Some(HeaderValue::Float(*v)),
            AMQPValue::Float(v) => Some(HeaderValue::Float(f64::from(*v))),
            other => as_integer(other).map(HeaderValue::Int),
        }
    }
}

fn as_integer(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

/// Headers of a message, split into the fields owned by the messaging core and
/// caller metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageHeaders {
    pub retry_count: u32,
    pub failure_reason: Option<String>,
    pub original_routing_key: Option<String>,
    pub(crate) extra: BTreeMap<String, HeaderValue>,
}

impl MessageHeaders {
    /// Builds headers from caller metadata, rejecting reserved keys.
    pub fn from_metadata(
        metadata: BTreeMap<String, HeaderValue>,
    ) -> Result<MessageHeaders, AmqpError> {
        if let Some(key) = metadata
            .keys()
            .find(|key| RESERVED_HEADERS.contains(&key.to_lowercase().as_str()))
        {
            return Err(AmqpError::InvalidHeader(key.clone()));
        }

        Ok(MessageHeaders {
            extra: metadata,
            ..Default::default()
        })
    }

    pub fn metadata(&self) -> &BTreeMap<String, HeaderValue> {
        &self.extra
    }

    pub fn get(&self, key: &str) -> Option<&HeaderValue> {
        self.extra.get(key)
    }

    pub(crate) fn set(&mut self, key: &str, value: HeaderValue) {
        self.extra.insert(key.to_owned(), value);
    }

    pub fn to_field_table(&self) -> FieldTable {
        let mut btree: BTreeMap<ShortString, AMQPValue> = self
            .extra
            .iter()
            .map(|(key, value)| (ShortString::from(key.clone()), value.to_amqp()))
            .collect();

        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(i64::from(self.retry_count)),
        );

        if let Some(reason) = &self.failure_reason {
            btree.insert(
                ShortString::from(AMQP_HEADERS_FAILURE_REASON),
                AMQPValue::LongString(LongString::from(reason.clone())),
            );
        }

        if let Some(key) = &self.original_routing_key {
            btree.insert(
                ShortString::from(AMQP_HEADERS_ORIGINAL_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }

        FieldTable::from(btree)
    }

    /// Reads headers received from the broker. A missing or malformed retry
    /// count reads as 0; values without a scalar representation are dropped.
    pub fn from_field_table(table: Option<&FieldTable>) -> MessageHeaders {
        let mut headers = MessageHeaders::default();
        let Some(table) = table else {
            return headers;
        };

        for (key, value) in table.inner() {
            match key.as_str() {
                AMQP_HEADERS_RETRY_COUNT => {
                    headers.retry_count = as_integer(value)
                        .and_then(|v| u32::try_from(v).ok())
                        .unwrap_or_default();
                }
                AMQP_HEADERS_FAILURE_REASON => {
                    headers.failure_reason = HeaderValue::from_amqp(value)
                        .and_then(|v| v.as_str().map(str::to_owned));
                }
                AMQP_HEADERS_ORIGINAL_ROUTING_KEY => {
                    headers.original_routing_key = HeaderValue::from_amqp(value)
                        .and_then(|v| v.as_str().map(str::to_owned));
                }
                AMQP_HEADERS_X_DEATH => {}
                other => {
                    if let Some(value) = HeaderValue::from_amqp(value) {
                        headers.extra.insert(other.to_owned(), value);
                    }
                }
            }
        }

        headers
    }
}
