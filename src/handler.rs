// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Business logic registered on a queue. A handler returns `Ok(())` to have
//! the delivery acknowledged; any `HandlerError`, or a panic, sends the
//! delivery through the retry tiers and finally to the dead-letter queue.

use crate::{envelope::InboundDelivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, sync::Arc};

/// Processes deliveries from one queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// `ctx` carries the trace context extracted from the message headers.
    async fn exec(&self, ctx: &Context, delivery: &InboundDelivery) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into a [`ConsumerHandler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps `f` as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(InboundDelivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for HandlerFn<F>
where
    F: Fn(InboundDelivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, delivery: &InboundDelivery) -> Result<(), HandlerError> {
        (self.f)(delivery.clone()).await
    }
}
