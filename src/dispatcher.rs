// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Pool
//!
//! Runs the consumer slots of every registered queue. Each slot owns one
//! channel in confirm mode with its own prefetch limit and a single
//! subscription, and processes its deliveries one at a time. Slots survive
//! connection loss: when the subscription ends they wait for the supervisor to
//! reconnect and subscribe again.
//!
//! Shutdown happens in two steps. [`ConsumerPool::stop_intake`] cancels every
//! subscription right away, even while a handler is running, and
//! [`ConsumerPool::drain`] waits for the in-flight deliveries to be settled,
//! aborting whatever is still running when the deadline expires.

use crate::{
    configs::RabbitMQConfigs,
    connection::ConnectionSupervisor,
    consumer::consume,
    envelope::InboundDelivery,
    errors::AmqpError,
    handler::ConsumerHandler,
    queue::QueueDefinition,
    retry::RetryPolicy,
    transport::{BrokerChannel, DeliveryStream},
};
use futures_util::{future::join_all, StreamExt};
use opentelemetry::global::{self, BoxedTracer};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// A queue together with the handler processing its deliveries.
#[derive(Clone)]
pub struct ConsumerDefinition {
    pub(crate) queue: QueueDefinition,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) dead_letter_exchange: String,
    pub(crate) policy: RetryPolicy,
    pub(crate) confirm_timeout: Duration,
}

impl ConsumerDefinition {
    /// Creates a new consumer definition
    ///
    /// # Parameters
    /// * `queue` - Queue to consume from
    /// * `handler` - Handler invoked for every delivery
    /// * `dead_letter_exchange` - Exchange receiving exhausted deliveries
    /// * `policy` - Decides how many times a failing delivery is retried
    /// * `confirm_timeout` - Longest wait for the broker to confirm a retry or
    ///   dead-letter copy
    pub fn new(
        queue: QueueDefinition,
        handler: Arc<dyn ConsumerHandler>,
        dead_letter_exchange: &str,
        policy: RetryPolicy,
        confirm_timeout: Duration,
    ) -> Self {
        ConsumerDefinition {
            queue,
            handler,
            dead_letter_exchange: dead_letter_exchange.to_owned(),
            policy,
            confirm_timeout,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue.name
    }
}

type Subscription = (Arc<dyn BrokerChannel>, DeliveryStream);

pub struct ConsumerPool {
    supervisor: Arc<ConnectionSupervisor>,
    app_name: String,
    dead_letter_exchange: String,
    concurrent_consumers: u16,
    prefetch_count: u16,
    policy: RetryPolicy,
    confirm_timeout: Duration,
    definitions: Vec<Arc<ConsumerDefinition>>,
    stop: watch::Sender<bool>,
    slots: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerPool {
    /// Creates an empty consumer pool
    ///
    /// # Parameters
    /// * `supervisor` - Connection supervisor handing out consumer channels
    /// * `cfg` - Configs providing slot count, prefetch, retry and confirm settings
    ///
    /// # Returns
    /// The pool, or a `ConfigurationError` if the retry settings are invalid
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        cfg: &RabbitMQConfigs,
    ) -> Result<ConsumerPool, AmqpError> {
        let (stop, _) = watch::channel(false);

        Ok(ConsumerPool {
            supervisor,
            app_name: cfg.app_name.clone(),
            dead_letter_exchange: cfg.dead_letter_exchange.clone(),
            concurrent_consumers: cfg.concurrent_consumers.max(1),
            prefetch_count: cfg.prefetch_count,
            policy: cfg.retry_policy()?,
            confirm_timeout: cfg.publisher_confirm_timeout(),
            definitions: vec![],
            stop,
            slots: Mutex::new(vec![]),
        })
    }

    /// Registers `handler` for `queue`, replacing a previous registration of
    /// the same queue.
    pub fn register(&mut self, queue: QueueDefinition, handler: Arc<dyn ConsumerHandler>) {
        self.definitions.retain(|d| d.queue.name != queue.name);
        self.definitions.push(Arc::new(ConsumerDefinition::new(
            queue,
            handler,
            &self.dead_letter_exchange,
            self.policy,
            self.confirm_timeout,
        )));
    }

    pub fn queues(&self) -> Vec<QueueDefinition> {
        self.definitions.iter().map(|d| d.queue.clone()).collect()
    }

    /// Subscribes every slot. A slot that cannot subscribe fails the start,
    /// and the slots already running are told to stop.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut started = vec![];

        for def in &self.definitions {
            for index in 0..self.concurrent_consumers {
                let slot = ConsumerSlot {
                    tag: self.consumer_tag(def.queue_name(), index),
                    definition: def.clone(),
                    supervisor: self.supervisor.clone(),
                    prefetch_count: self.prefetch_count,
                    policy: self.policy,
                    stop: self.stop.subscribe(),
                };

                match slot.subscribe().await {
                    Ok(subscription) => {
                        started.push(tokio::spawn(slot.run(Some(subscription))));
                    }
                    Err(err) => {
                        error!(
                            error = err.to_string(),
                            queue = def.queue_name(),
                            "error to create the consumer"
                        );
                        self.stop_intake();
                        self.track(started);
                        return Err(err);
                    }
                }
            }

            info!(
                queue = def.queue_name(),
                consumers = self.concurrent_consumers,
                prefetch = self.prefetch_count,
                "consuming queue"
            );
        }

        self.track(started);
        Ok(())
    }

    fn track(&self, handles: Vec<JoinHandle<()>>) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.extend(handles);
        }
    }

    fn consumer_tag(&self, queue: &str, index: u16) -> String {
        if self.app_name.is_empty() {
            format!("{}-{}", queue, index)
        } else {
            format!("{}-{}-{}", self.app_name, queue, index)
        }
    }

    /// Asks every slot to cancel its subscription. Deliveries in flight are
    /// still settled.
    pub fn stop_intake(&self) {
        self.stop.send_replace(true);
    }

    /// Waits up to `deadline` for every slot to finish. Slots still running
    /// afterwards are aborted and their deliveries left unacknowledged.
    /// Returns whether all slots finished in time.
    pub async fn drain(&self, deadline: Duration) -> bool {
        let mut slots = match self.slots.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => return true,
        };

        if slots.is_empty() {
            return true;
        }

        let drained = timeout(deadline, join_all(slots.iter_mut())).await.is_ok();
        if !drained {
            warn!(
                deadline_ms = deadline.as_millis() as u64,
                "consumers did not drain in time, aborting"
            );
            for slot in &slots {
                slot.abort();
            }
        }

        drained
    }
}

struct ConsumerSlot {
    tag: String,
    definition: Arc<ConsumerDefinition>,
    supervisor: Arc<ConnectionSupervisor>,
    prefetch_count: u16,
    policy: RetryPolicy,
    stop: watch::Receiver<bool>,
}

impl ConsumerSlot {
    async fn subscribe(&self) -> Result<Subscription, AmqpError> {
        let channel = self.supervisor.channel().await?;

        match self.open_subscription(channel.as_ref()).await {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    async fn open_subscription(&self, channel: &dyn BrokerChannel) -> Result<DeliveryStream, AmqpError> {
        channel.enable_confirms().await?;
        channel.set_prefetch(self.prefetch_count).await?;
        channel
            .consume(self.definition.queue_name(), &self.tag)
            .await
    }

    /// Waits for a connection and subscribes again, backing off between
    /// failed attempts. `None` means the slot must stop.
    async fn resubscribe(&mut self) -> Option<Subscription> {
        let mut attempt: u32 = 0;

        loop {
            let connected = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return None,
                conn = self.supervisor.wait_connected() => conn,
            };
            if connected.is_err() {
                return None;
            }

            match self.subscribe().await {
                Ok(subscription) => {
                    info!(tag = %self.tag, attempt, "consumer subscribed again");
                    return Some(subscription);
                }
                Err(err) => {
                    let delay = self.policy.next_delay(attempt);
                    warn!(
                        error = err.to_string(),
                        tag = %self.tag,
                        delay_ms = delay.as_millis() as u64,
                        "failure to subscribe, retrying"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        biased;
                        _ = stopped(&mut self.stop) => return None,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn run(mut self, mut subscription: Option<Subscription>) {
        let tracer = global::tracer("amqp consumer");

        loop {
            let (channel, mut deliveries) = match subscription.take() {
                Some(subscription) => subscription,
                None => match self.resubscribe().await {
                    Some(subscription) => subscription,
                    None => break,
                },
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = stopped(&mut self.stop) => None,
                    item = deliveries.next() => Some(item),
                };

                match next {
                    None => {
                        self.cancel(channel.as_ref()).await;
                        self.finish(channel.as_ref()).await;
                        return;
                    }
                    Some(Some(Ok(delivery))) => {
                        if self.handle(&tracer, delivery, channel.as_ref()).await {
                            self.finish(channel.as_ref()).await;
                            return;
                        }
                    }
                    Some(Some(Err(err))) => {
                        error!(error = err.to_string(), tag = %self.tag, "errors consume msg");
                        break;
                    }
                    Some(None) => {
                        warn!(tag = %self.tag, "subscription ended");
                        break;
                    }
                }
            }

            let _ = channel.close().await;
        }

        debug!(tag = %self.tag, "consumer slot finished");
    }

    /// Processes one delivery while watching the stop flag. When the flag is
    /// raised the subscription is cancelled at once and the delivery is still
    /// settled. Returns whether the slot was asked to stop.
    async fn handle(
        &mut self,
        tracer: &BoxedTracer,
        delivery: InboundDelivery,
        channel: &dyn BrokerChannel,
    ) -> bool {
        let definition = self.definition.clone();
        let handling = consume(tracer, delivery, &definition, channel);
        tokio::pin!(handling);

        let settled = tokio::select! {
            biased;
            result = &mut handling => Some(result),
            _ = stopped(&mut self.stop) => None,
        };

        let (result, stopping) = match settled {
            Some(result) => (result, false),
            None => {
                self.cancel(channel).await;
                (handling.await, true)
            }
        };

        if let Err(err) = result {
            error!(error = err.to_string(), "error consume msg");
        }
        stopping
    }

    async fn cancel(&self, channel: &dyn BrokerChannel) {
        if let Err(err) = channel.cancel(&self.tag).await {
            warn!(error = err.to_string(), tag = %self.tag, "error to cancel the consumer");
        }
    }

    async fn finish(&self, channel: &dyn BrokerChannel) {
        let _ = channel.close().await;
        info!(tag = %self.tag, "consumer stopped");
    }
}

/// Resolves once the stop flag is raised or the pool is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    while !*stop.borrow_and_update() {
        if stop.changed().await.is_err() {
            return;
        }
    }
}
