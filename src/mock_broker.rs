// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the transport traits for unit tests.
//!
//! It routes through direct and default exchanges, enforces per-channel
//! prefetch, expires messages from queues with a TTL into their dead-letter
//! target, requeues unacked deliveries when a channel closes, and lets tests
//! inject connection failures and missing confirmations.

use crate::{
    configs::BrokerEndpoint,
    envelope::{InboundDelivery, OutboundEnvelope},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind, DEFAULT_EXCHANGE},
    headers::MessageHeaders,
    queue::{QueueBinding, QueueDefinition},
    transport::{BrokerChannel, BrokerConnection, BrokerConnector, Confirmation, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub envelope: OutboundEnvelope,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    routing_key: String,
    envelope: OutboundEnvelope,
    redelivered: bool,
}

struct MockQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
}

struct MockConsumer {
    tag: String,
    queue: String,
    channel_id: u64,
    prefetch: u16,
    unacked: BTreeMap<u64, StoredMessage>,
    sender: Option<mpsc::UnboundedSender<Result<InboundDelivery, AmqpError>>>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MockQueue>,
    bindings: Vec<QueueBinding>,
    consumers: Vec<MockConsumer>,
    published: Vec<Published>,
    acked: Vec<(String, OutboundEnvelope)>,
    declarations: Vec<String>,
    prefetch: HashMap<u64, u16>,
    channel_owner: HashMap<u64, u64>,
    closed_channels: HashSet<u64>,
    max_unacked: HashMap<String, usize>,
    unconfirmed_exchanges: HashSet<String>,
    failing_connects: u32,
    unreachable: bool,
    connect_attempts: u32,
    connections: Vec<Arc<MockConnection>>,
    next_id: u64,
}

type Shared = Arc<Mutex<BrokerState>>;

#[derive(Clone, Default)]
pub(crate) struct MockBroker {
    state: Shared,
}

impl MockBroker {
    pub fn new() -> MockBroker {
        MockBroker::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_connects(&self, attempts: u32) {
        self.lock().failing_connects = attempts;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn never_confirm(&self, exchange: &str) {
        self.lock().unconfirmed_exchanges.insert(exchange.to_owned());
    }

    /// Simulates the transport dropping every open connection.
    pub fn drop_connections(&self) {
        let connections: Vec<Arc<MockConnection>> = {
            let mut state = self.lock();
            let connections = std::mem::take(&mut state.connections);
            for conn in &connections {
                conn.open.store(false, Ordering::SeqCst);
                close_connection_channels(&mut state, conn.id);
            }
            connections
        };

        for conn in connections {
            conn.lost.notify_one();
        }
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .iter()
            .filter(|c| c.open.load(Ordering::SeqCst))
            .count()
    }

    pub fn declarations(&self) -> Vec<String> {
        self.lock().declarations.clone()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_definition(&self, name: &str) -> Option<QueueDefinition> {
        self.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.lock().bindings.clone()
    }

    pub fn published_to(&self, exchange: &str) -> Vec<Published> {
        self.lock()
            .published
            .iter()
            .filter(|p| p.exchange == exchange)
            .cloned()
            .collect()
    }

    /// Messages waiting in `queue`, oldest first.
    pub fn ready(&self, queue: &str) -> Vec<OutboundEnvelope> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    pub fn acked(&self, queue: &str) -> Vec<OutboundEnvelope> {
        self.lock()
            .acked
            .iter()
            .filter(|(q, _)| q == queue)
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn active_consumers(&self, queue: &str) -> usize {
        self.lock()
            .consumers
            .iter()
            .filter(|c| c.queue == queue && c.sender.is_some())
            .count()
    }

    /// Highest number of unacked deliveries any single consumer held.
    pub fn max_unacked_per_consumer(&self) -> usize {
        self.lock().max_unacked.values().copied().max().unwrap_or_default()
    }

    /// Places a message straight into `queue` through the default exchange.
    pub fn enqueue(&self, queue: &str, envelope: OutboundEnvelope) {
        let mut state = self.lock();
        let _ = route(&self.state, &mut state, DEFAULT_EXCHANGE, queue, envelope, false);
        dispatch(&mut state);
    }
}

fn next_id(state: &mut BrokerState) -> u64 {
    state.next_id += 1;
    state.next_id
}

fn route(
    shared: &Shared,
    state: &mut BrokerState,
    exchange: &str,
    routing_key: &str,
    envelope: OutboundEnvelope,
    redelivered: bool,
) -> Result<(), AmqpError> {
    let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
        vec![routing_key.to_owned()]
    } else {
        let Some(def) = state.exchanges.get(exchange) else {
            return Err(AmqpError::ChannelError(format!("no exchange `{}`", exchange)));
        };
        let fanout = def.kind == ExchangeKind::Fanout;
        state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange && (fanout || b.routing_key == routing_key))
            .map(|b| b.queue_name.clone())
            .collect()
    };

    for target in targets {
        let id = next_id(state);
        let Some(queue) = state.queues.get_mut(&target) else {
            continue;
        };
        queue.ready.push_back(StoredMessage {
            id,
            routing_key: routing_key.to_owned(),
            envelope: envelope.clone(),
            redelivered,
        });

        if let Some(ttl) = queue.def.ttl {
            schedule_expiry(shared, target, id, Duration::from_millis(u64::from(ttl)));
        }
    }

    Ok(())
}

fn schedule_expiry(shared: &Shared, queue: String, id: u64, ttl: Duration) {
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        let mut state = shared.lock().unwrap();
        let Some(q) = state.queues.get_mut(&queue) else {
            return;
        };
        let Some(pos) = q.ready.iter().position(|m| m.id == id) else {
            return;
        };
        let expired = q.ready.remove(pos);
        let target = q.def.dead_letter.clone();

        if let (Some(msg), Some(target)) = (expired, target) {
            let _ = route(
                &shared,
                &mut state,
                &target.exchange,
                &target.routing_key,
                msg.envelope,
                false,
            );
        }
        dispatch(&mut state);
    });
}

fn dead_letter(shared: &Shared, state: &mut BrokerState, queue: &str, msg: StoredMessage) {
    let target = state.queues.get(queue).and_then(|q| q.def.dead_letter.clone());
    if let Some(target) = target {
        let _ = route(
            shared,
            state,
            &target.exchange,
            &target.routing_key,
            msg.envelope,
            false,
        );
    }
}

fn to_delivery(tag: u64, queue: &str, msg: &StoredMessage) -> InboundDelivery {
    let env = &msg.envelope;
    InboundDelivery {
        delivery_tag: tag,
        queue: queue.to_owned(),
        routing_key: msg.routing_key.clone(),
        redelivered: msg.redelivered,
        message_id: Some(env.message_id().to_owned()),
        kind: env.kind().map(str::to_owned),
        content_type: Some(env.content_type().to_owned()),
        payload: env.payload().to_vec(),
        headers: MessageHeaders::from_field_table(Some(&env.headers().to_field_table())),
    }
}

fn dispatch(state: &mut BrokerState) {
    loop {
        let mut progressed = false;

        for i in 0..state.consumers.len() {
            let consumer = &state.consumers[i];
            if consumer.sender.is_none() {
                continue;
            }
            if consumer.prefetch > 0 && consumer.unacked.len() >= usize::from(consumer.prefetch) {
                continue;
            }

            let queue_name = consumer.queue.clone();
            let Some(msg) = state
                .queues
                .get_mut(&queue_name)
                .and_then(|q| q.ready.pop_front())
            else {
                continue;
            };

            let tag = next_id(state);
            let consumer = &mut state.consumers[i];
            let sent = consumer
                .sender
                .as_ref()
                .map(|s| s.send(Ok(to_delivery(tag, &queue_name, &msg))).is_ok())
                .unwrap_or(false);

            if !sent {
                consumer.sender = None;
                if let Some(q) = state.queues.get_mut(&queue_name) {
                    q.ready.push_front(msg);
                }
                continue;
            }

            consumer.unacked.insert(tag, msg);
            let held = consumer.unacked.len();
            let max = state.max_unacked.entry(consumer.tag.clone()).or_default();
            *max = (*max).max(held);
            progressed = true;
        }

        if !progressed {
            return;
        }
    }
}

fn close_channel(state: &mut BrokerState, channel_id: u64) {
    state.closed_channels.insert(channel_id);

    let (closing, kept): (Vec<MockConsumer>, Vec<MockConsumer>) = std::mem::take(&mut state.consumers)
        .into_iter()
        .partition(|c| c.channel_id == channel_id);
    state.consumers = kept;

    for consumer in closing {
        if let Some(q) = state.queues.get_mut(&consumer.queue) {
            for (_, mut msg) in consumer.unacked.into_iter().rev() {
                msg.redelivered = true;
                q.ready.push_front(msg);
            }
        }
    }

    dispatch(state);
}

fn close_connection_channels(state: &mut BrokerState, connection_id: u64) {
    let channels: Vec<u64> = state
        .channel_owner
        .iter()
        .filter(|(_, owner)| **owner == connection_id)
        .map(|(channel, _)| *channel)
        .collect();

    for channel in channels {
        close_channel(state, channel);
    }
}

pub(crate) struct MockConnection {
    id: u64,
    broker: MockBroker,
    open: AtomicBool,
    lost: Notify,
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.unreachable {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let conn = Arc::new(MockConnection {
            id: next_id(&mut state),
            broker: self.clone(),
            open: AtomicBool::new(true),
            lost: Notify::new(),
        });
        state.connections.push(conn.clone());

        Ok(conn)
    }
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let mut state = self.broker.lock();
        let id = next_id(&mut state);
        state.channel_owner.insert(id, self.id);

        Ok(Arc::new(MockChannel {
            id,
            broker: self.broker.clone(),
        }))
    }

    async fn closed(&self) {
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        self.lost.notified().await;
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let mut state = self.broker.lock();
        state.connections.retain(|c| c.id != self.id);
        close_connection_channels(&mut state, self.id);
        Ok(())
    }
}

pub(crate) struct MockChannel {
    id: u64,
    broker: MockBroker,
}

impl MockChannel {
    fn open_state(&self) -> Result<std::sync::MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();
        if state.closed_channels.contains(&self.id) {
            return Err(AmqpError::ChannelError("channel is closed".to_owned()));
        }
        Ok(state)
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.declarations.push(format!("exchange:{}", def.name));

        match state.exchanges.get(&def.name) {
            Some(existing) if existing != def => Err(AmqpError::ConfigurationError(format!(
                "inequivalent arg for exchange `{}`",
                def.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(def.name.clone(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.declarations.push(format!("queue:{}", def.name));

        match state.queues.get(&def.name) {
            Some(existing) if existing.def != *def => Err(AmqpError::ConfigurationError(
                format!("inequivalent arg for queue `{}`", def.name),
            )),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    def.name.clone(),
                    MockQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(&binding.queue_name)
            || !state.exchanges.contains_key(&binding.exchange_name)
        {
            return Err(AmqpError::ConfigurationError(format!(
                "cannot bind `{}` to `{}`",
                binding.queue_name, binding.exchange_name
            )));
        }
        state
            .declarations
            .push(format!("bind:{}->{}", binding.exchange_name, binding.queue_name));
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.open_state().map(|_| ())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.prefetch.insert(self.id, count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &OutboundEnvelope,
    ) -> Result<Confirmation, AmqpError> {
        let stall = {
            let mut state = self.open_state()?;
            state.published.push(Published {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                envelope: envelope.clone(),
            });

            if state.unconfirmed_exchanges.contains(exchange) {
                true
            } else {
                route(
                    &self.broker.state,
                    &mut state,
                    exchange,
                    routing_key,
                    envelope.clone(),
                    false,
                )?;
                dispatch(&mut state);
                false
            }
        };

        if stall {
            futures_util::future::pending::<()>().await;
        }
        Ok(Confirmation::Ack)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(AmqpError::ConsumerError(format!("no queue `{}`", queue)));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let prefetch = state.prefetch.get(&self.id).copied().unwrap_or_default();
        state.consumers.push(MockConsumer {
            tag: consumer_tag.to_owned(),
            queue: queue.to_owned(),
            channel_id: self.id,
            prefetch,
            unacked: BTreeMap::new(),
            sender: Some(sender),
        });
        dispatch(&mut state);

        Ok(stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        let mut state = self.open_state().map_err(|_| AmqpError::AckMessageError)?;
        let found = state
            .consumers
            .iter_mut()
            .filter(|c| c.channel_id == self.id)
            .find_map(|c| c.unacked.remove(&delivery_tag).map(|m| (c.queue.clone(), m)));

        let Some((queue, msg)) = found else {
            return Err(AmqpError::AckMessageError);
        };
        state.acked.push((queue, msg.envelope));
        dispatch(&mut state);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        let mut state = self.open_state().map_err(|_| AmqpError::NackMessageError)?;
        let found = state
            .consumers
            .iter_mut()
            .filter(|c| c.channel_id == self.id)
            .find_map(|c| c.unacked.remove(&delivery_tag).map(|m| (c.queue.clone(), m)));

        let Some((queue, mut msg)) = found else {
            return Err(AmqpError::NackMessageError);
        };

        if requeue {
            msg.redelivered = true;
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_front(msg);
            }
        } else {
            dead_letter(&self.broker.state, &mut state, &queue, msg);
        }
        dispatch(&mut state);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        for consumer in state
            .consumers
            .iter_mut()
            .filter(|c| c.channel_id == self.id && c.tag == consumer_tag)
        {
            consumer.sender = None;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open_state().is_ok()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        close_channel(&mut state, self.id);
        Ok(())
    }
}
