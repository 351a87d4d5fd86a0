// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! `ConnectionSupervisor` owns the broker connection. It connects with the
//! shared retry policy, watches the transport for connection loss, reconnects
//! in the background, and hands out channels to the publisher and the
//! consumer slots.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected (loss) -> Connecting ...
//!                                   \-> Closed (explicit close only)
//! ```

use crate::{
    configs::BrokerEndpoint,
    errors::AmqpError,
    retry::RetryPolicy,
    topology::Topology,
    transport::{BrokerChannel, BrokerConnection, BrokerConnector},
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

/// Lifecycle state of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn BrokerConnector>,
    endpoint: BrokerEndpoint,
    policy: RetryPolicy,
    connect_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    connection: RwLock<Option<Arc<dyn BrokerConnection>>>,
    publish_channel: tokio::sync::Mutex<Option<Arc<dyn BrokerChannel>>>,
    topology: Mutex<Option<Arc<dyn Topology>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    /// Creates a disconnected supervisor
    ///
    /// # Parameters
    /// * `connector` - Opens transport connections
    /// * `endpoint` - Broker to connect to
    /// * `policy` - Backoff between connection attempts
    /// * `connect_timeout` - Longest wait for a connection, and for the
    ///   topology declaration that follows a reconnect
    ///
    /// # Returns
    /// The supervisor, shared with the publisher and the consumer slots
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        endpoint: BrokerEndpoint,
        policy: RetryPolicy,
        connect_timeout: Duration,
    ) -> Arc<ConnectionSupervisor> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionSupervisor {
            connector,
            endpoint,
            policy,
            connect_timeout,
            state,
            connection: RwLock::new(None),
            publish_channel: tokio::sync::Mutex::new(None),
            topology: Mutex::new(None),
            watcher: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Topology to declare again after every reconnect.
    pub fn redeclare_on_reconnect(&self, topology: Arc<dyn Topology>) {
        if let Ok(mut guard) = self.topology.lock() {
            *guard = Some(topology);
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            // Closed is terminal.
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            debug!(from = ?current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    /// Connects, retrying with backoff up to the policy's max attempts. The
    /// last failure is returned once the attempts are exhausted.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        if self.state() == ConnectionState::Closed {
            return Err(AmqpError::ConnectionClosed);
        }

        let mut attempt = 0;
        loop {
            self.set_state(ConnectionState::Connecting);

            match self.open().await {
                Ok(conn) => {
                    self.install(conn.clone()).await;
                    self.spawn_watcher(conn);
                    info!(attempt, "amqp connection established");
                    return Ok(());
                }
                Err(err) => {
                    self.set_state(ConnectionState::Disconnected);

                    if self.policy.is_exhausted(attempt) {
                        error!(error = err.to_string(), attempt, "giving up connecting to the broker");
                        return Err(err);
                    }

                    let delay = self.policy.next_delay(attempt);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn open(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        match timeout(self.connect_timeout, self.connector.connect(&self.endpoint)).await {
            Ok(result) => result,
            Err(_) => Err(AmqpError::ConnectionError(format!(
                "connect timed out after {:?}",
                self.connect_timeout
            ))),
        }
    }

    async fn install(&self, conn: Arc<dyn BrokerConnection>) {
        {
            let mut guard = self.connection.write().await;
            *guard = Some(conn.clone());
        }
        *self.publish_channel.lock().await = None;

        self.set_state(ConnectionState::Connected);

        if self.state() == ConnectionState::Closed {
            let _ = conn.close().await;
        }
    }

    fn spawn_watcher(self: &Arc<Self>, conn: Arc<dyn BrokerConnection>) {
        let supervisor = self.clone();
        let handle = tokio::spawn(async move { supervisor.watch(conn).await });

        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(previous) = watcher.replace(handle) {
                previous.abort();
            }
        }
    }

    /// Waits for the transport to report the loss of the connection, then
    /// reconnects for as long as the supervisor is not closed.
    async fn watch(self: Arc<Self>, mut conn: Arc<dyn BrokerConnection>) {
        loop {
            conn.closed().await;

            if self.state() == ConnectionState::Closed {
                return;
            }

            warn!("amqp connection lost");
            self.set_state(ConnectionState::Disconnected);
            {
                let mut guard = self.connection.write().await;
                *guard = None;
            }
            *self.publish_channel.lock().await = None;

            let mut attempt: u32 = 0;
            conn = loop {
                if self.state() == ConnectionState::Closed {
                    return;
                }
                self.set_state(ConnectionState::Connecting);

                match self.reopen().await {
                    Ok(conn) => {
                        info!(attempt, "amqp connection re-established");
                        self.install(conn.clone()).await;
                        break conn;
                    }
                    Err(err) => {
                        self.set_state(ConnectionState::Disconnected);
                        let delay = self.policy.next_delay(attempt);
                        if err.is_transient() {
                            warn!(
                                error = err.to_string(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "failure to reconnect"
                            );
                        } else {
                            error!(
                                error = err.to_string(),
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "broker rejected the topology after reconnect"
                            );
                        }
                        sleep(delay).await;
                        attempt = attempt.saturating_add(1);
                    }
                }
            };
        }
    }

    /// Opens a connection and declares the topology on it. The declaration is
    /// bounded by the connect timeout; on failure the connection is closed.
    async fn reopen(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let conn = self.open().await?;

        let topology = self.topology.lock().ok().and_then(|guard| guard.clone());
        if let Some(topology) = topology {
            let declared =
                match timeout(self.connect_timeout, redeclare(conn.as_ref(), topology.as_ref())).await {
                    Ok(result) => result,
                    Err(_) => Err(AmqpError::ConnectionError(format!(
                        "topology declaration timed out after {:?}",
                        self.connect_timeout
                    ))),
                };

            if let Err(err) = declared {
                let _ = conn.close().await;
                return Err(err);
            }
        }

        Ok(conn)
    }

    /// The live connection, or an error when the supervisor is not connected.
    pub async fn connection(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        match self.state() {
            ConnectionState::Connected => {}
            ConnectionState::Closed => return Err(AmqpError::ConnectionClosed),
            state => {
                return Err(AmqpError::ConnectionError(format!(
                    "broker connection is {:?}",
                    state
                )))
            }
        }

        self.connection
            .read()
            .await
            .clone()
            .ok_or_else(|| AmqpError::ConnectionError("no broker connection".to_owned()))
    }

    /// Resolves with the connection once the supervisor is connected.
    pub async fn wait_connected(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => {
                    if let Ok(conn) = self.connection().await {
                        return Ok(conn);
                    }
                }
                ConnectionState::Closed => return Err(AmqpError::ConnectionClosed),
                _ => {}
            }

            if rx.changed().await.is_err() {
                return Err(AmqpError::ConnectionClosed);
            }
        }
    }

    /// Opens a new channel on the live connection.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.connection().await?;
        if !conn.is_connected() {
            return Err(AmqpError::ConnectionError("broker connection is not open".to_owned()));
        }
        conn.create_channel().await
    }

    /// Shared confirm-mode channel used for publishing. It is recreated when
    /// the previous one was closed or the connection was replaced.
    pub async fn publish_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let conn = self.connection().await?;
        let mut guard = self.publish_channel.lock().await;

        if let Some(channel) = guard.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        let channel = conn.create_channel().await?;
        channel.enable_confirms().await?;
        *guard = Some(channel.clone());

        Ok(channel)
    }

    /// Terminal close: stops the watcher and closes the connection. No
    /// reconnect is attempted afterwards.
    pub async fn close(&self) {
        self.set_state(ConnectionState::Closed);

        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                handle.abort();
            }
        }

        if let Some(channel) = self.publish_channel.lock().await.take() {
            let _ = channel.close().await;
        }

        let conn = self.connection.write().await.take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "error closing the amqp connection");
            }
        }

        info!("amqp connection closed");
    }
}

async fn redeclare(conn: &dyn BrokerConnection, topology: &dyn Topology) -> Result<(), AmqpError> {
    let channel = conn.create_channel().await?;
    let declared = topology.declare(channel.as_ref()).await;
    let _ = channel.close().await;
    declared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configs::RabbitMQConfigs, mock_broker::MockBroker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn supervisor(broker: &MockBroker, retries: u32) -> Arc<ConnectionSupervisor> {
        let cfg = RabbitMQConfigs {
            retry_count: retries,
            initial_retry_interval_ms: 100,
            max_retry_interval_ms: 1000,
            ..Default::default()
        };

        ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            cfg.endpoint(),
            cfg.retry_policy().unwrap(),
            cfg.connect_timeout(),
        )
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
        while *rx.borrow_and_update() != state {
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connects_after_transient_failures() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2);
        let supervisor = supervisor(&broker, 3);

        let started = tokio::time::Instant::now();
        supervisor.connect().await.unwrap();

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let broker = MockBroker::new();
        broker.set_unreachable(true);
        let supervisor = supervisor(&broker, 2);

        let result = supervisor.connect().await;

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn channels_fail_fast_while_disconnected() {
        let broker = MockBroker::new();
        let supervisor = supervisor(&broker, 1);

        assert!(matches!(
            supervisor.publish_channel().await,
            Err(AmqpError::ConnectionError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_connection_loss() {
        let broker = MockBroker::new();
        let supervisor = supervisor(&broker, 1);
        supervisor.connect().await.unwrap();
        let mut rx = supervisor.subscribe();

        broker.set_unreachable(true);
        broker.drop_connections();
        wait_for(&mut rx, ConnectionState::Disconnected).await;
        assert!(supervisor.channel().await.is_err());

        // Keeps retrying past the startup limit once serving.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(broker.connect_attempts() > 3);

        broker.set_unreachable(false);
        wait_for(&mut rx, ConnectionState::Connected).await;
        assert!(supervisor.publish_channel().await.is_ok());
        assert_eq!(broker.open_connections(), 1);
    }

    /// Never answers the first declaration, then succeeds.
    #[derive(Default)]
    struct StallOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Topology for StallOnce {
        async fn declare(&self, _channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                futures_util::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_redeclare_times_out_and_reconnects() {
        let broker = MockBroker::new();
        let supervisor = supervisor(&broker, 1);
        supervisor.connect().await.unwrap();

        let topology = Arc::new(StallOnce::default());
        supervisor.redeclare_on_reconnect(topology.clone());

        broker.drop_connections();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(supervisor.state(), ConnectionState::Connected);
        assert_eq!(topology.calls.load(Ordering::SeqCst), 2);
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_terminal() {
        let broker = MockBroker::new();
        let supervisor = supervisor(&broker, 1);
        supervisor.connect().await.unwrap();

        supervisor.close().await;
        broker.drop_connections();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(supervisor.state(), ConnectionState::Closed);
        assert_eq!(broker.connect_attempts(), 1);
        assert!(matches!(
            supervisor.connect().await,
            Err(AmqpError::ConnectionClosed)
        ));
        assert!(matches!(
            supervisor.channel().await,
            Err(AmqpError::ConnectionClosed)
        ));
    }
}
