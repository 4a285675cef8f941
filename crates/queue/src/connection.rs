//! Broker connection lifecycle and automatic reconnection.
//!
//! [`ConnectionManager`] owns the single process-wide connection. Workers
//! open their own channels on it and watch [`ConnectionState`] to pause while
//! the transport is down and rebind once it is back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::backoff::Backoff;
use crate::broker::{BrokerChannel, BrokerConnection, Connector};
use crate::error::QueueError;

/// Lifecycle of the broker connection.
///
/// `Disconnected → Connecting → Connected → Draining → Closed`, with
/// `Connected → Disconnected` on transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Draining,
    Closed,
}

impl ConnectionState {
    /// Draining or closed: no reconnects, no new channels for consuming.
    pub fn is_shutting_down(self) -> bool {
        matches!(self, Self::Draining | Self::Closed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Passed to disconnect handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// 1 for the first disconnect, 2 for the second, ...
    pub sequence: u64,
}

type DisconnectHandler = Arc<dyn Fn(DisconnectEvent) + Send + Sync>;

/// Owns the broker connection and reconnects it with backoff.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    backoff: Backoff,
    state: watch::Sender<ConnectionState>,
    current: RwLock<Option<Arc<dyn BrokerConnection>>>,
    handlers: Mutex<Vec<DisconnectHandler>>,
    disconnects: AtomicU64,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Connect to the broker and start watching the connection.
    ///
    /// Fails with [`QueueError::Connection`] if the initial connect fails;
    /// only later losses are retried automatically.
    #[instrument(skip_all, fields(broker = %connector.describe()))]
    pub async fn connect(
        connector: Arc<dyn Connector>,
        backoff: Backoff,
    ) -> Result<Arc<Self>, QueueError> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let connection = connector.connect().await?;
        state.send_replace(ConnectionState::Connected);

        let manager = Arc::new(Self {
            connector,
            backoff,
            state,
            current: RwLock::new(Some(connection)),
            handlers: Mutex::new(Vec::new()),
            disconnects: AtomicU64::new(0),
            monitor: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::monitor(manager.clone()));
        *lock(&manager.monitor) = Some(handle);
        info!("connection manager started");
        Ok(manager)
    }

    /// Register a callback run once per disconnect event.
    ///
    /// Handlers run on the monitor task without any lock held, so they may
    /// register further handlers; those fire from the next event on.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(DisconnectEvent) + Send + Sync + 'static,
    {
        lock(&self.handlers).push(Arc::new(handler));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of disconnects observed so far.
    pub fn disconnect_count(&self) -> u64 {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Open a channel on the live connection.
    ///
    /// Fails with [`QueueError::NotConnected`] while the transport is down,
    /// including the window before the monitor has noticed the loss.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, QueueError> {
        let connection = self
            .current()
            .filter(|connection| connection.is_connected())
            .ok_or(QueueError::NotConnected)?;
        connection.create_channel().await
    }

    /// Wait until the connection is up.
    ///
    /// Returns [`QueueError::Closed`] if the manager starts shutting down
    /// instead.
    pub async fn wait_connected(&self) -> Result<(), QueueError> {
        let mut rx = self.state.subscribe();
        let reached = rx
            .wait_for(|s| *s == ConnectionState::Connected || s.is_shutting_down())
            .await
            .map(|s| *s)
            .map_err(|_| QueueError::Closed)?;
        if reached == ConnectionState::Connected {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }

    /// Enter `Draining`: the reconnect loop stops, existing channels keep
    /// working so in-flight messages can finish.
    pub fn begin_drain(&self) {
        let changed = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed || *s == ConnectionState::Draining {
                false
            } else {
                *s = ConnectionState::Draining;
                true
            }
        });
        if changed {
            info!("connection draining");
        }
    }

    /// Close the connection for good.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.begin_drain();

        let monitor = lock(&self.monitor).take();
        if let Some(handle) = monitor {
            handle.abort();
            let _ = handle.await;
        }

        let connection = write(&self.current).take();
        let result = match connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };
        self.state.send_replace(ConnectionState::Closed);
        info!("connection closed");
        result
    }

    fn current(&self) -> Option<Arc<dyn BrokerConnection>> {
        read(&self.current).clone()
    }

    /// Move to `next` unless the manager is shutting down.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_shutting_down() {
                false
            } else {
                *s = next;
                true
            }
        })
    }

    /// Resolves once the manager begins shutting down.
    async fn shutting_down(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| s.is_shutting_down()).await;
    }

    // ── Background monitor ──────────────────────────────────────────

    async fn monitor(self: Arc<Self>) {
        loop {
            let Some(connection) = self.current() else {
                return;
            };

            tokio::select! {
                _ = connection.closed() => {}
                _ = self.shutting_down() => return,
            }

            if !self.transition(ConnectionState::Disconnected) {
                return;
            }
            write(&self.current).take();
            self.notify_disconnect();

            if !self.reconnect().await {
                return;
            }
        }
    }

    fn notify_disconnect(&self) {
        let sequence = self.disconnects.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(sequence, "broker connection lost");
        let event = DisconnectEvent { sequence };
        let handlers = lock(&self.handlers).clone();
        for handler in handlers {
            handler(event);
        }
    }

    /// Retry until connected. Returns `false` if shutdown interrupted it.
    async fn reconnect(&self) -> bool {
        let mut attempt: u32 = 0;
        loop {
            if !self.transition(ConnectionState::Connecting) {
                return false;
            }

            match self.connector.connect().await {
                Ok(connection) => {
                    *write(&self.current) = Some(connection.clone());
                    if !self.transition(ConnectionState::Connected) {
                        write(&self.current).take();
                        let _ = connection.close().await;
                        return false;
                    }
                    info!(attempts = attempt + 1, "reconnected to broker");
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(attempt, delay = ?delay, error = %e, "reconnect failed, backing off");
                    attempt = attempt.saturating_add(1);
                    self.transition(ConnectionState::Disconnected);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutting_down() => return false,
                    }
                }
            }
        }
    }
}

// Poisoning only happens if a handler panicked; the guarded data stays valid.

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
