use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Broker, BrokerError, Channel, Connection};

const RETRY_PAUSE: Duration = Duration::from_secs(1);

struct PooledConnection {
    conn: Arc<dyn Connection>,
    // Fine-grained: each connection's closed flag has its own lock so the
    // monitor never stalls a pool-wide scan.
    closed: Arc<StdMutex<bool>>,
}

impl PooledConnection {
    fn is_closed(&self) -> bool {
        *self.closed.lock().expect("closed flag lock poisoned")
    }
}

/// Self-healing pool of `size` broker connections.
///
/// Every connection gets a dedicated monitor task that blocks on the
/// broker-side close notification; acquisition replenishes the pool back to
/// `size` before handing out a channel.
pub struct ConnectionPool {
    broker: Arc<dyn Broker>,
    size: usize,
    connections: Mutex<Vec<PooledConnection>>,
    shutdown: CancellationToken,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create the pool with exactly `size` live connections. Any failure
    /// during initial fill is returned to the caller.
    pub async fn connect(broker: Arc<dyn Broker>, size: usize) -> Result<Self, BrokerError> {
        let pool = Self {
            broker,
            size,
            connections: Mutex::new(Vec::with_capacity(size)),
            shutdown: CancellationToken::new(),
            monitors: Mutex::new(Vec::with_capacity(size)),
        };
        debug!(pool_size = size, "initializing broker connection pool");
        {
            let mut connections = pool.connections.lock().await;
            let mut monitors = pool.monitors.lock().await;
            for _ in 0..size {
                let (pooled, monitor) = pool.new_connection().await?;
                connections.push(pooled);
                monitors.push(monitor);
            }
        }
        Ok(pool)
    }

    async fn new_connection(&self) -> Result<(PooledConnection, JoinHandle<()>), BrokerError> {
        let conn = Arc::from(self.broker.connect().await?);
        let pooled = PooledConnection {
            conn: Arc::clone(&conn),
            closed: Arc::new(StdMutex::new(false)),
        };
        let closed = Arc::clone(&pooled.closed);
        let token = self.shutdown.clone();
        let monitor = tokio::spawn(async move {
            tokio::select! {
                _ = conn.closed() => {
                    warn!("broker connection closed by remote side");
                    *closed.lock().expect("closed flag lock poisoned") = true;
                }
                _ = token.cancelled() => {}
            }
            conn.close().await;
        });
        Ok((pooled, monitor))
    }

    /// Open a channel on a randomly chosen live connection, replenishing the
    /// pool first if connections were lost.
    pub async fn channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        let conn = self.active_connection().await?;
        conn.open_channel().await
    }

    /// High-availability variant: retry until a channel is available or the
    /// deadline expires. Expiry distinguishes a hard outage from transient
    /// unavailability and is fatal for the caller.
    pub async fn channel_within(&self, deadline: Duration) -> Result<Box<dyn Channel>, BrokerError> {
        let acquire = async {
            loop {
                match self.channel().await {
                    Ok(ch) => return ch,
                    Err(err) => {
                        warn!(error = %err, "channel acquisition failed, retrying");
                        tokio::time::sleep(RETRY_PAUSE).await;
                    }
                }
            }
        };
        tokio::time::timeout(deadline, acquire)
            .await
            .map_err(|_| BrokerError::DeadlineExceeded)
    }

    async fn active_connection(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        let mut connections = self.connections.lock().await;
        connections.retain(|c| !c.is_closed());

        if connections.len() < self.size {
            let needed = self.size - connections.len();
            debug!(needed, "refilling broker connection pool");
            for _ in 0..needed {
                match self.new_connection().await {
                    Ok((pooled, monitor)) => {
                        connections.push(pooled);
                        self.monitors.lock().await.push(monitor);
                    }
                    Err(err) => warn!(error = %err, "failed to create replacement connection"),
                }
            }
        }

        if connections.is_empty() {
            return Err(BrokerError::NoConnections);
        }

        let idx = rand::rng().random_range(0..connections.len());
        Ok(Arc::clone(&connections[idx].conn))
    }

    /// Number of currently live connections.
    pub async fn live_connections(&self) -> usize {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Stop all monitors and close every connection. Returns once every
    /// monitor has acknowledged exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let monitors = std::mem::take(&mut *self.monitors.lock().await);
        for monitor in monitors {
            if let Err(err) = monitor.await {
                warn!(error = %err, "connection monitor panicked");
            }
        }
        self.connections.lock().await.clear();
    }
}
