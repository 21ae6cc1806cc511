use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerError, Channel, Connection};

type Queues = Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>;

/// In-process broker used by the mock binary and tests. Supports forced
/// connection severing and connection refusal to exercise the pool's
/// self-healing and hard-outage paths.
pub struct MemoryBroker {
    queues: Queues,
    connections: Mutex<Vec<CancellationToken>>,
    refuse: Mutex<bool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            connections: Mutex::new(Vec::new()),
            refuse: Mutex::new(false),
        }
    }

    /// Simulate a broker-side close of up to `count` connections.
    pub async fn sever(&self, count: usize) {
        let mut connections = self.connections.lock().await;
        for token in connections.iter().filter(|t| !t.is_cancelled()).take(count) {
            token.cancel();
        }
        connections.retain(|t| !t.is_cancelled());
    }

    /// When set, `connect` fails, simulating a full broker outage.
    pub async fn refuse_new_connections(&self, refuse: bool) {
        *self.refuse.lock().await = refuse;
    }

    /// Snapshot of the messages published to `queue`.
    pub async fn queue_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.queues.lock().await.get(queue).cloned().unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError> {
        if *self.refuse.lock().await {
            return Err(BrokerError::Connect("connection refused".to_string()));
        }
        let remote_close = CancellationToken::new();
        self.connections.lock().await.push(remote_close.clone());
        Ok(Box::new(MemoryConnection {
            queues: Arc::clone(&self.queues),
            remote_close,
            local_close: CancellationToken::new(),
        }))
    }
}

struct MemoryConnection {
    queues: Queues,
    remote_close: CancellationToken,
    local_close: CancellationToken,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        self.remote_close.is_cancelled() || self.local_close.is_cancelled()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn closed(&self) {
        self.remote_close.cancelled().await;
    }

    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(Box::new(MemoryChannel {
            queues: Arc::clone(&self.queues),
        }))
    }

    async fn close(&self) {
        self.local_close.cancel();
    }
}

struct MemoryChannel {
    queues: Queues,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.queues.lock().await.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(payload.to_vec());
        Ok(())
    }
}
