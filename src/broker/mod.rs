mod memory;
mod pool;

pub use memory::MemoryBroker;
pub use pool::ConnectionPool;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("no active broker connections")]
    NoConnections,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel acquisition deadline exceeded")]
    DeadlineExceeded,
    #[error("publish to queue {queue} failed: {reason}")]
    Publish { queue: String, reason: String },
}

/// Message broker capability. The pool owns connections created through it.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>, BrokerError>;
}

/// One broker connection, exclusively owned by the pool and never reused
/// after the broker closes it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Resolves when the broker side closes the connection.
    async fn closed(&self);

    async fn open_channel(&self) -> Result<Box<dyn Channel>, BrokerError>;

    /// Proactive close from our side.
    async fn close(&self);
}

/// A lightweight communication channel over one connection.
#[async_trait]
pub trait Channel: Send + Sync {
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;
}
