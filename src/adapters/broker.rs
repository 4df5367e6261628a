use async_trait::async_trait;

use crate::error::Result;

/// Where replies for a call are delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStrategy {
    /// Server-named, exclusive queue created for one call and deleted after it.
    Dedicated,
    /// Well-known queue shared by every caller; replies are told apart by token.
    Shared(String),
}

impl ReplyStrategy {
    pub fn is_dedicated(&self) -> bool {
        matches!(self, ReplyStrategy::Dedicated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub correlation_id: String,
    pub reply_to: String,
    pub body: Vec<u8>,
}

/// A message fetched with manual acknowledgement still pending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub delivery_tag: u64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
    pub body: Vec<u8>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a fresh connection and channel.
    async fn connect(&self) -> Result<Box<dyn BrokerSession>>;
}

/// One open connection plus channel. Every operation maps onto a single AMQP method.
#[async_trait]
pub trait BrokerSession: Send {
    async fn declare_work_queue(&mut self, name: &str) -> Result<()>;

    /// Returns the name of the queue replies should be sent to.
    async fn declare_reply_queue(&mut self, strategy: &ReplyStrategy) -> Result<String>;

    async fn publish(&mut self, queue: &str, message: OutgoingMessage) -> Result<()>;

    /// Non-blocking fetch of the next message, or `None` if the queue is empty.
    async fn try_receive(&mut self, queue: &str) -> Result<Option<IncomingMessage>>;

    async fn ack(&mut self, delivery_tag: u64) -> Result<()>;

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn delete_queue(&mut self, name: &str) -> Result<()>;

    /// Closes channel and connection. Unacknowledged messages go back to their queues.
    async fn close(self: Box<Self>) -> Result<()>;
}
