use async_trait::async_trait;
use log::debug;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::broker::{BrokerConnector, BrokerSession, IncomingMessage, OutgoingMessage, ReplyStrategy};
use crate::error::{Result, TrainerError};

#[derive(Debug, Clone)]
struct StoredMessage {
    correlation_id: Option<String>,
    reply_to: Option<String>,
    redelivered: bool,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    exclusive_owner: Option<u64>,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: BTreeMap<String, QueueState>,
    next_session: u64,
    next_tag: u64,
    open_sessions: usize,
    unreachable: bool,
}

/// In-process broker with the AMQP semantics the RPC client relies on:
/// manual acknowledgement, requeue on reject or close, exclusive server-named
/// queues, and silent drops for unroutable publishes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `connect` fails as if the host refused the connection.
    pub async fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().await.unreachable = unreachable;
    }

    pub async fn open_connections(&self) -> usize {
        self.state.lock().await.open_sessions
    }

    pub async fn queue_names(&self) -> Vec<String> {
        self.state.lock().await.queues.keys().cloned().collect()
    }

    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|queue| queue.messages.len())
    }

    pub async fn session(&self) -> Result<InMemorySession> {
        let mut state = self.state.lock().await;
        if state.unreachable {
            return Err(TrainerError::Connection("connection refused".to_string()));
        }
        state.next_session += 1;
        state.open_sessions += 1;
        Ok(InMemorySession {
            id: state.next_session,
            state: Arc::clone(&self.state),
            unacked: HashMap::new(),
        })
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        Ok(Box::new(self.session().await?))
    }
}

pub struct InMemorySession {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    unacked: HashMap<u64, (String, StoredMessage)>,
}

impl InMemorySession {
    fn not_found(name: &str) -> TrainerError {
        TrainerError::Connection(format!("NOT_FOUND - no queue '{}'", name))
    }

    fn requeue(state: &mut BrokerState, queue: &str, mut message: StoredMessage) {
        if let Some(queue) = state.queues.get_mut(queue) {
            message.redelivered = true;
            queue.messages.push_front(message);
        }
    }
}

#[async_trait]
impl BrokerSession for InMemorySession {
    async fn declare_work_queue(&mut self, name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_reply_queue(&mut self, strategy: &ReplyStrategy) -> Result<String> {
        let mut state = self.state.lock().await;
        let name = match strategy {
            ReplyStrategy::Dedicated => {
                let name = format!("amq.gen-{}", Uuid::new_v4().simple());
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        exclusive_owner: Some(self.id),
                        ..Default::default()
                    },
                );
                name
            }
            ReplyStrategy::Shared(name) => {
                state.queues.entry(name.clone()).or_default();
                name.clone()
            }
        };
        Ok(name)
    }

    async fn publish(&mut self, queue: &str, message: OutgoingMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.queues.get_mut(queue) {
            Some(target) => target.messages.push_back(StoredMessage {
                correlation_id: Some(message.correlation_id),
                reply_to: Some(message.reply_to),
                redelivered: false,
                body: message.body,
            }),
            None => debug!("Dropping unroutable message for {}", queue),
        }
        Ok(())
    }

    async fn try_receive(&mut self, queue: &str) -> Result<Option<IncomingMessage>> {
        let mut state = self.state.lock().await;
        let message = {
            let target = state.queues.get_mut(queue).ok_or_else(|| Self::not_found(queue))?;
            if target.exclusive_owner.is_some_and(|owner| owner != self.id) {
                return Err(TrainerError::Connection(format!(
                    "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                    queue
                )));
            }
            target.messages.pop_front()
        };
        let Some(message) = message else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        self.unacked
            .insert(delivery_tag, (queue.to_string(), message.clone()));
        Ok(Some(IncomingMessage {
            delivery_tag,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            redelivered: message.redelivered,
            body: message.body,
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.unacked.remove(&delivery_tag).map(|_| ()).ok_or_else(|| {
            TrainerError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
        })
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let (queue, message) = self.unacked.remove(&delivery_tag).ok_or_else(|| {
            TrainerError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {}", delivery_tag))
        })?;
        if requeue {
            Self::requeue(&mut *self.state.lock().await, &queue, message);
        }
        Ok(())
    }

    async fn delete_queue(&mut self, name: &str) -> Result<()> {
        self.state
            .lock()
            .await
            .queues
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let InMemorySession { id, state, unacked } = *self;
        let mut state = state.lock().await;
        let mut pending: Vec<_> = unacked.into_iter().collect();
        // Newest first so the oldest ends up back at the head.
        pending.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, (queue, message)) in pending {
            Self::requeue(&mut state, &queue, message);
        }
        state
            .queues
            .retain(|_, queue| queue.exclusive_owner != Some(id));
        state.open_sessions -= 1;
        Ok(())
    }
}
