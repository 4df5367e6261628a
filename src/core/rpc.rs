use log::{debug, info, warn};
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, timeout_at, Instant};
use uuid::Uuid;

use crate::adapters::broker::{BrokerConnector, BrokerSession, OutgoingMessage, ReplyStrategy};
use crate::core::job::{JobRequest, JobResponse};
use crate::error::{Result, TrainerError};

pub const DEFAULT_WORK_QUEUE: &str = "hpc-jobs";
pub const DEFAULT_SHARED_REPLY_QUEUE: &str = "hpc-results";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Disconnected,
    Connected,
    Published,
    AwaitingReply,
    Completed,
    Failed,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub work_queue: String,
    pub reply: ReplyStrategy,
    /// Pause between empty polls of the reply queue.
    pub poll_interval: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            work_queue: DEFAULT_WORK_QUEUE.to_string(),
            reply: ReplyStrategy::Dedicated,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl RpcOptions {
    pub fn with_work_queue(mut self, work_queue: impl Into<String>) -> Self {
        self.work_queue = work_queue.into();
        self
    }

    pub fn with_reply(mut self, reply: ReplyStrategy) -> Self {
        self.reply = reply;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

/// Per-call bookkeeping for everything that must be released when the call ends.
struct PendingCall {
    token: String,
    state: CallState,
    reply_queue: Option<String>,
    dedicated_queue: Option<String>,
    held: Vec<u64>,
}

impl PendingCall {
    fn new() -> Self {
        Self {
            token: Uuid::new_v4().to_string(),
            state: CallState::Disconnected,
            reply_queue: None,
            dedicated_queue: None,
            held: Vec::new(),
        }
    }

    fn advance(&mut self, next: CallState) {
        debug!("Call {}: {} -> {}", self.token, self.state, next);
        self.state = next;
    }
}

/// Request/reply over a one-way broker. Each `call` runs a full connection lifecycle.
pub struct RpcClient<C: BrokerConnector> {
    connector: C,
    options: RpcOptions,
}

impl<C: BrokerConnector> RpcClient<C> {
    pub fn new(connector: C, options: RpcOptions) -> Self {
        Self { connector, options }
    }

    pub fn options(&self) -> &RpcOptions {
        &self.options
    }

    /// Publishes `request` and waits until a reply carrying the same
    /// correlation token arrives, or `timeout` elapses.
    pub async fn call(&self, request: &JobRequest, timeout: Duration) -> Result<JobResponse> {
        let deadline = Instant::now() + timeout;
        let body = serde_json::to_vec(request)
            .map_err(|e| TrainerError::Encode(format!("failed to serialize job request: {}", e)))?;

        let mut pending = PendingCall::new();
        let mut session = match timeout_at(deadline, self.connector.connect()).await {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                pending.advance(CallState::Failed);
                return Err(e);
            }
            Err(_) => {
                pending.advance(CallState::Failed);
                return Err(TrainerError::Timeout(timeout));
            }
        };
        pending.advance(CallState::Connected);

        let outcome = timeout_at(
            deadline,
            self.exchange(session.as_mut(), &mut pending, body, deadline, timeout),
        )
        .await
        .unwrap_or_else(|_| Err(TrainerError::Timeout(timeout)));
        match &outcome {
            Ok(_) => pending.advance(CallState::Completed),
            Err(e) => {
                warn!("Call {} failed: {}", pending.token, e);
                pending.advance(CallState::Failed);
            }
        }

        if let Err(e) = self.release(session, &mut pending).await {
            warn!("Failed to release broker resources for call {}: {}", pending.token, e);
        }
        outcome
    }

    async fn exchange(
        &self,
        session: &mut dyn BrokerSession,
        pending: &mut PendingCall,
        body: Vec<u8>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<JobResponse> {
        session.declare_work_queue(&self.options.work_queue).await?;
        let reply_queue = session.declare_reply_queue(&self.options.reply).await?;
        if self.options.reply.is_dedicated() {
            pending.dedicated_queue = Some(reply_queue.clone());
        }
        pending.reply_queue = Some(reply_queue.clone());

        session
            .publish(
                &self.options.work_queue,
                OutgoingMessage {
                    correlation_id: pending.token.clone(),
                    reply_to: reply_queue.clone(),
                    body,
                },
            )
            .await?;
        pending.advance(CallState::Published);
        info!(
            "Published job {} to {}, awaiting reply on {}",
            pending.token, self.options.work_queue, reply_queue
        );

        pending.advance(CallState::AwaitingReply);
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(TrainerError::Timeout(timeout));
            }

            match session.try_receive(&reply_queue).await? {
                Some(message) if message.correlation_id.as_deref() == Some(pending.token.as_str()) => {
                    session.ack(message.delivery_tag).await?;
                    info!("Received reply for job {} ({} bytes)", pending.token, message.body.len());
                    return serde_json::from_slice(&message.body).map_err(|e| {
                        TrainerError::Decode(format!("reply is not a valid job response: {}", e))
                    });
                }
                Some(message) => {
                    debug!(
                        "Skipping reply {:?} on {} while waiting for {} (redelivered: {})",
                        message.correlation_id, reply_queue, pending.token, message.redelivered
                    );
                    if self.options.reply.is_dedicated() {
                        warn!(
                            "Unexpected message {:?} on dedicated reply queue {}",
                            message.correlation_id, reply_queue
                        );
                    } else {
                        pending.held.push(message.delivery_tag);
                    }
                }
                None => {
                    requeue_held(session, pending).await?;
                    sleep(self.options.poll_interval.min(deadline - now)).await;
                }
            }
        }
    }

    async fn release(&self, mut session: Box<dyn BrokerSession>, pending: &mut PendingCall) -> Result<()> {
        let requeued = requeue_held(session.as_mut(), pending).await;
        let deleted = match pending.dedicated_queue.take() {
            Some(queue) => session.delete_queue(&queue).await,
            None => Ok(()),
        };
        let closed = session.close().await;
        debug!(
            "Released call {} (reply queue {:?})",
            pending.token, pending.reply_queue
        );
        requeued.and(deleted).and(closed)
    }
}

// Hands every held message back so the caller it belongs to can see it.
async fn requeue_held(session: &mut dyn BrokerSession, pending: &mut PendingCall) -> Result<()> {
    for delivery_tag in pending.held.drain(..) {
        session.reject(delivery_tag, true).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::broker::MockBrokerConnector;
    use crate::adapters::memory::InMemoryBroker;
    use crate::core::settings::default_settings;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// Session whose broker accepts the job but never answers a poll.
    struct StalledSession {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl BrokerSession for StalledSession {
        async fn declare_work_queue(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn declare_reply_queue(&mut self, _strategy: &ReplyStrategy) -> Result<String> {
            Ok("amq.gen-stalled".to_string())
        }

        async fn publish(&mut self, _queue: &str, _message: OutgoingMessage) -> Result<()> {
            Ok(())
        }

        async fn try_receive(
            &mut self,
            _queue: &str,
        ) -> Result<Option<crate::adapters::broker::IncomingMessage>> {
            std::future::pending().await
        }

        async fn ack(&mut self, _delivery_tag: u64) -> Result<()> {
            Ok(())
        }

        async fn reject(&mut self, _delivery_tag: u64, _requeue: bool) -> Result<()> {
            Ok(())
        }

        async fn delete_queue(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn request() -> JobRequest {
        let inputs = [("Image", "aW1n"), ("Text", "dHh0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        JobRequest::new(inputs, default_settings())
    }

    fn options(reply: ReplyStrategy) -> RpcOptions {
        RpcOptions::default()
            .with_reply(reply)
            .with_poll_interval(Duration::from_millis(5))
    }

    fn reply_body(tag: &str) -> Vec<u8> {
        let reply: BTreeMap<&str, String> = [("Background Model", tag.to_string())].into();
        serde_json::to_vec(&reply).unwrap()
    }

    /// Plays the cluster side: takes one job and answers with `replies`, in
    /// order. `None` reuses the request's own correlation token.
    async fn answer_one_job(broker: InMemoryBroker, replies: Vec<(Option<&'static str>, &'static str)>) {
        let mut worker = broker.session().await.unwrap();
        worker.declare_work_queue(DEFAULT_WORK_QUEUE).await.unwrap();
        let job = loop {
            if let Some(job) = worker.try_receive(DEFAULT_WORK_QUEUE).await.unwrap() {
                break job;
            }
            sleep(Duration::from_millis(2)).await;
        };
        worker.ack(job.delivery_tag).await.unwrap();
        let _: JobRequest = serde_json::from_slice(&job.body).unwrap();

        let reply_to = job.reply_to.clone().unwrap();
        for (token, tag) in replies {
            let correlation_id = token
                .map(str::to_string)
                .unwrap_or_else(|| job.correlation_id.clone().unwrap());
            worker
                .publish(
                    &reply_to,
                    OutgoingMessage {
                        correlation_id,
                        reply_to: String::new(),
                        body: reply_body(tag),
                    },
                )
                .await
                .unwrap();
            sleep(Duration::from_millis(20)).await;
        }
        Box::new(worker).close().await.unwrap();
    }

    #[tokio::test]
    async fn returns_the_matching_reply_and_cleans_up() {
        let broker = InMemoryBroker::new();
        let client = RpcClient::new(broker.clone(), options(ReplyStrategy::Dedicated));
        let worker = tokio::spawn(answer_one_job(broker.clone(), vec![(None, "AAEC")]));

        let response = client.call(&request(), Duration::from_secs(5)).await.unwrap();
        worker.await.unwrap();

        assert_eq!(
            response.artifact(crate::core::job::OutputName::BackgroundModel),
            Some("AAEC")
        );
        assert_eq!(broker.open_connections().await, 0);
        assert_eq!(broker.queue_names().await, vec![DEFAULT_WORK_QUEUE.to_string()]);
    }

    #[tokio::test]
    async fn ignores_replies_for_other_tokens() {
        let broker = InMemoryBroker::new();
        let client = RpcClient::new(broker.clone(), options(ReplyStrategy::Dedicated));
        let worker = tokio::spawn(answer_one_job(
            broker.clone(),
            vec![(Some("someone-else"), "V1JPTkc="), (None, "UklHSFQ=")],
        ));

        let response = client.call(&request(), Duration::from_secs(5)).await.unwrap();
        worker.await.unwrap();

        assert_eq!(
            response.artifact(crate::core::job::OutputName::BackgroundModel),
            Some("UklHSFQ=")
        );
    }

    #[tokio::test]
    async fn times_out_without_leaking_queue_or_connection() {
        let broker = InMemoryBroker::new();
        let client = RpcClient::new(broker.clone(), options(ReplyStrategy::Dedicated));

        let err = client
            .call(&request(), Duration::from_millis(60))
            .await
            .unwrap_err();

        assert!(matches!(err, TrainerError::Timeout(_)));
        assert_eq!(broker.open_connections().await, 0);
        assert_eq!(broker.queue_names().await, vec![DEFAULT_WORK_QUEUE.to_string()]);
        // The request itself stays queued for the cluster.
        assert_eq!(broker.queue_depth(DEFAULT_WORK_QUEUE).await, Some(1));
    }

    #[tokio::test]
    async fn stalled_broker_cannot_outlast_the_deadline() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&closed);
        let mut connector = MockBrokerConnector::new();
        connector.expect_connect().times(1).returning(move || {
            Ok(Box::new(StalledSession {
                closed: Arc::clone(&flag),
            }) as Box<dyn BrokerSession>)
        });
        let client = RpcClient::new(connector, options(ReplyStrategy::Dedicated));

        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            client.call(&request(), Duration::from_millis(100)),
        )
        .await
        .expect("call must give up at its own deadline");

        assert!(matches!(outcome, Err(TrainerError::Timeout(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn connection_failure_is_not_a_timeout() {
        let broker = InMemoryBroker::new();
        broker.set_unreachable(true).await;
        let client = RpcClient::new(broker.clone(), options(ReplyStrategy::Dedicated));

        let err = client.call(&request(), Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, TrainerError::Connection(_)));
    }

    #[tokio::test]
    async fn connection_errors_surface_without_retry() {
        let mut connector = MockBrokerConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|| Err(TrainerError::Connection("ACCESS_REFUSED".into())));
        let client = RpcClient::new(connector, options(ReplyStrategy::Dedicated));

        let err = client.call(&request(), Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, TrainerError::Connection(ref m) if m == "ACCESS_REFUSED"));
    }

    #[tokio::test]
    async fn malformed_reply_is_a_decode_error() {
        let broker = InMemoryBroker::new();
        let client = RpcClient::new(broker.clone(), options(ReplyStrategy::Dedicated));
        let answer = broker.clone();
        let worker = tokio::spawn(async move {
            let mut session = answer.session().await.unwrap();
            session.declare_work_queue(DEFAULT_WORK_QUEUE).await.unwrap();
            let job = loop {
                if let Some(job) = session.try_receive(DEFAULT_WORK_QUEUE).await.unwrap() {
                    break job;
                }
                sleep(Duration::from_millis(2)).await;
            };
            session
                .publish(
                    job.reply_to.as_deref().unwrap(),
                    OutgoingMessage {
                        correlation_id: job.correlation_id.clone().unwrap(),
                        reply_to: String::new(),
                        body: b"<html>502</html>".to_vec(),
                    },
                )
                .await
                .unwrap();
            session.ack(job.delivery_tag).await.unwrap();
            Box::new(session).close().await.unwrap();
        });

        let err = client.call(&request(), Duration::from_secs(5)).await.unwrap_err();
        worker.await.unwrap();

        assert!(matches!(err, TrainerError::Decode(_)));
        assert_eq!(broker.open_connections().await, 0);
    }

    #[tokio::test]
    async fn shared_queue_keeps_concurrent_replies_apart() {
        let broker = InMemoryBroker::new();
        let shared = ReplyStrategy::Shared(DEFAULT_SHARED_REPLY_QUEUE.to_string());
        let first = RpcClient::new(broker.clone(), options(shared.clone()));
        let second = RpcClient::new(broker.clone(), options(shared));

        // Answers both jobs in reverse order so each caller sees the other's reply first.
        let cluster = broker.clone();
        let worker = tokio::spawn(async move {
            let mut session = cluster.session().await.unwrap();
            session.declare_work_queue(DEFAULT_WORK_QUEUE).await.unwrap();
            let mut jobs = Vec::new();
            while jobs.len() < 2 {
                match session.try_receive(DEFAULT_WORK_QUEUE).await.unwrap() {
                    Some(job) => jobs.push(job),
                    None => sleep(Duration::from_millis(2)).await,
                }
            }
            for job in jobs.iter().rev() {
                let request: JobRequest = serde_json::from_slice(&job.body).unwrap();
                let tag = request.input(crate::core::job::InputName::Image).unwrap().to_string();
                session
                    .publish(
                        DEFAULT_SHARED_REPLY_QUEUE,
                        OutgoingMessage {
                            correlation_id: job.correlation_id.clone().unwrap(),
                            reply_to: String::new(),
                            body: reply_body(&tag),
                        },
                    )
                    .await
                    .unwrap();
                session.ack(job.delivery_tag).await.unwrap();
            }
            Box::new(session).close().await.unwrap();
        });

        let tagged = |tag: &str| {
            let inputs = [("Image".to_string(), tag.to_string())].into_iter().collect();
            JobRequest::new(inputs, default_settings())
        };
        let (t1, t2) = (tagged("T1"), tagged("T2"));
        let (one, two) = tokio::join!(
            first.call(&t1, Duration::from_secs(5)),
            second.call(&t2, Duration::from_secs(5)),
        );
        worker.await.unwrap();

        let background = crate::core::job::OutputName::BackgroundModel;
        assert_eq!(one.unwrap().artifact(background), Some("T1"));
        assert_eq!(two.unwrap().artifact(background), Some("T2"));
        assert_eq!(broker.queue_depth(DEFAULT_SHARED_REPLY_QUEUE).await, Some(0));
        assert_eq!(broker.open_connections().await, 0);
    }

    #[tokio::test]
    async fn shared_queue_requeues_foreign_replies_on_timeout() {
        let broker = InMemoryBroker::new();
        let mut other = broker.session().await.unwrap();
        other
            .declare_reply_queue(&ReplyStrategy::Shared(DEFAULT_SHARED_REPLY_QUEUE.into()))
            .await
            .unwrap();
        other
            .publish(
                DEFAULT_SHARED_REPLY_QUEUE,
                OutgoingMessage {
                    correlation_id: "not-ours".into(),
                    reply_to: String::new(),
                    body: reply_body("x"),
                },
            )
            .await
            .unwrap();

        let client = RpcClient::new(
            broker.clone(),
            options(ReplyStrategy::Shared(DEFAULT_SHARED_REPLY_QUEUE.into())),
        );
        let err = client
            .call(&request(), Duration::from_millis(40))
            .await
            .unwrap_err();

        assert!(matches!(err, TrainerError::Timeout(_)));
        let survivor = other.try_receive(DEFAULT_SHARED_REPLY_QUEUE).await.unwrap().unwrap();
        assert_eq!(survivor.correlation_id.as_deref(), Some("not-ours"));
        assert!(survivor.redelivered);
    }
}
