use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions,
    QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use log::{debug, info};

use super::broker::{BrokerConnector, BrokerSession, IncomingMessage, OutgoingMessage, ReplyStrategy};
use crate::error::{Result, TrainerError};
use crate::utils::config::BrokerConfig;

const PERSISTENT: u8 = 2;

fn broker_error(action: &str) -> impl FnOnce(lapin::Error) -> TrainerError + '_ {
    move |e| TrainerError::Connection(format!("{}: {}", action, e))
}

/// RabbitMQ connector built from an explicit, already validated configuration.
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    pub fn new(config: BrokerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.config.user.clone(),
                    password: self.config.password.clone(),
                },
                host: self.config.host.clone(),
                port: self.config.port,
            },
            vhost: self.config.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.config.heartbeat_secs),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>> {
        let properties =
            ConnectionProperties::default().with_connection_name("hpc-trainer".into());
        let connection = Connection::connect_uri(self.uri(), properties)
            .await
            .map_err(|e| {
                TrainerError::Connection(format!(
                    "failed to connect to {}:{}: {}",
                    self.config.host, self.config.port, e
                ))
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(broker_error("failed to open channel"))?;
        info!(
            "Connected to broker {}:{} as {}",
            self.config.host, self.config.port, self.config.user
        );
        Ok(Box::new(AmqpSession { connection, channel }))
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn declare_work_queue(&mut self, name: &str) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(broker_error("failed to declare work queue"))?;
        Ok(())
    }

    async fn declare_reply_queue(&mut self, strategy: &ReplyStrategy) -> Result<String> {
        let (name, options) = match strategy {
            ReplyStrategy::Dedicated => (
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            ),
            ReplyStrategy::Shared(name) => (name.as_str(), QueueDeclareOptions::default()),
        };
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(broker_error("failed to declare reply queue"))?;
        debug!("Declared reply queue {}", queue.name().as_str());
        Ok(queue.name().as_str().to_string())
    }

    async fn publish(&mut self, queue: &str, message: OutgoingMessage) -> Result<()> {
        let properties = BasicProperties::default()
            .with_correlation_id(ShortString::from(message.correlation_id))
            .with_reply_to(ShortString::from(message.reply_to))
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        self.channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(broker_error("failed to publish request"))?
            .await
            .map_err(broker_error("request was not confirmed"))?;
        Ok(())
    }

    async fn try_receive(&mut self, queue: &str) -> Result<Option<IncomingMessage>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(broker_error("failed to poll reply queue"))?;

        Ok(message.map(|message| {
            let delivery = message.delivery;
            IncomingMessage {
                delivery_tag: delivery.delivery_tag,
                correlation_id: delivery
                    .properties
                    .correlation_id()
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
                reply_to: delivery
                    .properties
                    .reply_to()
                    .as_ref()
                    .map(|queue| queue.as_str().to_string()),
                redelivered: delivery.redelivered,
                body: delivery.data,
            }
        }))
    }

    async fn ack(&mut self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(broker_error("failed to acknowledge reply"))
    }

    async fn reject(&mut self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(broker_error("failed to reject message"))
    }

    async fn delete_queue(&mut self, name: &str) -> Result<()> {
        let purged = self
            .channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(broker_error("failed to delete reply queue"))?;
        debug!("Deleted queue {} ({} messages dropped)", name, purged);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.channel
            .close(200, "call finished")
            .await
            .map_err(broker_error("failed to close channel"))?;
        self.connection
            .close(200, "call finished")
            .await
            .map_err(broker_error("failed to close connection"))
    }
}
