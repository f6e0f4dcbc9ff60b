use crate::domain::ports::{Delivery, MessageBus};
use crate::utils::error::Result;
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// RabbitMQ client: durable fanout exchanges, one durable queue per
/// `{exchange}.{queue_suffix}`, persistent messages, manual acknowledgement.
pub struct AmqpBus {
    _connection: Connection,
    channel: Channel,
    declared: Mutex<HashSet<String>>,
}

impl AmqpBus {
    pub async fn connect(uri: &str) -> Result<Self> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        tracing::info!("🐇 已連線至 RabbitMQ");

        Ok(Self {
            _connection: connection,
            channel,
            declared: Mutex::new(HashSet::new()),
        })
    }

    /// Declare the exchange and bind its queue, once per process.
    async fn declare(&self, exchange: &str, queue_suffix: &str) -> Result<String> {
        let queue = format!("{}.{}", exchange, queue_suffix);
        let known = self
            .declared
            .lock()
            .map(|set| set.contains(&queue))
            .unwrap_or(false);
        if known {
            return Ok(queue);
        }

        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(&queue, exchange, "", QueueBindOptions::default(), FieldTable::default())
            .await?;

        if let Ok(mut set) = self.declared.lock() {
            set.insert(queue.clone());
        }
        tracing::debug!(queue = %queue, "declared queue");
        Ok(queue)
    }

    async fn get_one(&self, queue: &str, exchange: &str) -> Result<Option<Delivery>> {
        let message = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await?;

        Ok(message.map(|m| Delivery {
            body: m.delivery.data.clone(),
            exchange: exchange.to_string(),
            tag: m.delivery.delivery_tag,
        }))
    }
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn send(&self, message: &Value, exchange: &str, queue_suffix: &str) -> Result<()> {
        self.declare(exchange, queue_suffix).await?;
        let payload = serde_json::to_vec(message)?;

        self.channel
            .basic_publish(
                exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        tracing::debug!(exchange, bytes = payload.len(), "📤 message sent");
        Ok(())
    }

    async fn receive(
        &self,
        exchange: &str,
        queue_suffix: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<Delivery>> {
        let queue = self.declare(exchange, queue_suffix).await?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(delivery) = self.get_one(&queue, exchange).await? {
                return Ok(Some(delivery));
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn receive_batch(&self, exchange: &str, queue_suffix: &str) -> Result<Vec<Delivery>> {
        let queue = self.declare(exchange, queue_suffix).await?;
        let mut batch = Vec::new();
        while let Some(delivery) = self.get_one(&queue, exchange).await? {
            batch.push(delivery);
        }
        Ok(batch)
    }

    async fn acknowledge(&self, delivery: &Delivery) -> Result<()> {
        self.channel
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery.tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await?;
        Ok(())
    }
}
