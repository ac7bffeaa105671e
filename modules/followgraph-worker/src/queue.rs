use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use followgraph_common::{Config, WorkerStatus};

use crate::error::QueueError;

/// How a delivered message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Permanently consumed.
    Ack,
    /// Returned to the queue for redelivery.
    Requeue,
}

/// Invoked once per delivered work message.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Disposition;
}

/// An active consumer. Dropping it does not cancel the consumer; use
/// [`TaskSource::unsubscribe`].
pub struct Subscription {
    pub consumer_tag: String,
    task: JoinHandle<()>,
    alive: Arc<AtomicBool>,
}

/// Clears the liveness flag however the consume loop exits, panics included.
struct ClearOnExit(Arc<AtomicBool>);

impl Drop for ClearOnExit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Subscription {
    /// Run `consume` as this subscription's consume loop.
    pub fn spawn<F>(consumer_tag: String, consume: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let exit = ClearOnExit(alive.clone());
        let task = tokio::spawn(async move {
            let _exit = exit;
            consume.await;
        });
        Self {
            consumer_tag,
            task,
            alive,
        }
    }

    /// False once the consume loop has exited, whether cancelled or failed.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Shared view of [`Subscription::is_alive`] that outlives the handle.
    pub fn liveness(&self) -> Arc<AtomicBool> {
        self.alive.clone()
    }

    /// Wait until the consume loop has settled its in-flight message and exited.
    pub async fn drained(self) {
        if let Err(e) = self.task.await {
            warn!(consumer_tag = self.consumer_tag.as_str(), error = %e, "Consume loop panicked");
        }
    }
}

/// Work queue with at most one unsettled message per subscription.
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Start delivering messages to `handler`. The next message is not
    /// dispatched until the handler's disposition has been applied.
    async fn subscribe(&self, handler: Arc<dyn TaskHandler>) -> Result<Subscription, QueueError>;

    /// Stop new deliveries. A message already being handled still completes.
    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), QueueError>;
}

/// Reply sink for `status` commands.
#[async_trait]
pub trait ReplyPublisher: Send + Sync {
    async fn publish_status(&self, status: &WorkerStatus) -> Result<(), QueueError>;
}

/// Queue names used by workers and the control CLI.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub work_queue: String,
    pub control_queue: String,
    pub reply_queue: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            work_queue: "follower-fetcher".to_string(),
            control_queue: "control".to_string(),
            reply_queue: "control.reply".to_string(),
        }
    }
}

impl QueueTopology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_queue: config.work_queue.clone(),
            control_queue: config.control_queue.clone(),
            reply_queue: config.control_reply_queue.clone(),
        }
    }
}

/// RabbitMQ client: work consumption on a prefetch-1 channel, control
/// traffic on a second channel.
pub struct AmqpQueue {
    connection: Connection,
    work_channel: Channel,
    control_channel: Channel,
    topology: QueueTopology,
}

impl AmqpQueue {
    /// Connect and declare the work, control, and reply queues.
    pub async fn connect(url: &str, topology: QueueTopology) -> Result<Self, QueueError> {
        info!("Connecting to RabbitMQ...");
        let connection = Connection::connect(url, ConnectionProperties::default()).await?;

        let work_channel = connection.create_channel().await?;
        work_channel
            .queue_declare(
                &topology.work_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        work_channel
            .basic_qos(1, BasicQosOptions::default())
            .await?;

        let control_channel = connection.create_channel().await?;
        for name in [&topology.control_queue, &topology.reply_queue] {
            control_channel
                .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
                .await?;
        }

        info!(
            work_queue = topology.work_queue.as_str(),
            control_queue = topology.control_queue.as_str(),
            "Connected to RabbitMQ"
        );

        Ok(Self {
            connection,
            work_channel,
            control_channel,
            topology,
        })
    }

    /// Report the first connection-level error. Losing the broker is fatal
    /// to the process; there is no reconnect here.
    pub fn on_connection_error(&self, notify: oneshot::Sender<lapin::Error>) {
        let mut notify = Some(notify);
        self.connection.on_error(move |err| {
            if let Some(tx) = notify.take() {
                let _ = tx.send(err);
            }
        });
    }

    /// Auto-acknowledged consumer on the control queue.
    pub async fn control_consumer(&self) -> Result<Consumer, QueueError> {
        self.auto_ack_consumer(&self.topology.control_queue).await
    }

    /// Auto-acknowledged consumer on the reply queue.
    pub async fn reply_consumer(&self) -> Result<Consumer, QueueError> {
        self.auto_ack_consumer(&self.topology.reply_queue).await
    }

    async fn auto_ack_consumer(&self, queue: &str) -> Result<Consumer, QueueError> {
        let consumer = self
            .control_channel
            .basic_consume(
                queue,
                &consumer_tag(queue),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Publish to a queue through the default exchange.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), QueueError> {
        self.control_channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await?
            .await?;
        Ok(())
    }

    /// Send a control command with `target` and `command` headers.
    pub async fn publish_command(
        &self,
        target: &str,
        command: &str,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let mut headers = FieldTable::default();
        headers.insert("target".into(), AMQPValue::LongString(target.into()));
        headers.insert("command".into(), AMQPValue::LongString(command.into()));

        self.publish(
            &self.topology.control_queue,
            payload,
            BasicProperties::default().with_headers(headers),
        )
        .await
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        info!("Closing connection to RabbitMQ...");
        self.connection.close(200, "Bye").await?;
        Ok(())
    }
}

#[async_trait]
impl TaskSource for AmqpQueue {
    async fn subscribe(&self, handler: Arc<dyn TaskHandler>) -> Result<Subscription, QueueError> {
        let tag = consumer_tag(&self.topology.work_queue);
        let mut consumer = self
            .work_channel
            .basic_consume(
                &self.topology.work_queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let loop_tag = tag.clone();
        let subscription = Subscription::spawn(tag, async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(consumer_tag = loop_tag.as_str(), error = %e, "Consumer failed");
                        break;
                    }
                };

                let settled = match handler.handle(&delivery.data).await {
                    Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
                    Disposition::Requeue => {
                        delivery
                            .reject(BasicRejectOptions { requeue: true })
                            .await
                    }
                };
                if let Err(e) = settled {
                    error!(
                        consumer_tag = loop_tag.as_str(),
                        error = %e,
                        "Failed to settle delivery"
                    );
                    break;
                }
            }
            debug!(consumer_tag = loop_tag.as_str(), "Consume loop ended");
        });

        info!(
            consumer_tag = subscription.consumer_tag.as_str(),
            "Subscribed to work queue"
        );
        Ok(subscription)
    }

    async fn unsubscribe(&self, subscription: &Subscription) -> Result<(), QueueError> {
        self.work_channel
            .basic_cancel(&subscription.consumer_tag, BasicCancelOptions::default())
            .await?;
        info!(
            consumer_tag = subscription.consumer_tag.as_str(),
            "Unsubscribed from work queue"
        );
        Ok(())
    }
}

#[async_trait]
impl ReplyPublisher for AmqpQueue {
    async fn publish_status(&self, status: &WorkerStatus) -> Result<(), QueueError> {
        let body = serde_json::to_vec(status)?;
        self.publish(
            &self.topology.reply_queue,
            &body,
            BasicProperties::default().with_content_type("application/json".into()),
        )
        .await
    }
}

fn consumer_tag(queue: &str) -> String {
    format!("{queue}-{}", uuid::Uuid::new_v4().simple())
}
