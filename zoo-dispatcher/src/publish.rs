use lapin::options::BasicPublishOptions;
use lapin::{BasicProperties, Channel};
use tokio::sync::mpsc;
use tracing::{debug, error};

use zoo_common::job::WorkOrder;
use zoo_common::work::ResultPackage;

use crate::config::ZooConfig;
use crate::coordinator::JobEvent;

/// Everything that leaves the process through the broker.
#[derive(Debug)]
pub enum Outbound {
    /// One document per success, each on its per-kind result routing key.
    Results {
        package: ResultPackage,
        notify: mpsc::Sender<JobEvent>,
    },
    /// A descriptor holding only the failed kinds, on the re-queue key.
    Requeue {
        order: WorkOrder,
        notify: mpsc::Sender<JobEvent>,
    },
    /// A payload we decoded but cannot process, forwarded for inspection.
    Misbehave { payload: Vec<u8> },
}

/// Serializes outbound packages and publishes them with their routing keys.
///
/// Publish failures are logged and counted but never block a job: the
/// coordinator is confirmed regardless, and correctness is deferred to the
/// broker's redelivery of the unacked original.
pub struct Publisher {
    channel: Channel,
    exchange: String,
    requeue_key: String,
    misbehave_key: String,
    rx: mpsc::Receiver<Outbound>,
}

impl Publisher {
    pub fn new(channel: Channel, config: &ZooConfig, rx: mpsc::Receiver<Outbound>) -> Self {
        Self {
            channel,
            exchange: config.rabbit_settings.exchange.name.clone(),
            requeue_key: config.requeue_key.clone(),
            misbehave_key: config.misbehave_key.clone(),
            rx,
        }
    }

    pub async fn run(mut self) {
        while let Some(outbound) = self.rx.recv().await {
            match outbound {
                Outbound::Results { package, notify } => {
                    for (routing_key, document) in package.documents() {
                        match serde_json::to_vec(&document) {
                            Ok(payload) => self.publish(&routing_key, &payload).await,
                            Err(err) => {
                                error!(artifact_id = %package.artifact_id,
                                    "failed to serialize result document: {}", err)
                            }
                        }
                    }
                    drop(notify.send(JobEvent::ResultPublished).await);
                }
                Outbound::Requeue { order, notify } => {
                    match serde_json::to_vec(&order) {
                        Ok(payload) => self.publish(&self.requeue_key, &payload).await,
                        Err(err) => error!("failed to serialize re-queue order: {}", err),
                    }
                    drop(notify.send(JobEvent::RemainderPublished).await);
                }
                Outbound::Misbehave { payload } => {
                    self.publish(&self.misbehave_key, &payload).await;
                }
            }
        }
    }

    async fn publish(&self, routing_key: &str, payload: &[u8]) {
        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await;

        match confirm {
            Ok(confirm) => match confirm.await {
                Ok(_) => {
                    debug!(routing_key, bytes = payload.len(), "published");
                    metrics::counter!("messages_published_total").increment(1);
                }
                Err(err) => {
                    error!(routing_key, "publish was not confirmed: {}", err);
                    metrics::counter!("publish_failures_total").increment(1);
                }
            },
            Err(err) => {
                error!(routing_key, "publish failed: {}", err);
                metrics::counter!("publish_failures_total").increment(1);
            }
        }
    }
}
