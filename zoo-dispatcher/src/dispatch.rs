use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;
use zoo_common::job::WorkOrder;
use zoo_common::liveness::Beat;

use crate::broker;
use crate::config::ZooConfig;
use crate::coordinator::{AckCommand, Coordinator, CoordinatorSettings, JobEvent};
use crate::enrich;
use crate::error::DispatcherError;
use crate::publish::Outbound;

/// Why a delivery could not become a job.
#[derive(Debug)]
pub enum DecodeFailure {
    /// The body is not JSON at all.
    Json(serde_json::Error),
    /// The body is JSON but not a work order.
    Shape(serde_json::Error),
}

pub fn decode_order(payload: &[u8]) -> Result<WorkOrder, DecodeFailure> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(DecodeFailure::Json)?;
    serde_json::from_value(value).map_err(DecodeFailure::Shape)
}

/// Drives the broker: declares the topology, consumes deliveries within the
/// prefetch budget, decodes them into jobs, spawns one coordinator each, and
/// serializes every ack/nack onto the single consuming channel.
pub struct Dispatcher {
    channel: Channel,
    config: ZooConfig,
    publisher: mpsc::Sender<Outbound>,
    beat: Beat,
}

impl Dispatcher {
    pub fn new(
        channel: Channel,
        config: ZooConfig,
        publisher: mpsc::Sender<Outbound>,
        beat: Beat,
    ) -> Self {
        Self {
            channel,
            config,
            publisher,
            beat,
        }
    }

    pub async fn run(self) -> Result<(), DispatcherError> {
        broker::declare_topology(&self.channel, &self.config.rabbit_settings).await?;

        self.channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        let mut consumer = self
            .channel
            .basic_consume(
                &self.config.rabbit_settings.workqueue.name,
                "zoo-dispatcher",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.config.rabbit_settings.workqueue.name,
            prefetch = self.config.prefetch,
            "consuming work"
        );

        // Coordinators answer here; the channel stays open for the lifetime
        // of the loop.
        let (control_tx, mut control_rx) = mpsc::channel::<AckCommand>(64);
        let mut coordinators: HashMap<u64, mpsc::Sender<JobEvent>> = HashMap::new();
        let mut beat_interval = tokio::time::interval(Duration::from_secs(15));

        loop {
            tokio::select! {
                _ = beat_interval.tick() => {
                    self.beat.pulse();
                }
                command = control_rx.recv() => {
                    if let Some(command) = command {
                        self.settle(command, &mut coordinators).await;
                    }
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            self.on_delivery(delivery, &control_tx, &mut coordinators).await;
                        }
                        Some(Err(err)) => {
                            error!("consumer failed: {}", err);
                            return Err(DispatcherError::Broker(err));
                        }
                        None => return Err(DispatcherError::ConsumerClosed),
                    }
                }
            }
        }
    }

    async fn on_delivery(
        &self,
        delivery: Delivery,
        control: &mpsc::Sender<AckCommand>,
        coordinators: &mut HashMap<u64, mpsc::Sender<JobEvent>>,
    ) {
        let tag = delivery.delivery_tag;

        let order = match decode_order(&delivery.data) {
            Ok(order) => order,
            Err(DecodeFailure::Json(err)) => {
                warn!(tag, "discarding undecodable delivery: {}", err);
                metrics::counter!("deliveries_discarded_total").increment(1);
                self.reject(tag).await;
                return;
            }
            Err(DecodeFailure::Shape(err)) => {
                warn!(tag, "discarding delivery that is not a work order: {}", err);
                metrics::counter!("deliveries_discarded_total").increment(1);
                let misbehave = Outbound::Misbehave {
                    payload: delivery.data.clone(),
                };
                if self.publisher.send(misbehave).await.is_err() {
                    error!(tag, "publisher is gone, misbehaving payload lost");
                }
                self.reject(tag).await;
                return;
            }
        };

        let artifact_id = Uuid::now_v7();
        let units = enrich::enumerate(
            &self.config.enrichers,
            tag,
            artifact_id,
            &order.tasks,
            self.config.enricher_request_timeout(),
        );

        info!(
            tag,
            %artifact_id,
            filename = %order.filename,
            tasks = units.len(),
            "job accepted"
        );
        metrics::counter!("jobs_total").increment(1);

        let coordinator = Coordinator::new(
            tag,
            artifact_id,
            order,
            units,
            CoordinatorSettings {
                download_dir: self.config.download_directory.clone(),
                download_timeout: self.config.download_timeout(),
                connect_timeout: self.config.download_connect_timeout(),
                deadline: self.config.job_deadline(),
            },
            self.publisher.clone(),
            control.clone(),
        );

        coordinators.insert(tag, coordinator.events());
        tokio::spawn(coordinator.run());
    }

    /// Apply one ack/nack decision on the broker channel, then confirm the
    /// originating coordinator and forget it.
    async fn settle(
        &self,
        command: AckCommand,
        coordinators: &mut HashMap<u64, mpsc::Sender<JobEvent>>,
    ) {
        match command {
            AckCommand::Ack(tag) => {
                if let Err(err) = self
                    .channel
                    .basic_ack(tag, BasicAckOptions { multiple: false })
                    .await
                {
                    error!(tag, "broker ack failed: {}", err);
                }
                if let Some(events) = coordinators.remove(&tag) {
                    drop(events.send(JobEvent::ConsumerAckDone).await);
                }
            }
            AckCommand::Nack(tag) => {
                if let Err(err) = self
                    .channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue: true,
                        },
                    )
                    .await
                {
                    error!(tag, "broker nack failed: {}", err);
                }
                // The coordinator terminates on its own after asking for a
                // nack; no confirmation travels back.
                coordinators.remove(&tag);
            }
        }
    }

    /// Drop a delivery we will never process. `requeue=false` leaves
    /// redelivery policy (dead-lettering, discard) to the broker.
    async fn reject(&self, tag: u64) {
        if let Err(err) = self
            .channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
        {
            error!(tag, "broker reject failed: {}", err);
        }
    }
}
