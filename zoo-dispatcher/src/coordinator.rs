use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use uuid::Uuid;

use zoo_common::job::WorkOrder;
use zoo_common::work::{
    requeue_order, ResultPackage, WorkFailure, WorkResult, WorkSuccess, WorkUnit,
};

use crate::download::{self, FetchedArtifact};
use crate::enrich;
use crate::publish::Outbound;

/// Ack/nack decision sent back to the dispatcher, keyed by delivery tag.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AckCommand {
    Ack(u64),
    Nack(u64),
}

/// Events driving one coordinator. The download, the fan-out, the publisher
/// and the dispatcher all talk to the coordinator through these; the barrier
/// itself is touched by nothing else.
#[derive(Debug)]
pub enum JobEvent {
    DownloadOk(FetchedArtifact),
    DownloadFailed,
    WorkComplete {
        successes: Vec<WorkSuccess>,
        failures: Vec<WorkFailure>,
    },
    ResultPublished,
    RemainderPublished,
    ConsumerAckDone,
    Deadline,
}

/// The completion barrier. Each flag latches true exactly once; the job
/// terminates only when the required set is closed.
#[derive(Debug, Default, Clone, Copy)]
pub struct Standoff {
    /// Download and fan-out finished, publishes handed off.
    pub local: bool,
    /// The success bundle is out (or there was nothing to publish).
    pub result: bool,
    /// The re-queue bundle is out (or there was nothing to re-queue).
    pub remainder: bool,
    /// The dispatcher confirmed the broker ack.
    pub consumer: bool,
    /// The job is unrecoverable and the dispatcher was told to nack.
    pub nack: bool,
}

impl Standoff {
    pub fn ack_ready(&self) -> bool {
        self.local && self.result && self.remainder && !self.consumer
    }

    pub fn nacked(&self) -> bool {
        self.local && self.nack
    }

    pub fn resolved(&self) -> bool {
        self.local && self.result && self.remainder && self.consumer
    }
}

/// Per-coordinator knobs, all derived from configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub download_dir: PathBuf,
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    /// Wall-clock budget for the whole job; on expiry the barrier is forced
    /// closed through the normal event path.
    pub deadline: Duration,
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

/// Owns one job from delivery to ack/nack: downloads the artifact, fans out
/// all work units in parallel, splits the outcomes into a result package and
/// a re-queue package, and resolves the standoff barrier before releasing
/// its temp file.
pub struct Coordinator {
    tag: u64,
    artifact_id: Uuid,
    order: WorkOrder,
    units: Vec<WorkUnit>,
    settings: CoordinatorSettings,
    client: reqwest::Client,
    publisher: mpsc::Sender<Outbound>,
    control: mpsc::Sender<AckCommand>,
    events_tx: mpsc::Sender<JobEvent>,
    events_rx: mpsc::Receiver<JobEvent>,
    standoff: Standoff,
    ack_sent: bool,
    artifact: Option<FetchedArtifact>,
    /// Results land here as units finish, so a deadline eviction can still
    /// see the completed subset.
    completed: Arc<Mutex<Vec<WorkResult>>>,
    download: Option<JoinHandle<()>>,
    fanout: Option<JoinHandle<()>>,
    started: Instant,
}

impl Coordinator {
    pub fn new(
        tag: u64,
        artifact_id: Uuid,
        order: WorkOrder,
        units: Vec<WorkUnit>,
        settings: CoordinatorSettings,
        publisher: mpsc::Sender<Outbound>,
        control: mpsc::Sender<AckCommand>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent("zoo-dispatcher")
            .build()
            .expect("failed to construct reqwest client for job coordinator");

        let (events_tx, events_rx) = mpsc::channel(16);

        Self {
            tag,
            artifact_id,
            order,
            units,
            settings,
            client,
            publisher,
            control,
            events_tx,
            events_rx,
            standoff: Standoff::default(),
            ack_sent: false,
            artifact: None,
            completed: Arc::new(Mutex::new(Vec::new())),
            download: None,
            fanout: None,
            started: Instant::now(),
        }
    }

    /// Handle the dispatcher uses to deliver `ConsumerAckDone`.
    pub fn events(&self) -> mpsc::Sender<JobEvent> {
        self.events_tx.clone()
    }

    pub async fn run(mut self) {
        debug!(tag = self.tag, artifact_id = %self.artifact_id, "job started");
        self.spawn_download();

        let deadline = tokio::time::sleep(self.settings.deadline);
        tokio::pin!(deadline);

        loop {
            let event = tokio::select! {
                _ = &mut deadline => JobEvent::Deadline,
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if self.apply(event).await == Flow::Done {
                break;
            }
        }

        metrics::histogram!("job_duration_seconds")
            .record(self.started.elapsed().as_secs_f64());
        debug!(tag = self.tag, "job finished");
    }

    async fn apply(&mut self, event: JobEvent) -> Flow {
        match event {
            JobEvent::DownloadOk(artifact) => {
                self.artifact = Some(artifact);
                self.spawn_fanout();
            }
            JobEvent::DownloadFailed => {
                metrics::counter!("jobs_download_failed_total").increment(1);
                self.send_control(AckCommand::Nack(self.tag)).await;
                self.standoff.local = true;
                self.standoff.nack = true;
            }
            JobEvent::WorkComplete {
                successes,
                failures,
            } => {
                self.publish_outcome(successes, failures).await;
                self.standoff.local = true;
            }
            JobEvent::ResultPublished => self.standoff.result = true,
            JobEvent::RemainderPublished => self.standoff.remainder = true,
            JobEvent::ConsumerAckDone => self.standoff.consumer = true,
            JobEvent::Deadline => return self.force_close().await,
        }

        self.advance().await
    }

    /// Check the barrier predicates after every event.
    async fn advance(&mut self) -> Flow {
        if self.standoff.nacked() {
            // Failure path: the temp file was never created. Dropping self
            // closes the HTTP transport.
            metrics::counter!("jobs_nacked_total").increment(1);
            return Flow::Done;
        }

        if !self.ack_sent && self.standoff.ack_ready() {
            self.ack_sent = true;
            self.send_control(AckCommand::Ack(self.tag)).await;
        }

        if self.standoff.resolved() {
            metrics::counter!("jobs_acked_total").increment(1);
            self.cleanup().await;
            return Flow::Done;
        }

        Flow::Continue
    }

    fn spawn_download(&mut self) {
        let client = self.client.clone();
        let events = self.events_tx.clone();
        let primary = self.order.primary_uri.clone();
        let secondary = self.order.secondary_uri.clone();
        let destination =
            download::artifact_path(&self.settings.download_dir, &self.order.filename);
        let timeout = self.settings.download_timeout;
        let tag = self.tag;

        self.download = Some(tokio::spawn(async move {
            let event =
                match download::fetch(&client, &primary, &secondary, &destination, timeout).await {
                    Ok(artifact) => JobEvent::DownloadOk(artifact),
                    Err(err) => {
                        error!(tag, uri = %primary, "artifact download failed: {}", err);
                        JobEvent::DownloadFailed
                    }
                };
            drop(events.send(event).await);
        }));
    }

    fn spawn_fanout(&mut self) {
        let units: Vec<WorkUnit> = self
            .units
            .iter()
            .filter(|unit| unit.is_dispatchable())
            .cloned()
            .collect();

        let skipped = self.units.len() - units.len();
        if skipped > 0 {
            debug!(tag = self.tag, skipped, "skipping tasks without a service");
        }

        let client = self.client.clone();
        let completed = self.completed.clone();
        let events = self.events_tx.clone();

        self.fanout = Some(tokio::spawn(async move {
            let mut join_set = JoinSet::new();
            for unit in units {
                let client = client.clone();
                join_set.spawn(async move { enrich::run_unit(&client, &unit).await });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => completed
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(result),
                    Err(err) => error!("work unit task failed to join: {}", err),
                }
            }

            let results = completed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone();
            let (successes, failures) = partition(results);
            drop(
                events
                    .send(JobEvent::WorkComplete {
                        successes,
                        failures,
                    })
                    .await,
            );
        }));
    }

    /// Hand the split outcome to the publisher. Empty bundles close their
    /// barrier flag immediately; non-empty bundles close it when the
    /// publisher confirms.
    async fn publish_outcome(
        &mut self,
        successes: Vec<WorkSuccess>,
        failures: Vec<WorkFailure>,
    ) {
        let Some(artifact) = &self.artifact else {
            // WorkComplete cannot precede DownloadOk; a fan-out without an
            // artifact has nothing publishable.
            warn!(tag = self.tag, "work completed without an artifact on disk");
            self.standoff.result = true;
            self.standoff.remainder = true;
            return;
        };

        if successes.is_empty() {
            self.standoff.result = true;
        } else {
            let package = ResultPackage {
                artifact_id: self.artifact_id,
                successes,
                hashes: artifact.hashes.clone(),
            };
            let outbound = Outbound::Results {
                package,
                notify: self.events_tx.clone(),
            };
            if self.publisher.send(outbound).await.is_err() {
                error!(tag = self.tag, "publisher is gone, dropping result package");
                self.standoff.result = true;
            }
        }

        if failures.is_empty() {
            self.standoff.remainder = true;
        } else {
            let order = requeue_order(&self.order, &failures);
            let outbound = Outbound::Requeue {
                order,
                notify: self.events_tx.clone(),
            };
            if self.publisher.send(outbound).await.is_err() {
                error!(tag = self.tag, "publisher is gone, dropping re-queue package");
                self.standoff.remainder = true;
            }
        }
    }

    /// Deadline eviction: publish the completed subset, convert everything
    /// still in flight into failures so its kinds are re-queued, then close
    /// every outstanding flag and clean up.
    async fn force_close(&mut self) -> Flow {
        warn!(
            tag = self.tag,
            artifact_id = %self.artifact_id,
            "job deadline exceeded, force-closing the standoff"
        );
        metrics::counter!("jobs_evicted_total").increment(1);

        if let Some(handle) = self.download.take() {
            handle.abort();
        }
        if let Some(handle) = self.fanout.take() {
            handle.abort();
        }

        if self.standoff.nack {
            return Flow::Done;
        }

        if self.artifact.is_none() {
            // Still waiting on the download; same terminal state as a failed
            // fetch. The aborted fetch may have left a partial file behind.
            let destination =
                download::artifact_path(&self.settings.download_dir, &self.order.filename);
            drop(tokio::fs::remove_file(&destination).await);
            self.send_control(AckCommand::Nack(self.tag)).await;
            self.standoff.local = true;
            self.standoff.nack = true;
            return self.advance().await;
        }

        if !self.standoff.local {
            let (successes, failures) = self.drain_completed();
            self.publish_outcome(successes, failures).await;
            self.standoff.local = true;
        }

        // Outstanding publisher and dispatcher confirmations are forced; any
        // publish still in flight finishes or fails on its own.
        self.standoff.result = true;
        self.standoff.remainder = true;
        if !self.ack_sent {
            self.ack_sent = true;
            self.send_control(AckCommand::Ack(self.tag)).await;
        }
        self.standoff.consumer = true;

        metrics::counter!("jobs_acked_total").increment(1);
        self.cleanup().await;
        Flow::Done
    }

    /// The completed subset, plus one wildcard failure per dispatchable unit
    /// that never reported back.
    fn drain_completed(&mut self) -> (Vec<WorkSuccess>, Vec<WorkFailure>) {
        let results = self
            .completed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let seen: HashSet<_> = results.iter().map(|result| result.kind().clone()).collect();
        let (successes, mut failures) = partition(results);

        for unit in self.units.iter().filter(|unit| unit.is_dispatchable()) {
            if !seen.contains(&unit.kind) {
                failures.push(WorkFailure::wildcard(
                    unit.kind.clone(),
                    unit.arguments.clone(),
                    "job deadline exceeded",
                ));
            }
        }

        (successes, failures)
    }

    async fn cleanup(&mut self) {
        if let Some(artifact) = self.artifact.take() {
            if let Err(err) = tokio::fs::remove_file(&artifact.path).await {
                warn!(
                    tag = self.tag,
                    path = %artifact.path.display(),
                    "failed to remove temp artifact: {}",
                    err
                );
            }
        }
    }

    async fn send_control(&self, command: AckCommand) {
        if self.control.send(command).await.is_err() {
            error!(tag = self.tag, "dispatcher is gone, dropping {:?}", command);
        }
    }
}

fn partition(results: Vec<WorkResult>) -> (Vec<WorkSuccess>, Vec<WorkFailure>) {
    let mut successes = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            WorkResult::Success(success) => successes.push(success),
            WorkResult::Failure(failure) => failures.push(failure),
        }
    }
    (successes, failures)
}
