use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use zoo_common::job::{TaskKind, WorkOrder};
use zoo_common::work::{ResultDocument, WorkUnit, DEFAULT_TASK_TIMEOUT};
use zoo_dispatcher::coordinator::{AckCommand, Coordinator, CoordinatorSettings, JobEvent};
use zoo_dispatcher::publish::Outbound;

pub const TAG: u64 = 42;

/// What the stub publisher saw, in publish order.
#[derive(Debug)]
pub enum Published {
    Result {
        routing_key: String,
        document: ResultDocument,
    },
    Requeue(WorkOrder),
}

pub fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "zoo-coordinator-{}-{}",
        test,
        std::process::id()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn order(primary: &str, filename: &str, tasks: &[(TaskKind, Vec<String>)]) -> WorkOrder {
    WorkOrder {
        primary_uri: primary.to_owned(),
        secondary_uri: primary.to_owned(),
        filename: filename.to_owned(),
        tasks: tasks.iter().cloned().collect::<HashMap<_, _>>(),
        attempts: 0,
    }
}

pub fn unit(artifact_id: Uuid, kind: TaskKind, endpoint: &str) -> WorkUnit {
    WorkUnit {
        job_key: TAG,
        artifact_id,
        kind,
        endpoint: endpoint.to_owned(),
        arguments: vec![],
        timeout: DEFAULT_TASK_TIMEOUT,
    }
}

pub fn settings(download_dir: PathBuf, deadline: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        download_dir,
        download_timeout: Duration::from_secs(5),
        connect_timeout: Duration::from_secs(1),
        deadline,
    }
}

/// A publisher stand-in: records what would have gone to the broker and
/// confirms the coordinator exactly like the real one.
pub fn stub_publisher() -> (mpsc::Sender<Outbound>, mpsc::UnboundedReceiver<Published>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(16);
    let (published_tx, published_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Results { package, notify } => {
                    for (routing_key, document) in package.documents() {
                        drop(published_tx.send(Published::Result {
                            routing_key,
                            document,
                        }));
                    }
                    drop(notify.send(JobEvent::ResultPublished).await);
                }
                Outbound::Requeue { order, notify } => {
                    drop(published_tx.send(Published::Requeue(order)));
                    drop(notify.send(JobEvent::RemainderPublished).await);
                }
                Outbound::Misbehave { .. } => {}
            }
        }
    });

    (outbound_tx, published_rx)
}

/// Run one coordinator to completion, answering its ack/nack like the
/// dispatcher would. Returns the settle decision and everything published.
pub async fn run_job(
    tag: u64,
    artifact_id: Uuid,
    order: WorkOrder,
    units: Vec<WorkUnit>,
    settings: CoordinatorSettings,
) -> (AckCommand, Vec<Published>) {
    let (control_tx, mut control_rx) = mpsc::channel::<AckCommand>(8);
    let (outbound_tx, mut published_rx) = stub_publisher();

    let coordinator = Coordinator::new(
        tag,
        artifact_id,
        order,
        units,
        settings,
        outbound_tx,
        control_tx,
    );
    let events = coordinator.events();
    let handle = tokio::spawn(coordinator.run());

    let command = tokio::time::timeout(Duration::from_secs(30), control_rx.recv())
        .await
        .expect("coordinator should settle within the test budget")
        .expect("coordinator dropped its control channel before settling");

    if let AckCommand::Ack(_) = command {
        // Forced closes may already be past the barrier; that is fine.
        drop(events.send(JobEvent::ConsumerAckDone).await);
    }

    tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("coordinator should terminate")
        .expect("coordinator task should not panic");

    // The coordinator is gone, so the stub publisher drains what is left and
    // closes the channel; collect until then.
    let mut published = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        match tokio::time::timeout_at(deadline, published_rx.recv()).await {
            Ok(Some(record)) => published.push(record),
            Ok(None) => break,
            Err(_) => panic!("stub publisher did not drain in time"),
        }
    }

    (command, published)
}
