use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::{TaskKind, WorkOrder};

/// Default budget for one enricher invocation.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(60);

/// Kinds without a service behind them get a token budget; nothing ever
/// waits on them.
pub const UNSUPPORTED_TASK_TIMEOUT: Duration = Duration::from_millis(1);

/// One fan-out unit: a single enricher invocation for a single artifact.
#[derive(Debug, PartialEq, Clone)]
pub struct WorkUnit {
    /// Broker delivery tag of the job this unit belongs to.
    pub job_key: u64,
    pub artifact_id: Uuid,
    pub kind: TaskKind,
    /// Concrete base URL drawn from the endpoint pool for `kind`. Empty for
    /// kinds that are not runnable.
    pub endpoint: String,
    pub arguments: Vec<String>,
    pub timeout: Duration,
}

impl WorkUnit {
    /// The full request URL: the endpoint base, the artifact id, then every
    /// argument appended verbatim. No separators, no escaping; arguments are
    /// expected to already be path fragments like `/rulename`.
    pub fn request_url(&self) -> String {
        let mut url = format!("{}{}", self.endpoint, self.artifact_id);
        for argument in &self.arguments {
            url.push_str(argument);
        }
        url
    }

    /// Whether this unit produces HTTP traffic: the kind has a service
    /// behind it and an endpoint was drawn from a non-empty pool.
    pub fn is_dispatchable(&self) -> bool {
        self.kind.is_runnable() && !self.endpoint.is_empty()
    }
}

/// Outcome of one work unit. Running a unit never fails; every transport
/// error and non-200 status becomes a `Failure` so the barrier logic stays
/// uniform.
#[derive(Debug, PartialEq, Clone)]
pub enum WorkResult {
    Success(WorkSuccess),
    Failure(WorkFailure),
}

impl WorkResult {
    pub fn kind(&self) -> &TaskKind {
        match self {
            WorkResult::Success(s) => &s.kind,
            WorkResult::Failure(f) => &f.kind,
        }
    }

    /// Routing key this result is published under. Failures never go out on
    /// per-kind result keys; they travel on the configured re-queue key.
    pub fn routing_key(&self) -> String {
        match self {
            WorkResult::Success(s) => s.kind.result_routing_key(),
            WorkResult::Failure(_) => String::new(),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct WorkSuccess {
    pub kind: TaskKind,
    pub arguments: Vec<String>,
    /// Raw enricher response body.
    pub data: String,
}

#[derive(Debug, PartialEq, Clone)]
pub struct WorkFailure {
    pub kind: TaskKind,
    pub arguments: Vec<String>,
    /// Human-readable failure description, see `describe_*` below.
    pub data: String,
}

impl WorkFailure {
    pub fn not_found(kind: TaskKind, arguments: Vec<String>) -> Self {
        Self {
            kind,
            arguments,
            data: "Not found (File already deleted?)".to_owned(),
        }
    }

    pub fn service_failed(kind: TaskKind, arguments: Vec<String>) -> Self {
        let data = format!("{} service failed, check local logs", kind);
        Self {
            kind,
            arguments,
            data,
        }
    }

    pub fn other_status(kind: TaskKind, arguments: Vec<String>, code: u16) -> Self {
        Self {
            kind,
            arguments,
            data: format!("Some other code: {}", code),
        }
    }

    pub fn wildcard(kind: TaskKind, arguments: Vec<String>, detail: impl std::fmt::Display) -> Self {
        Self {
            kind,
            arguments,
            data: format!("wildcard failure: {}", detail),
        }
    }
}

/// Content hashes of a downloaded artifact, lowercase hex.
#[derive(Debug, PartialEq, Clone)]
pub struct ContentHashes {
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
}

/// Everything the publisher needs to announce a job's successes.
#[derive(Debug, PartialEq, Clone)]
pub struct ResultPackage {
    pub artifact_id: Uuid,
    pub successes: Vec<WorkSuccess>,
    pub hashes: ContentHashes,
}

impl ResultPackage {
    /// Flatten the package into one wire document per success, each paired
    /// with the routing key it is published under.
    pub fn documents(&self) -> Vec<(String, ResultDocument)> {
        self.successes
            .iter()
            .map(|success| {
                (
                    success.kind.result_routing_key(),
                    ResultDocument {
                        artifact_id: self.artifact_id,
                        md5: self.hashes.md5.clone(),
                        sha1: self.hashes.sha1.clone(),
                        sha256: self.hashes.sha256.clone(),
                        kind: success.kind.clone(),
                        arguments: success.arguments.clone(),
                        data: success.data.clone(),
                    },
                )
            })
            .collect()
    }
}

/// The outbound result message, one per success.
#[derive(Deserialize, Serialize, Debug, PartialEq, Clone)]
pub struct ResultDocument {
    pub artifact_id: Uuid,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub kind: TaskKind,
    pub arguments: Vec<String>,
    pub data: String,
}

/// Fold failed work back into a descriptor fit for re-queueing.
///
/// Several failures of the same kind merge by appending their argument lists
/// in observation order; the resulting task map is order-insensitive as a
/// multiset per kind.
pub fn requeue_order(original: &WorkOrder, failures: &[WorkFailure]) -> WorkOrder {
    let mut tasks: HashMap<TaskKind, Vec<String>> = HashMap::new();
    for failure in failures {
        tasks
            .entry(failure.kind.clone())
            .or_default()
            .extend(failure.arguments.iter().cloned());
    }

    WorkOrder {
        primary_uri: original.primary_uri.clone(),
        secondary_uri: original.secondary_uri.clone(),
        filename: original.filename.clone(),
        tasks,
        attempts: original.attempts,
    }
}
