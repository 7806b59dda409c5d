use std::collections::HashMap;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, warn};
use uuid::Uuid;

use zoo_common::job::TaskKind;
use zoo_common::work::{WorkFailure, WorkResult, WorkSuccess, WorkUnit, UNSUPPORTED_TASK_TIMEOUT};

use crate::config::EnricherPools;

/// Turn a job's task map into work units, drawing one endpoint uniformly at
/// random from the configured pool for each kind.
///
/// Kinds without a service behind them (unknown names, or names we accept
/// but cannot serve) still produce a unit so the job's bookkeeping sees
/// them, but the unit carries no endpoint and is never dispatched.
pub fn enumerate(
    pools: &EnricherPools,
    job_key: u64,
    artifact_id: Uuid,
    tasks: &HashMap<TaskKind, Vec<String>>,
    timeout: Duration,
) -> Vec<WorkUnit> {
    let mut units = Vec::with_capacity(tasks.len());

    for (kind, arguments) in tasks {
        let endpoint = pools
            .pool_for(kind)
            .and_then(|pool| pool.choose(&mut rand::thread_rng()))
            .cloned();

        let unit = match endpoint {
            Some(endpoint) => WorkUnit {
                job_key,
                artifact_id,
                kind: kind.clone(),
                endpoint,
                arguments: arguments.clone(),
                timeout,
            },
            None => {
                if kind.is_runnable() {
                    warn!(%kind, "no endpoints configured, task will not run");
                } else {
                    debug!(%kind, "kind has no service behind it, task will not run");
                }
                WorkUnit {
                    job_key,
                    artifact_id,
                    kind: kind.clone(),
                    endpoint: String::new(),
                    arguments: arguments.clone(),
                    timeout: UNSUPPORTED_TASK_TIMEOUT,
                }
            }
        };
        units.push(unit);
    }

    units
}

/// Call the enricher behind one work unit and classify the reply.
///
/// This never fails: transport errors and non-200 statuses all come back as
/// `Failure` variants so the caller's completion logic stays uniform.
pub async fn run_unit(client: &reqwest::Client, unit: &WorkUnit) -> WorkResult {
    let url = unit.request_url();
    let kind = unit.kind.clone();
    let arguments = unit.arguments.clone();

    let response = match client.get(&url).timeout(unit.timeout).send().await {
        Ok(response) => response,
        Err(error) => {
            let labels = [("kind", kind.to_string()), ("outcome", "error".to_owned())];
            metrics::counter!("work_units_total", &labels).increment(1);
            return WorkResult::Failure(WorkFailure::wildcard(kind, arguments, error));
        }
    };

    let status = response.status().as_u16();
    let labels = [("kind", kind.to_string()), ("outcome", status.to_string())];
    metrics::counter!("work_units_total", &labels).increment(1);

    match status {
        200 => match response.text().await {
            Ok(body) => WorkResult::Success(WorkSuccess {
                kind,
                arguments,
                data: body,
            }),
            Err(error) => WorkResult::Failure(WorkFailure::wildcard(kind, arguments, error)),
        },
        404 => WorkResult::Failure(WorkFailure::not_found(kind, arguments)),
        500 => WorkResult::Failure(WorkFailure::service_failed(kind, arguments)),
        other => WorkResult::Failure(WorkFailure::other_status(kind, arguments, other)),
    }
}
