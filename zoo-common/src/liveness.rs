use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::warn;

/// Liveness tracking for the process' long-running loops.
///
/// A loop that must never wedge (the dispatcher, mainly) registers itself
/// and pulses its [`Beat`] on every iteration. The probe endpoint reports
/// the process dead as soon as any registered loop stays silent past its
/// deadline, so the orchestrator restarts it. Registration grants one full
/// deadline of grace before silence counts.

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// One loop's pulse, cheap to hand into the loop that owns it.
#[derive(Clone)]
pub struct Beat {
    last_pulse: Arc<AtomicI64>,
}

impl Beat {
    /// Record a completed iteration. Must happen more often than the
    /// deadline the loop registered with.
    pub fn pulse(&self) {
        self.last_pulse.store(now_millis(), Ordering::Relaxed);
    }
}

struct WatchedLoop {
    name: String,
    /// Longest silence tolerated before the loop counts as wedged.
    deadline_millis: i64,
    last_pulse: Arc<AtomicI64>,
}

impl WatchedLoop {
    fn is_silent(&self, now: i64) -> bool {
        now - self.last_pulse.load(Ordering::Relaxed) > self.deadline_millis
    }
}

/// Verdict over all registered loops; usable directly as an axum response.
#[derive(Debug)]
pub struct LivenessStatus {
    pub healthy: bool,
    /// Names of the loops that stayed silent past their deadline.
    pub silent: Vec<String>,
}

impl IntoResponse for LivenessStatus {
    fn into_response(self) -> Response {
        if self.healthy {
            return (StatusCode::OK, "ok".to_owned()).into_response();
        }
        let body = if self.silent.is_empty() {
            "no loops registered".to_owned()
        } else {
            format!("silent loops: {}", self.silent.join(", "))
        };
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

#[derive(Clone)]
pub struct Liveness {
    name: String,
    loops: Arc<RwLock<Vec<WatchedLoop>>>,
}

impl Liveness {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            loops: Default::default(),
        }
    }

    /// Watch a loop; hand the returned beat to it.
    pub fn register(&self, name: &str, deadline: Duration) -> Beat {
        let last_pulse = Arc::new(AtomicI64::new(now_millis()));
        let watched = WatchedLoop {
            name: name.to_owned(),
            deadline_millis: deadline.whole_milliseconds() as i64,
            last_pulse: last_pulse.clone(),
        };
        match self.loops.write() {
            Ok(mut loops) => loops.push(watched),
            Err(poisoned) => poisoned.into_inner().push(watched),
        }
        Beat { last_pulse }
    }

    /// Current verdict. A process with nothing registered is not trusted.
    pub fn status(&self) -> LivenessStatus {
        let loops = match self.loops.read() {
            Ok(loops) => loops,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = now_millis();
        let silent: Vec<String> = loops
            .iter()
            .filter(|watched| watched.is_silent(now))
            .map(|watched| watched.name.clone())
            .collect();
        let healthy = !loops.is_empty() && silent.is_empty();

        if !healthy {
            warn!("{} probe failing, silent loops: {:?}", self.name, silent);
        }
        LivenessStatus { healthy, silent }
    }
}
