pub mod job;
pub mod liveness;
pub mod metrics;
pub mod work;
