//! Re-identification training pipeline: identity-balanced sampling, loss
//! composition, learning-rate scheduling, metrics with health checks, and the
//! experiment orchestrator.

pub mod loss;
pub mod metrics;
pub mod sampler;
pub mod schedule;
pub mod trainer;
