//! Training core for person re-identification experiments.
//!
//! Turns a declarative YAML experiment into an identity-balanced (P × K)
//! batch stream, a weighted label-smoothed cross-entropy + margin triplet
//! loss, and a warmup + cosine/staged learning-rate schedule, and drives them
//! against pluggable model / dataset / evaluator collaborators.
//!
//! # Key types
//!
//! - [`ExperimentConfig`]: typed, validated view of an experiment YAML
//! - [`IdentityBatchSampler`] / [`IdentityCatalog`]: P × K batch sampling
//! - [`LossComposer`] / [`LossTerm`]: weighted loss composition
//! - [`LrScheduler`] / [`ScheduleState`]: warmup + decay schedule
//! - [`ExperimentOrchestrator`]: the epoch/step loop
//! - [`ReidModel`] / [`IdentityDataset`] / [`Evaluator`] / [`RankingExporter`]:
//!   collaborator traits; [`mocks`] and [`model::synthetic`] implement them
//!   for tests and synthetic runs

pub mod config;
pub mod error;
pub mod mocks;
pub mod model;
pub mod training;

pub use config::ExperimentConfig;
pub use error::TrainError;
pub use training::loss::{LossComposer, LossOutput, LossTerm, SoftmaxTerm, TripletTerm};
pub use training::sampler::{derive_epoch_seed, IdentityBatchSampler, IdentityCatalog};
pub use training::schedule::{DecayPolicy, LrScheduler, ScheduleState};
pub use training::trainer::{
    EvalReport, EvalRequest, Evaluator, ExperimentOrchestrator, IdentityDataset, ModelOutput,
    RankingExporter, ReidModel, RunSummary,
};
