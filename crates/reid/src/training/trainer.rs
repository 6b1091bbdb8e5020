//! Experiment orchestrator: drives sampler → model → loss composer →
//! optimizer step with the scheduled learning rate, epoch by epoch, and runs
//! evaluation / ranking export on the configured cadence.
//!
//! The model, dataset, evaluator and exporter are external collaborators
//! behind traits; `crate::mocks` and `crate::model::synthetic` provide small
//! implementations for tests and the CLI.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::{ExperimentConfig, NonFinitePolicy};
use crate::error::TrainError;
use crate::training::loss::LossComposer;
use crate::training::metrics::{EpochMetrics, MetricsHistory, RunningAvg, StepMetrics};
use crate::training::sampler::{derive_epoch_seed, IdentityBatchSampler, IdentityCatalog};
use crate::training::schedule::{LrScheduler, ScheduleState};

// ---------------------------------------------------------------------------
// Collaborator traits
// ---------------------------------------------------------------------------

/// Source of the (sample → identity) catalog.
pub trait IdentityDataset {
    /// Catalog for the given 0-based epoch. Implementations may rebuild it
    /// every epoch or return the same one.
    fn catalog(&mut self, epoch: usize) -> anyhow::Result<IdentityCatalog>;
}

/// Output of a model forward pass over one batch.
pub struct ModelOutput<B: Backend> {
    /// `(batch, dim)` feature embeddings.
    pub embeddings: Tensor<B, 2>,
    /// `(batch, classes)` identity classifier logits.
    pub logits: Tensor<B, 2>,
}

/// Trainable re-identification model.
pub trait ReidModel<B: Backend> {
    /// Forward the samples at the given catalog positions.
    fn forward(&mut self, batch: &[usize]) -> anyhow::Result<ModelOutput<B>>;

    /// Backpropagate `loss` and apply one optimizer update at rate `lr`.
    fn step(&mut self, loss: Tensor<B, 1>, lr: f64) -> anyhow::Result<()>;
}

/// What the evaluator is asked to compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalRequest {
    /// 1-based epoch that just finished.
    pub epoch: usize,
    pub ranks: Vec<usize>,
    pub normalize_feature: bool,
}

/// Evaluation result handed to the exporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub epoch: usize,
    /// CMC accuracy per requested rank.
    pub cmc: BTreeMap<usize, f64>,
    /// Mean average precision, when the evaluator computes it.
    pub map: Option<f64>,
}

impl EvalReport {
    pub fn rank1(&self) -> Option<f64> {
        self.cmc.get(&1).copied()
    }
}

/// Retrieval evaluation of a model.
pub trait Evaluator<M> {
    fn evaluate(&mut self, model: &M, request: &EvalRequest) -> anyhow::Result<EvalReport>;
}

/// Sink for ranking results (`test.export_ranking_results`).
pub trait RankingExporter {
    fn export(&mut self, report: &EvalReport) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Outcome of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub epochs_completed: usize,
    pub steps_per_epoch: usize,
    pub trained_steps: usize,
    pub skipped_steps: usize,
    /// Scheduler step after the last optimizer update.
    pub final_step: usize,
    pub final_lr: f64,
    pub elapsed_secs: f64,
    pub evaluations: Vec<EvalReport>,
    pub history: MetricsHistory,
}

impl RunSummary {
    pub fn last_eval(&self) -> Option<&EvalReport> {
        self.evaluations.last()
    }
}

/// Drives one experiment from a validated config.
pub struct ExperimentOrchestrator<'a, B: Backend> {
    config: &'a ExperimentConfig,
    composer: LossComposer<B>,
    deadline: Option<Duration>,
}

impl<'a, B: Backend> ExperimentOrchestrator<'a, B> {
    pub fn new(config: &'a ExperimentConfig) -> Result<Self, TrainError> {
        config.validate()?;
        Ok(Self {
            config,
            composer: LossComposer::from_config(config)?,
            deadline: None,
        })
    }

    /// Fail with `TimedOut` once the run has used up `limit` of wall-clock time.
    /// Checked between steps.
    pub fn with_deadline(mut self, limit: Duration) -> Self {
        self.deadline = Some(limit);
        self
    }

    pub fn composer(&self) -> &LossComposer<B> {
        &self.composer
    }

    /// Whether evaluation runs after the given 1-based epoch.
    pub fn should_evaluate(&self, epoch: usize) -> bool {
        let freq = self.config.test.eval_freq;
        (freq > 0 && epoch % freq as usize == 0) || epoch == self.config.train.max_epoch
    }

    fn check_deadline(&self, started: Instant) -> Result<(), TrainError> {
        if let Some(limit) = self.deadline {
            let elapsed = started.elapsed();
            if elapsed >= limit {
                return Err(TrainError::TimedOut {
                    elapsed_secs: elapsed.as_secs_f64(),
                });
            }
        }
        Ok(())
    }

    /// Run epochs `start_epoch..max_epoch`.
    pub fn run<M: ReidModel<B>>(
        &self,
        dataset: &mut dyn IdentityDataset,
        model: &mut M,
        evaluator: &mut dyn Evaluator<M>,
        mut exporter: Option<&mut dyn RankingExporter>,
    ) -> Result<RunSummary, TrainError> {
        let started = Instant::now();
        let train = &self.config.train;
        let test = &self.config.test;

        let catalog = dataset
            .catalog(train.start_epoch)
            .map_err(TrainError::Collaborator)?;
        let mut sampler = IdentityBatchSampler::from_config(self.config, catalog)?;
        let steps_per_epoch = sampler.batches_per_epoch();
        let scheduler = LrScheduler::from_config(self.config, steps_per_epoch)?;

        tracing::info!(
            samples = sampler.catalog().len(),
            identities = sampler.catalog().num_identities(),
            batch_size = sampler.batch_size(),
            num_instances = sampler.num_instances(),
            steps_per_epoch,
            epochs = format!("{}..{}", train.start_epoch + 1, train.max_epoch),
            schedule = %scheduler.describe(),
            terms = ?self.composer.term_weights(),
            hard_mining = self.composer.hard_mining(),
            "Starting training"
        );

        let mut schedule = ScheduleState::new(scheduler, train.start_epoch * steps_per_epoch);
        let mut history = MetricsHistory::new();
        let mut evaluations = Vec::new();
        let mut trained_steps = 0;
        let mut skipped_steps = 0;

        for epoch in train.start_epoch..train.max_epoch {
            if epoch != train.start_epoch {
                let catalog = dataset.catalog(epoch).map_err(TrainError::Collaborator)?;
                sampler.set_catalog(catalog)?;
            }
            sampler.reset(derive_epoch_seed(train.seed, epoch));
            // The schedule keeps its step budget; only this epoch's length follows the catalog.
            let epoch_len = sampler.batches_per_epoch();
            if epoch_len != steps_per_epoch {
                tracing::info!(
                    epoch = epoch + 1,
                    epoch_len,
                    scheduled = steps_per_epoch,
                    "Epoch length differs from the scheduled steps per epoch"
                );
            }

            let mut running_avg = RunningAvg::new();
            let mut epoch_avg = RunningAvg::new();
            let mut epoch_trained = 0;
            let mut epoch_skipped = 0;

            for batch_idx in 0..epoch_len {
                self.check_deadline(started)?;
                let Some(batch) = sampler.next_batch() else {
                    break;
                };
                let labels = sampler.catalog().labels_for(&batch)?;
                let lr = schedule.current_rate();

                let output = model.forward(&batch).map_err(TrainError::Collaborator)?;
                let loss = match self.composer.compute(
                    output.embeddings,
                    output.logits,
                    &labels,
                    self.composer.hard_mining(),
                ) {
                    Ok(loss) => loss,
                    Err(TrainError::NumericalInstability { value, .. })
                        if train.nonfinite_policy == NonFinitePolicy::SkipStep =>
                    {
                        skipped_steps += 1;
                        epoch_skipped += 1;
                        tracing::warn!(
                            step = schedule.step(),
                            epoch = epoch + 1,
                            value,
                            skipped_steps,
                            "Step skipped (non-finite loss)"
                        );
                        continue;
                    }
                    Err(e) => return Err(e.at_step(schedule.step())),
                };

                let metrics = StepMetrics::from_output(&loss, lr);
                model
                    .step(loss.total, lr)
                    .map_err(TrainError::Collaborator)?;
                schedule.advance();
                trained_steps += 1;
                epoch_trained += 1;
                running_avg.update(&metrics);
                epoch_avg.update(&metrics);

                if train.print_freq > 0 && (batch_idx + 1) % train.print_freq == 0 {
                    let warnings = running_avg
                        .avg_metrics()
                        .map(|m| m.health_check())
                        .unwrap_or_default();
                    if !warnings.is_empty() {
                        tracing::warn!(step = schedule.step(), "Health check warnings: {:?}", warnings);
                    }
                    tracing::info!(
                        epoch = epoch + 1,
                        batch = format!("{}/{}", batch_idx + 1, epoch_len),
                        lr = %format!("{lr:.2e}"),
                        "avg({}) {}",
                        running_avg.count(),
                        running_avg.display()
                    );
                    running_avg.reset();
                }
            }

            let epoch_metrics = EpochMetrics {
                epoch: epoch + 1,
                average: epoch_avg.avg_metrics(),
                trained_steps: epoch_trained,
                skipped_steps: epoch_skipped,
                end_lr: schedule.current_rate(),
            };
            for warning in epoch_metrics.health_check() {
                tracing::warn!(epoch = epoch + 1, "{warning}");
            }
            tracing::info!(
                epoch = epoch + 1,
                trained = epoch_trained,
                skipped = epoch_skipped,
                lr = %format!("{:.2e}", epoch_metrics.end_lr),
                "Epoch done: {}",
                epoch_avg.display()
            );
            history.push(epoch_metrics);

            if self.should_evaluate(epoch + 1) {
                let request = EvalRequest {
                    epoch: epoch + 1,
                    ranks: test.ranks.clone(),
                    normalize_feature: test.normalize_feature,
                };
                let report = evaluator
                    .evaluate(model, &request)
                    .map_err(TrainError::Collaborator)?;
                tracing::info!(
                    epoch = epoch + 1,
                    rank1 = ?report.rank1(),
                    map = ?report.map,
                    "Evaluation"
                );
                if test.export_ranking_results {
                    if let Some(exporter) = exporter.as_deref_mut() {
                        exporter.export(&report).map_err(TrainError::Collaborator)?;
                    }
                }
                evaluations.push(report);
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        tracing::info!(
            trained_steps,
            skipped_steps,
            final_step = schedule.step(),
            elapsed_secs = format!("{elapsed:.1}"),
            "Training loop finished"
        );

        Ok(RunSummary {
            epochs_completed: history.len(),
            steps_per_epoch,
            trained_steps,
            skipped_steps,
            final_step: schedule.step(),
            final_lr: schedule.current_rate(),
            elapsed_secs: elapsed,
            evaluations,
            history,
        })
    }
}
