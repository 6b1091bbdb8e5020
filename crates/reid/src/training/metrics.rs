//! Per-step and per-epoch training metrics with health checks.

use std::collections::BTreeMap;

use burn::prelude::Backend;
use serde::{Deserialize, Serialize};

use crate::training::loss::LossOutput;

/// Metrics for one optimizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Weighted total loss.
    pub loss: f64,
    /// Unweighted value of every evaluated term, keyed by term name.
    pub terms: BTreeMap<String, f64>,
    /// Learning rate used for the step.
    pub lr: f64,
}

impl StepMetrics {
    pub fn from_output<B: Backend>(output: &LossOutput<B>, lr: f64) -> Self {
        let terms = output
            .terms
            .iter()
            .filter_map(|t| t.value.map(|v| (t.name.to_string(), v)))
            .collect();
        StepMetrics {
            loss: output.total_value,
            terms,
            lr,
        }
    }

    /// Warnings about signs of a broken run. Meant for averaged metrics.
    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.loss > 100.0 {
            warnings.push(format!("loss {:.2} is very large, training may be diverging", self.loss));
        }
        if let Some(&tri) = self.terms.get("triplet") {
            if tri < 1e-6 {
                warnings.push(
                    "triplet loss is ~0: every anchor already satisfies the margin".to_string(),
                );
            }
        }
        if self.lr < 1e-9 {
            warnings.push(format!("learning rate {:.1e} is effectively zero", self.lr));
        }
        warnings
    }
}

/// Running average of [`StepMetrics`] over a logging interval.
#[derive(Debug, Clone, Default)]
pub struct RunningAvg {
    loss: f64,
    terms: BTreeMap<String, (f64, usize)>,
    lr: f64,
    count: usize,
}

impl RunningAvg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, m: &StepMetrics) {
        self.loss += m.loss;
        self.lr += m.lr;
        for (name, value) in &m.terms {
            let entry = self.terms.entry(name.clone()).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn display(&self) -> String {
        let Some(avg) = self.avg_metrics() else {
            return "no data".to_string();
        };
        let mut out = format!("loss={:.4}", avg.loss);
        for (name, value) in &avg.terms {
            out.push_str(&format!(" {name}={value:.4}"));
        }
        out
    }

    pub fn avg_metrics(&self) -> Option<StepMetrics> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(StepMetrics {
            loss: self.loss / n,
            terms: self
                .terms
                .iter()
                .map(|(name, (sum, count))| (name.clone(), sum / *count as f64))
                .collect(),
            lr: self.lr / n,
        })
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Summary of one epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Averages over the epoch's trained steps; `None` if every step was skipped.
    pub average: Option<StepMetrics>,
    pub trained_steps: usize,
    pub skipped_steps: usize,
    /// Learning rate after the last step of the epoch.
    pub end_lr: f64,
}

impl EpochMetrics {
    pub fn skip_rate(&self) -> f64 {
        let total = self.trained_steps + self.skipped_steps;
        if total == 0 {
            0.0
        } else {
            self.skipped_steps as f64 / total as f64
        }
    }

    pub fn health_check(&self) -> Vec<String> {
        let mut warnings = self
            .average
            .as_ref()
            .map(StepMetrics::health_check)
            .unwrap_or_default();
        if self.skip_rate() > 0.5 {
            warnings.push(format!(
                "{:.0}% of steps skipped on non-finite loss",
                self.skip_rate() * 100.0
            ));
        }
        warnings
    }
}

/// Per-epoch metrics of a run, in order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    epochs: Vec<EpochMetrics>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Epoch with the lowest average loss.
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .filter(|e| e.average.is_some())
            .min_by(|a, b| {
                let la = a.average.as_ref().map_or(f64::INFINITY, |m| m.loss);
                let lb = b.average.as_ref().map_or(f64::INFINITY, |m| m.loss);
                la.total_cmp(&lb)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(loss: f64, triplet: Option<f64>, lr: f64) -> StepMetrics {
        let mut terms = BTreeMap::new();
        terms.insert("softmax".to_string(), loss);
        if let Some(t) = triplet {
            terms.insert("triplet".to_string(), t);
        }
        StepMetrics { loss, terms, lr }
    }

    #[test]
    fn test_running_avg() {
        let mut avg = RunningAvg::new();
        assert!(avg.avg_metrics().is_none());
        assert_eq!(avg.display(), "no data");

        avg.update(&step(2.0, Some(0.4), 1e-3));
        avg.update(&step(4.0, None, 3e-3));
        let m = avg.avg_metrics().unwrap();
        assert!((m.loss - 3.0).abs() < 1e-12);
        assert!((m.lr - 2e-3).abs() < 1e-12);
        // A term averages only over the steps that evaluated it.
        assert!((m.terms["triplet"] - 0.4).abs() < 1e-12);
        assert!(avg.display().starts_with("loss=3.0000"));

        avg.reset();
        assert_eq!(avg.count(), 0);
    }

    #[test]
    fn test_health_check() {
        assert!(step(1.0, Some(0.2), 3e-4).health_check().is_empty());
        let warnings = step(500.0, Some(0.0), 1e-12).health_check();
        assert_eq!(warnings.len(), 3, "{warnings:?}");
    }

    #[test]
    fn test_epoch_skip_rate_warning() {
        let epoch = EpochMetrics {
            epoch: 1,
            average: None,
            trained_steps: 1,
            skipped_steps: 3,
            end_lr: 3e-4,
        };
        assert!((epoch.skip_rate() - 0.75).abs() < 1e-12);
        assert_eq!(epoch.health_check().len(), 1);
    }

    #[test]
    fn test_history_best_epoch() {
        let mut history = MetricsHistory::new();
        assert!(history.best_epoch().is_none());
        for (i, loss) in [3.0, 1.5, 2.0].into_iter().enumerate() {
            history.push(EpochMetrics {
                epoch: i + 1,
                average: Some(step(loss, None, 1e-4)),
                trained_steps: 10,
                skipped_steps: 0,
                end_lr: 1e-4,
            });
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.best_epoch().map(|e| e.epoch), Some(2));
        assert_eq!(history.last().map(|e| e.epoch), Some(3));
    }
}
