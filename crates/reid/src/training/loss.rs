//! Label-smoothed cross-entropy + margin triplet losses and their weighted
//! composition.
//!
//! All loss functions are generic over `B: Backend` and operate on burn
//! tensors; identity masks are built on the host from the label slice.
//! The composer holds a list of [`LossTerm`] trait objects and sums
//! `weight * term` over them, so a new term plugs in without touching the
//! composer.

use std::collections::HashSet;

use burn::prelude::*;
use burn::tensor::activation::log_softmax;
use burn::tensor::TensorData;

use crate::config::{DistanceMetric, ExperimentConfig, LossFamily};
use crate::error::TrainError;
use crate::model::bridge::{negative_mask, positive_mask, tensor_to_f64, vector_to_tensor};

/// Probability mass moved off the true class when label smoothing is on.
pub const LABEL_SMOOTHING_EPSILON: f64 = 0.1;

/// Cross-entropy between `logits` `(n, classes)` and integer `labels`.
///
/// With `smoothing = ε`, the target is `(1 - ε)` on the true class plus
/// `ε / classes` on every class.
pub fn cross_entropy_loss<B: Backend>(
    logits: Tensor<B, 2>,
    labels: &[usize],
    smoothing: f64,
) -> Result<Tensor<B, 1>, TrainError> {
    let device = logits.device();
    let [n, classes] = logits.dims();
    if labels.len() != n {
        return Err(TrainError::InvalidBatch(format!(
            "{} labels for {n} logit rows",
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(TrainError::InvalidBatch(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }

    let off = (smoothing / classes as f64) as f32;
    let on = (1.0 - smoothing) as f32 + off;
    let targets: Vec<f32> = labels
        .iter()
        .flat_map(|&l| (0..classes).map(move |c| if c == l { on } else { off }))
        .collect();
    let targets = Tensor::<B, 2>::from_data(TensorData::new(targets, [n, classes]), &device);

    let log_probs = log_softmax(logits, 1);
    Ok((targets * log_probs).sum_dim(1).mean().neg())
}

/// Pairwise distance matrix `(n, n)` between embedding rows.
pub fn pairwise_distance<B: Backend>(
    embeddings: Tensor<B, 2>,
    metric: DistanceMetric,
) -> Tensor<B, 2> {
    let [n, _] = embeddings.dims();
    match metric {
        DistanceMetric::Euclidean => {
            let sq = embeddings.clone().powf_scalar(2.0).sum_dim(1); // (n, 1)
            let gram = embeddings.clone().matmul(embeddings.transpose());
            let d2 = sq.clone().expand([n, n]) + sq.transpose().expand([n, n])
                - gram.mul_scalar(2.0);
            d2.clamp_min(1e-12).sqrt()
        }
        DistanceMetric::Cosine => {
            let norm = embeddings
                .clone()
                .powf_scalar(2.0)
                .sum_dim(1)
                .sqrt()
                .clamp_min(1e-12);
            let unit = embeddings / norm;
            unit.clone().matmul(unit.transpose()).neg().add_scalar(1.0)
        }
    }
}

/// Anchors with at least one positive (other sample, same label) and one negative.
fn valid_anchors(labels: &[usize]) -> Vec<f32> {
    labels
        .iter()
        .enumerate()
        .map(|(i, &li)| {
            let has_pos = labels.iter().enumerate().any(|(j, &lj)| j != i && lj == li);
            let has_neg = labels.iter().any(|&lj| lj != li);
            (has_pos && has_neg) as u8 as f32
        })
        .collect()
}

/// Batch-hard triplet loss.
///
/// Per anchor: farthest positive and nearest negative in the batch,
/// `max(0, d_ap - d_an + margin)`, averaged over anchors that have both.
/// Anchors without a positive or a negative are left out of the mean.
pub fn batch_hard_triplet_loss<B: Backend>(
    dist: Tensor<B, 2>,
    labels: &[usize],
    margin: f64,
) -> Tensor<B, 1> {
    let device = dist.device();
    let n = labels.len();

    let pos = positive_mask::<B>(labels, &device);
    let not_neg = negative_mask::<B>(labels, &device).neg().add_scalar(1.0);

    // Distances are >= 0, so masked-out entries (0) never beat a real positive.
    let hardest_pos = (dist.clone() * pos).max_dim(1);
    // Non-negatives are lifted past the row maximum so they never win the
    // nearest-negative search, whatever the embedding scale.
    let row_max = dist.clone().max_dim(1).detach().add_scalar(1.0); // (n, 1)
    let hardest_neg = (dist + not_neg * row_max).min_dim(1);
    let hinge = (hardest_pos - hardest_neg)
        .add_scalar(margin)
        .clamp_min(0.0)
        .reshape([n]);

    let valid = valid_anchors(labels);
    let count: f32 = valid.iter().sum();
    if count == 0.0 {
        return hinge.sum().mul_scalar(0.0);
    }
    (hinge * vector_to_tensor::<B>(valid, &device))
        .sum()
        .div_scalar(count)
}

/// Batch-all triplet loss: hinge over every (anchor, positive, negative)
/// triplet in the batch, averaged over valid triplets.
pub fn batch_all_triplet_loss<B: Backend>(
    dist: Tensor<B, 2>,
    labels: &[usize],
    margin: f64,
) -> Tensor<B, 1> {
    let device = dist.device();
    let n = labels.len();

    let d_ap = dist.clone().unsqueeze_dim::<3>(2).expand([n, n, n]); // d(i, j)
    let d_an = dist.unsqueeze_dim::<3>(1).expand([n, n, n]); // d(i, k)
    let hinge = (d_ap - d_an).add_scalar(margin).clamp_min(0.0);

    let mut mask = Vec::with_capacity(n * n * n);
    for i in 0..n {
        for j in 0..n {
            for k in 0..n {
                let valid = j != i && labels[j] == labels[i] && labels[k] != labels[i];
                mask.push(valid as u8 as f32);
            }
        }
    }
    let count: f32 = mask.iter().sum();
    if count == 0.0 {
        return hinge.sum().mul_scalar(0.0);
    }
    let mask = Tensor::<B, 3>::from_data(TensorData::new(mask, [n, n, n]), &device);
    (hinge * mask).sum().div_scalar(count)
}

/// Inputs shared by every loss term for one batch.
pub struct LossBatch<'a, B: Backend> {
    /// `(n, dim)` feature embeddings.
    pub embeddings: Tensor<B, 2>,
    /// `(n, classes)` classifier logits.
    pub logits: Tensor<B, 2>,
    /// Dense identity label per row.
    pub labels: &'a [usize],
    /// Batch-hard (true) or batch-all (false) triplet selection.
    pub hard_mining: bool,
}

/// One weighted component of the composed loss.
pub trait LossTerm<B: Backend>: Send + Sync {
    /// Name used in metrics and logs.
    fn name(&self) -> &'static str;

    /// Non-negative weight in the composed sum.
    fn weight(&self) -> f64;

    /// Whether the term is undefined on a batch with a single identity.
    fn needs_negatives(&self) -> bool {
        false
    }

    /// Unweighted term value, shape `(1,)`.
    fn compute(&self, batch: &LossBatch<'_, B>) -> Result<Tensor<B, 1>, TrainError>;
}

/// Cross-entropy over the classifier logits.
#[derive(Debug, Clone)]
pub struct SoftmaxTerm {
    pub weight: f64,
    pub label_smooth: bool,
}

impl<B: Backend> LossTerm<B> for SoftmaxTerm {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn compute(&self, batch: &LossBatch<'_, B>) -> Result<Tensor<B, 1>, TrainError> {
        let eps = if self.label_smooth {
            LABEL_SMOOTHING_EPSILON
        } else {
            0.0
        };
        cross_entropy_loss(batch.logits.clone(), batch.labels, eps)
    }
}

/// Margin triplet loss over the embeddings.
#[derive(Debug, Clone)]
pub struct TripletTerm {
    pub weight: f64,
    pub margin: f64,
    pub distance: DistanceMetric,
}

impl<B: Backend> LossTerm<B> for TripletTerm {
    fn name(&self) -> &'static str {
        "triplet"
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn needs_negatives(&self) -> bool {
        true
    }

    fn compute(&self, batch: &LossBatch<'_, B>) -> Result<Tensor<B, 1>, TrainError> {
        let [n, _] = batch.embeddings.dims();
        if batch.labels.len() != n {
            return Err(TrainError::InvalidBatch(format!(
                "{} labels for {n} embedding rows",
                batch.labels.len()
            )));
        }
        let dist = pairwise_distance(batch.embeddings.clone(), self.distance);
        Ok(if batch.hard_mining {
            batch_hard_triplet_loss(dist, batch.labels, self.margin)
        } else {
            batch_all_triplet_loss(dist, batch.labels, self.margin)
        })
    }
}

/// Value of one term for a batch. `value` is `None` when the term was skipped
/// because its weight is zero.
#[derive(Debug, Clone, PartialEq)]
pub struct TermValue {
    pub name: &'static str,
    pub weight: f64,
    pub value: Option<f64>,
}

/// Composed loss for one batch.
pub struct LossOutput<B: Backend> {
    /// Weighted sum, shape `(1,)`, attached to the autograd graph.
    pub total: Tensor<B, 1>,
    /// Host copy of `total`.
    pub total_value: f64,
    /// Per-term breakdown in composer order.
    pub terms: Vec<TermValue>,
}

impl<B: Backend> LossOutput<B> {
    /// Unweighted value of a named term, if it was evaluated.
    pub fn term(&self, name: &str) -> Option<f64> {
        self.terms
            .iter()
            .find(|t| t.name == name)
            .and_then(|t| t.value)
    }
}

/// Weighted sum of loss terms.
pub struct LossComposer<B: Backend> {
    terms: Vec<Box<dyn LossTerm<B>>>,
    skip_zero_weight: bool,
    hard_mining: bool,
}

impl<B: Backend> LossComposer<B> {
    /// Compose the given terms. Zero-weight terms are skipped by default.
    ///
    /// # Errors
    /// `Config` if there are no terms, a weight is negative or non-finite, or
    /// every weight is zero.
    pub fn new(terms: Vec<Box<dyn LossTerm<B>>>) -> Result<Self, TrainError> {
        if terms.is_empty() {
            return Err(TrainError::config("loss composer needs at least one term"));
        }
        if let Some(t) = terms.iter().find(|t| !(t.weight().is_finite() && t.weight() >= 0.0)) {
            return Err(TrainError::config(format!(
                "loss term `{}` has invalid weight {}",
                t.name(),
                t.weight()
            )));
        }
        if terms.iter().all(|t| t.weight() == 0.0) {
            return Err(TrainError::config("all loss term weights are zero"));
        }
        Ok(LossComposer {
            terms,
            skip_zero_weight: true,
            hard_mining: true,
        })
    }

    /// Build the term list for `loss.name`.
    pub fn from_config(config: &ExperimentConfig) -> Result<Self, TrainError> {
        let loss = &config.loss;
        let terms: Vec<Box<dyn LossTerm<B>>> = match loss.name {
            LossFamily::Softmax => vec![Box::new(SoftmaxTerm {
                weight: 1.0,
                label_smooth: loss.softmax.label_smooth,
            })],
            LossFamily::Triplet => vec![
                Box::new(SoftmaxTerm {
                    weight: loss.triplet.weight_x,
                    label_smooth: loss.softmax.label_smooth,
                }),
                Box::new(TripletTerm {
                    weight: loss.triplet.weight_t,
                    margin: loss.triplet.margin,
                    distance: loss.triplet.distance,
                }),
            ],
        };
        let mut composer = Self::new(terms)?;
        composer.hard_mining = loss.triplet.hard_mining;
        Ok(composer)
    }

    /// Evaluate zero-weight terms too (they still contribute nothing to the total).
    pub fn with_skip_zero_weight(mut self, skip: bool) -> Self {
        self.skip_zero_weight = skip;
        self
    }

    /// Configured mining mode.
    pub fn hard_mining(&self) -> bool {
        self.hard_mining
    }

    /// `(name, weight)` of every term, in order.
    pub fn term_weights(&self) -> Vec<(&'static str, f64)> {
        self.terms.iter().map(|t| (t.name(), t.weight())).collect()
    }

    /// Compute `Σ weight_i * term_i` for a batch.
    ///
    /// # Errors
    /// - `DegenerateBatch` if the batch has fewer than 2 identities while a
    ///   term that needs negatives has a positive weight.
    /// - `InvalidBatch` on shape / label mismatches.
    /// - `NumericalInstability` if the total is NaN or infinite.
    pub fn compute(
        &self,
        embeddings: Tensor<B, 2>,
        logits: Tensor<B, 2>,
        labels: &[usize],
        is_hard_mining: bool,
    ) -> Result<LossOutput<B>, TrainError> {
        let identities = labels.iter().collect::<HashSet<_>>().len();
        if identities < 2
            && self
                .terms
                .iter()
                .any(|t| t.needs_negatives() && t.weight() > 0.0)
        {
            return Err(TrainError::DegenerateBatch { identities });
        }

        let batch = LossBatch {
            embeddings,
            logits,
            labels,
            hard_mining: is_hard_mining,
        };

        let mut total: Option<Tensor<B, 1>> = None;
        let mut values = Vec::with_capacity(self.terms.len());
        for term in &self.terms {
            let weight = term.weight();
            if weight == 0.0 && self.skip_zero_weight {
                values.push(TermValue {
                    name: term.name(),
                    weight,
                    value: None,
                });
                continue;
            }
            let value = term.compute(&batch)?;
            values.push(TermValue {
                name: term.name(),
                weight,
                value: Some(tensor_to_f64(value.clone())),
            });
            let weighted = value.mul_scalar(weight);
            total = Some(match total {
                Some(acc) => acc + weighted,
                None => weighted,
            });
        }

        // `new` guarantees at least one positive weight, which is never skipped.
        let total = total.ok_or_else(|| TrainError::config("no loss term was evaluated"))?;
        let total_value = tensor_to_f64(total.clone());
        if !total_value.is_finite() {
            return Err(TrainError::NumericalInstability {
                step: None,
                value: total_value,
            });
        }

        Ok(LossOutput {
            total,
            total_value,
            terms: values,
        })
    }
}
