//! Synthetic collaborators for exercising the training core without images
//! or a real backbone: a seeded identity dataset with precomputed feature
//! vectors, a leave-one-out retrieval evaluator, and a recording exporter.

use burn::tensor::backend::AutodiffBackend;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::error::TrainError;
use crate::model::synthetic::SyntheticReidModel;
use crate::training::sampler::IdentityCatalog;
use crate::training::trainer::{EvalReport, EvalRequest, Evaluator, IdentityDataset, RankingExporter};

// ---------------------------------------------------------------------------
// SyntheticIdentityData
// ---------------------------------------------------------------------------

/// Shape of a generated dataset.
#[derive(Debug, Clone)]
pub struct SyntheticDataConfig {
    pub identities: usize,
    /// Samples per identity are drawn uniformly from `samples_min..=samples_max`.
    pub samples_min: usize,
    pub samples_max: usize,
    pub feature_dim: usize,
    /// Half-width of the uniform noise around each identity center.
    pub noise: f32,
    pub seed: u64,
}

impl Default for SyntheticDataConfig {
    fn default() -> Self {
        Self {
            identities: 16,
            samples_min: 2,
            samples_max: 10,
            feature_dim: 8,
            noise: 0.3,
            seed: 0,
        }
    }
}

/// Identity-clustered feature vectors: each identity has a random center in
/// `[-1, 1]^d`, its samples are the center plus uniform noise.
#[derive(Debug, Clone)]
pub struct SyntheticIdentityData {
    keys: Vec<u32>,
    features: Vec<Vec<f32>>,
}

impl SyntheticIdentityData {
    pub fn generate(config: &SyntheticDataConfig) -> Result<Self, TrainError> {
        if config.identities == 0 || config.feature_dim == 0 {
            return Err(TrainError::config("synthetic data needs identities > 0 and feature_dim > 0"));
        }
        if config.samples_min == 0 || config.samples_min > config.samples_max {
            return Err(TrainError::config(format!(
                "invalid samples range {}..={}",
                config.samples_min, config.samples_max
            )));
        }

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut samples: Vec<(u32, Vec<f32>)> = Vec::new();
        for id in 0..config.identities as u32 {
            let center: Vec<f32> = (0..config.feature_dim)
                .map(|_| rng.gen_range(-1.0..1.0))
                .collect();
            let count = rng.gen_range(config.samples_min..=config.samples_max);
            for _ in 0..count {
                let feature = center
                    .iter()
                    .map(|c| {
                        if config.noise > 0.0 {
                            c + rng.gen_range(-config.noise..config.noise)
                        } else {
                            *c
                        }
                    })
                    .collect();
                samples.push((id, feature));
            }
        }
        samples.shuffle(&mut rng);

        let (keys, features) = samples.into_iter().unzip();
        Ok(Self { keys, features })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[u32] {
        &self.keys
    }

    pub fn features(&self) -> &[Vec<f32>] {
        &self.features
    }

    pub fn build_catalog(&self) -> IdentityCatalog {
        IdentityCatalog::from_identities(self.keys.iter().copied())
    }

    /// Dense class label of every sample.
    pub fn labels(&self) -> Vec<usize> {
        let catalog = self.build_catalog();
        (0..self.len())
            .filter_map(|i| catalog.label(i))
            .collect()
    }
}

impl IdentityDataset for SyntheticIdentityData {
    fn catalog(&mut self, _epoch: usize) -> anyhow::Result<IdentityCatalog> {
        Ok(self.build_catalog())
    }
}

// ---------------------------------------------------------------------------
// RetrievalEvaluator
// ---------------------------------------------------------------------------

/// Models that can embed every catalog sample.
pub trait FeatureExtractor {
    fn extract_features(&self) -> anyhow::Result<Vec<Vec<f32>>>;
}

impl<B: AutodiffBackend, O> FeatureExtractor for SyntheticReidModel<B, O> {
    fn extract_features(&self) -> anyhow::Result<Vec<Vec<f32>>> {
        self.embed_all()
    }
}

/// Leave-one-out retrieval over the training catalog: every sample queries
/// all others.
pub struct RetrievalEvaluator {
    labels: Vec<usize>,
}

impl RetrievalEvaluator {
    pub fn new(labels: Vec<usize>) -> Self {
        Self { labels }
    }
}

impl<M: FeatureExtractor> Evaluator<M> for RetrievalEvaluator {
    fn evaluate(&mut self, model: &M, request: &EvalRequest) -> anyhow::Result<EvalReport> {
        let features = model.extract_features()?;
        retrieval_metrics(&features, &self.labels, request)
    }
}

fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
    v.iter().map(|x| x / norm).collect()
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// CMC at the requested ranks and mAP for leave-one-out retrieval.
///
/// Queries whose identity has no other sample are skipped.
pub fn retrieval_metrics(
    features: &[Vec<f32>],
    labels: &[usize],
    request: &EvalRequest,
) -> anyhow::Result<EvalReport> {
    if features.len() != labels.len() {
        anyhow::bail!("{} features for {} labels", features.len(), labels.len());
    }
    let features: Vec<Vec<f32>> = if request.normalize_feature {
        features.iter().map(|f| l2_normalize(f)).collect()
    } else {
        features.to_vec()
    };

    let mut hits = vec![0usize; request.ranks.len()];
    let mut ap_sum = 0.0;
    let mut queries = 0usize;
    for (q, query) in features.iter().enumerate() {
        let mut gallery: Vec<(f32, usize)> = features
            .iter()
            .enumerate()
            .filter(|&(g, _)| g != q)
            .map(|(g, f)| (squared_distance(query, f), g))
            .collect();
        if !gallery.iter().any(|&(_, g)| labels[g] == labels[q]) {
            continue;
        }
        gallery.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let matches: Vec<usize> = gallery
            .iter()
            .enumerate()
            .filter(|(_, entry)| labels[entry.1] == labels[q])
            .map(|(pos, _)| pos)
            .collect();
        let first = matches[0];
        for (slot, &rank) in request.ranks.iter().enumerate() {
            if first < rank {
                hits[slot] += 1;
            }
        }
        ap_sum += matches
            .iter()
            .enumerate()
            .map(|(found, &pos)| (found + 1) as f64 / (pos + 1) as f64)
            .sum::<f64>()
            / matches.len() as f64;
        queries += 1;
    }

    if queries == 0 {
        anyhow::bail!("no identity has more than one sample; nothing to retrieve");
    }
    let n = queries as f64;
    Ok(EvalReport {
        epoch: request.epoch,
        cmc: request
            .ranks
            .iter()
            .zip(hits)
            .map(|(&rank, h)| (rank, h as f64 / n))
            .collect(),
        map: Some(ap_sum / n),
    })
}

// ---------------------------------------------------------------------------
// RecordingExporter
// ---------------------------------------------------------------------------

/// Keeps every exported report in memory.
#[derive(Debug, Default)]
pub struct RecordingExporter {
    pub reports: Vec<EvalReport>,
}

impl RankingExporter for RecordingExporter {
    fn export(&mut self, report: &EvalReport) -> anyhow::Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}
