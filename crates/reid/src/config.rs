//! YAML experiment configuration.
//!
//! Mirrors the section layout of the experiment files in `configs/`
//! (`model`, `data`, `sampler`, `loss`, `train`, `test`, plus dataset-specific
//! sections). Only the fields the training core consumes are typed; everything
//! else is kept as opaque `serde_yaml::Value` pass-through for the external
//! collaborators. String tags (sampler, loss family, scheduler policy) are
//! closed enums, so an unknown tag fails at load time.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::TrainError;

/// Opaque key/value pairs owned by external collaborators.
pub type Passthrough = BTreeMap<String, Value>;

/// Top-level structure of an experiment YAML file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExperimentConfig {
    /// Model factory options (opaque to the core).
    #[serde(default)]
    pub model: Passthrough,
    /// Dataset / augmentation options.
    #[serde(default)]
    pub data: DataSection,
    /// Batch sampler options.
    #[serde(default)]
    pub sampler: SamplerSection,
    /// Loss family and term weights.
    #[serde(default)]
    pub loss: LossSection,
    /// Optimization and schedule options.
    #[serde(default)]
    pub train: TrainSection,
    /// Evaluation cadence and reporting options.
    #[serde(default)]
    pub test: TestSection,
    /// Any other top-level section (e.g. `soccernetv3`).
    #[serde(flatten)]
    pub extra: Passthrough,
}

/// `data.*`: only `save_dir` and `workers` are read by the core.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DataSection {
    /// Directory for run outputs (summaries, exported reports).
    #[serde(default = "default_save_dir")]
    pub save_dir: String,
    /// Number of data-loading workers (owned by the dataset collaborator).
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(flatten)]
    pub extra: Passthrough,
}

/// Sampler strategy identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SamplerKind {
    /// P identities × K instances per batch.
    RandomIdentitySampler,
}

/// `sampler.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SamplerSection {
    #[serde(default = "default_sampler_kind")]
    pub train_sampler: SamplerKind,
    /// Sampler for the secondary (target) training stream.
    #[serde(default = "default_sampler_kind")]
    pub train_sampler_t: SamplerKind,
    /// Instances per identity in a batch (K).
    #[serde(default = "default_num_instances")]
    pub num_instances: usize,
}

/// Loss family identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LossFamily {
    /// Cross-entropy only.
    Softmax,
    /// Weighted cross-entropy + triplet.
    Triplet,
}

/// Embedding-space distance used by the triplet term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cos(a, b)`.
    Cosine,
}

/// `loss.softmax.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SoftmaxSection {
    #[serde(default = "default_true")]
    pub label_smooth: bool,
}

/// `loss.triplet.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TripletSection {
    #[serde(default = "default_margin")]
    pub margin: f64,
    /// Weight of the triplet term.
    #[serde(default = "default_weight_t")]
    pub weight_t: f64,
    /// Weight of the cross-entropy term.
    #[serde(default)]
    pub weight_x: f64,
    /// Batch-hard mining (hardest positive / negative per anchor). When false,
    /// every valid triplet in the batch contributes.
    #[serde(default = "default_true")]
    pub hard_mining: bool,
    #[serde(default)]
    pub distance: DistanceMetric,
}

/// `loss.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LossSection {
    #[serde(default = "default_loss_family")]
    pub name: LossFamily,
    #[serde(default)]
    pub softmax: SoftmaxSection,
    #[serde(default)]
    pub triplet: TripletSection,
}

/// Post-warmup learning-rate policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicy {
    Cosine,
    /// Multiply by `gamma` at every epoch listed in `stepsize`.
    #[serde(alias = "multi_step", alias = "single_step", alias = "step")]
    Staged,
}

/// What the orchestrator does when a step produces a NaN/Inf loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NonFinitePolicy {
    /// Stop the run with `NumericalInstability`.
    #[default]
    Abort,
    /// Drop the step (no optimizer update, step counter unchanged) and continue.
    SkipStep,
}

/// `stepsize` accepts a single epoch or a list of epochs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
enum StepSize {
    One(usize),
    Many(Vec<usize>),
}

fn deserialize_stepsize<'de, D>(deserializer: D) -> Result<Vec<usize>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match StepSize::deserialize(deserializer)? {
        StepSize::One(epoch) => vec![epoch],
        StepSize::Many(epochs) => epochs,
    })
}

/// `train.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrainSection {
    /// Total batch size (B).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    /// `None` keeps the rate constant after warmup.
    #[serde(default)]
    pub lr_scheduler: Option<LrPolicy>,
    /// Epoch boundaries for staged decay.
    #[serde(default, deserialize_with = "deserialize_stepsize")]
    pub stepsize: Vec<usize>,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    #[serde(default = "default_warmup_factor")]
    pub warmup_factor: f64,
    /// Warmup length in optimizer steps; 0 disables warmup.
    #[serde(default)]
    pub warmup_iters: usize,
    /// Floor for the cosine policy.
    #[serde(default = "default_min_lr")]
    pub min_lr: f64,
    #[serde(default = "default_max_epoch")]
    pub max_epoch: usize,
    #[serde(default)]
    pub start_epoch: usize,
    #[serde(default = "default_print_freq")]
    pub print_freq: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub nonfinite_policy: NonFinitePolicy,
    #[serde(flatten)]
    pub extra: Passthrough,
}

/// `test.*`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestSection {
    /// Evaluate every `eval_freq` epochs; `<= 0` evaluates only after the last epoch.
    #[serde(default = "default_eval_freq")]
    pub eval_freq: i64,
    /// CMC ranks to report.
    #[serde(default = "default_ranks")]
    pub ranks: Vec<usize>,
    #[serde(default)]
    pub export_ranking_results: bool,
    #[serde(default)]
    pub normalize_feature: bool,
    #[serde(flatten)]
    pub extra: Passthrough,
}

fn default_save_dir() -> String {
    "log".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_sampler_kind() -> SamplerKind {
    SamplerKind::RandomIdentitySampler
}
fn default_num_instances() -> usize {
    4
}
fn default_true() -> bool {
    true
}
fn default_margin() -> f64 {
    0.3
}
fn default_weight_t() -> f64 {
    1.0
}
fn default_loss_family() -> LossFamily {
    LossFamily::Softmax
}
fn default_batch_size() -> usize {
    32
}
fn default_lr() -> f64 {
    0.0003
}
fn default_weight_decay() -> f64 {
    5e-4
}
fn default_gamma() -> f64 {
    0.1
}
fn default_warmup_factor() -> f64 {
    0.01
}
fn default_min_lr() -> f64 {
    1e-7
}
fn default_max_epoch() -> usize {
    60
}
fn default_print_freq() -> usize {
    20
}
fn default_seed() -> u64 {
    1
}
fn default_eval_freq() -> i64 {
    -1
}
fn default_ranks() -> Vec<usize> {
    vec![1, 5, 10, 20]
}

impl Default for DataSection {
    fn default() -> Self {
        Self {
            save_dir: default_save_dir(),
            workers: default_workers(),
            extra: Passthrough::new(),
        }
    }
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            train_sampler: default_sampler_kind(),
            train_sampler_t: default_sampler_kind(),
            num_instances: default_num_instances(),
        }
    }
}

impl Default for SoftmaxSection {
    fn default() -> Self {
        Self { label_smooth: true }
    }
}

impl Default for TripletSection {
    fn default() -> Self {
        Self {
            margin: default_margin(),
            weight_t: default_weight_t(),
            weight_x: 0.0,
            hard_mining: true,
            distance: DistanceMetric::Euclidean,
        }
    }
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            name: default_loss_family(),
            softmax: SoftmaxSection::default(),
            triplet: TripletSection::default(),
        }
    }
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lr: default_lr(),
            weight_decay: default_weight_decay(),
            lr_scheduler: None,
            stepsize: Vec::new(),
            gamma: default_gamma(),
            warmup_factor: default_warmup_factor(),
            warmup_iters: 0,
            min_lr: default_min_lr(),
            max_epoch: default_max_epoch(),
            start_epoch: 0,
            print_freq: default_print_freq(),
            seed: default_seed(),
            nonfinite_policy: NonFinitePolicy::Abort,
            extra: Passthrough::new(),
        }
    }
}

impl Default for TestSection {
    fn default() -> Self {
        Self {
            eval_freq: default_eval_freq(),
            ranks: default_ranks(),
            export_ranking_results: false,
            normalize_feature: false,
            extra: Passthrough::new(),
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: Passthrough::new(),
            data: DataSection::default(),
            sampler: SamplerSection::default(),
            loss: LossSection::default(),
            train: TrainSection::default(),
            test: TestSection::default(),
            extra: Passthrough::new(),
        }
    }
}

impl ExperimentConfig {
    /// Parse and validate a config from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, TrainError> {
        Self::from_yaml_with_overrides(yaml, &[])
    }

    /// Parse YAML, apply dotted `key=value` overrides to the raw tree, then
    /// deserialize and validate.
    pub fn from_yaml_with_overrides(yaml: &str, overrides: &[String]) -> Result<Self, TrainError> {
        let mut tree: Value = serde_yaml::from_str(yaml)
            .map_err(|e| TrainError::config(format!("invalid YAML: {e}")))?;
        if tree.is_null() {
            tree = Value::Mapping(Mapping::new());
        }
        for raw in overrides {
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                TrainError::config(format!("override `{raw}` is not of the form key=value"))
            })?;
            apply_override(&mut tree, key.trim(), value.trim())?;
        }
        let config: ExperimentConfig = serde_yaml::from_value(tree)
            .map_err(|e| TrainError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load, override and validate a config file.
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self, TrainError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| TrainError::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_yaml_with_overrides(&contents, overrides)?;
        tracing::info!(
            path = %path.display(),
            overrides = overrides.len(),
            "Loaded experiment config"
        );
        Ok(config)
    }

    /// Number of identities per batch (P = B / K).
    pub fn identities_per_batch(&self) -> usize {
        self.train.batch_size / self.sampler.num_instances.max(1)
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<(), TrainError> {
        let k = self.sampler.num_instances;
        let b = self.train.batch_size;
        if k == 0 {
            return Err(TrainError::config("sampler.num_instances must be > 0"));
        }
        if b == 0 {
            return Err(TrainError::config("train.batch_size must be > 0"));
        }
        if b % k != 0 {
            return Err(TrainError::config(format!(
                "train.batch_size ({b}) must be divisible by sampler.num_instances ({k})"
            )));
        }

        let t = &self.loss.triplet;
        for (name, w) in [("weight_t", t.weight_t), ("weight_x", t.weight_x)] {
            if !w.is_finite() || w < 0.0 {
                return Err(TrainError::config(format!(
                    "loss.triplet.{name} must be a non-negative number, got {w}"
                )));
            }
        }
        if self.loss.name == LossFamily::Triplet && t.weight_t == 0.0 && t.weight_x == 0.0 {
            return Err(TrainError::config(
                "loss.triplet.weight_t and weight_x are both zero; nothing to optimize",
            ));
        }
        if !t.margin.is_finite() {
            return Err(TrainError::config("loss.triplet.margin must be finite"));
        }

        let tr = &self.train;
        if !(tr.lr.is_finite() && tr.lr > 0.0) {
            return Err(TrainError::config(format!("train.lr must be > 0, got {}", tr.lr)));
        }
        if !(tr.warmup_factor > 0.0 && tr.warmup_factor <= 1.0) {
            return Err(TrainError::config(format!(
                "train.warmup_factor must be in (0, 1], got {}",
                tr.warmup_factor
            )));
        }
        if !(tr.gamma > 0.0 && tr.gamma <= 1.0) {
            return Err(TrainError::config(format!(
                "train.gamma must be in (0, 1], got {}",
                tr.gamma
            )));
        }
        if !(tr.min_lr.is_finite() && tr.min_lr >= 0.0) {
            return Err(TrainError::config("train.min_lr must be >= 0"));
        }
        if tr.max_epoch == 0 {
            return Err(TrainError::config("train.max_epoch must be > 0"));
        }
        if tr.start_epoch >= tr.max_epoch {
            return Err(TrainError::config(format!(
                "train.start_epoch ({}) must be < train.max_epoch ({})",
                tr.start_epoch, tr.max_epoch
            )));
        }
        if tr.stepsize.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TrainError::config(format!(
                "train.stepsize must be strictly increasing, got {:?}",
                tr.stepsize
            )));
        }
        if tr.lr_scheduler == Some(LrPolicy::Staged) && tr.stepsize.is_empty() {
            tracing::warn!("Staged lr_scheduler without stepsize; rate stays at base_lr");
        }

        if self.test.ranks.is_empty() || self.test.ranks.contains(&0) {
            return Err(TrainError::config(format!(
                "test.ranks must be non-empty positive ranks, got {:?}",
                self.test.ranks
            )));
        }
        Ok(())
    }
}

/// Set `dotted.key` in a YAML tree, creating intermediate mappings.
///
/// The value is parsed as a YAML scalar so `train.lr=0.001` becomes a number
/// and `test.evaluate=true` a bool.
pub fn apply_override(tree: &mut Value, key: &str, raw_value: &str) -> Result<(), TrainError> {
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(TrainError::config(format!("invalid override key `{key}`")));
    }
    let value: Value = serde_yaml::from_str(raw_value)
        .unwrap_or_else(|_| Value::String(raw_value.to_string()));

    let parts: Vec<&str> = key.split('.').collect();
    set_path(tree, &parts, value, key)
}

fn set_path(node: &mut Value, parts: &[&str], value: Value, key: &str) -> Result<(), TrainError> {
    let Value::Mapping(map) = node else {
        return Err(TrainError::config(format!(
            "override `{key}`: `{}` is nested under a non-mapping value",
            parts[0]
        )));
    };
    let k = Value::String(parts[0].to_string());
    if parts.len() == 1 {
        map.insert(k, value);
        return Ok(());
    }
    let child = map
        .entry(k)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if child.is_null() {
        *child = Value::Mapping(Mapping::new());
    }
    set_path(child, &parts[1..], value, key)
}
