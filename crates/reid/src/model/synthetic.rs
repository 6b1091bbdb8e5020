//! Small trainable re-identification network over precomputed feature
//! vectors: a linear embedding layer followed by a linear identity
//! classifier, trained with AdamW.
//!
//! Weights are drawn from a host `StdRng`, so two models built from the same
//! config are bit-identical regardless of the backend's global RNG.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::Param;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::bridge::{rows_to_tensor, tensor_to_rows};
use crate::training::trainer::{ModelOutput, ReidModel};

/// Configuration for [`SyntheticReidNet`] and its optimizer.
#[derive(Config, Debug)]
pub struct SyntheticModelConfig {
    /// Input feature dimension.
    pub d_input: usize,
    /// Number of identity classes.
    pub num_classes: usize,
    /// Embedding dimension.
    #[config(default = 16)]
    pub d_embedding: usize,
    /// Gradient norm clip for AdamW.
    #[config(default = 5.0)]
    pub max_grad_norm: f32,
    /// Seed for weight initialization.
    #[config(default = 0)]
    pub seed: u64,
}

/// Linear embedding + linear classifier.
#[derive(Module, Debug)]
pub struct SyntheticReidNet<B: Backend> {
    /// (d_input, d_embedding)
    projection: Param<Tensor<B, 2>>,
    /// (d_embedding,)
    bias: Param<Tensor<B, 1>>,
    /// (d_embedding, num_classes)
    classifier: Param<Tensor<B, 2>>,
}

/// Xavier-uniform matrix of shape `(rows, cols)`.
fn xavier<B: Backend>(rng: &mut StdRng, rows: usize, cols: usize, device: &B::Device) -> Tensor<B, 2> {
    let bound = (6.0 / (rows + cols) as f64).sqrt() as f32;
    let values: Vec<f32> = (0..rows * cols).map(|_| rng.gen_range(-bound..bound)).collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

impl SyntheticModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SyntheticReidNet<B> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        SyntheticReidNet {
            projection: Param::from_tensor(xavier(&mut rng, self.d_input, self.d_embedding, device)),
            bias: Param::from_tensor(Tensor::zeros([self.d_embedding], device)),
            classifier: Param::from_tensor(xavier(&mut rng, self.d_embedding, self.num_classes, device)),
        }
    }

    /// Network plus AdamW (`weight_decay`, gradient-norm clipping) over the
    /// per-sample `features`.
    pub fn build<B: AutodiffBackend>(
        &self,
        weight_decay: f64,
        features: Vec<Vec<f32>>,
        device: &B::Device,
    ) -> SyntheticReidModel<B, impl Optimizer<SyntheticReidNet<B>, B>> {
        let optimizer = AdamWConfig::new()
            .with_weight_decay(weight_decay as f32)
            .with_grad_clipping(Some(GradientClippingConfig::Norm(self.max_grad_norm)))
            .init::<B, SyntheticReidNet<B>>();
        SyntheticReidModel {
            net: self.init(device),
            optimizer,
            features,
            device: device.clone(),
        }
    }
}

impl<B: Backend> SyntheticReidNet<B> {
    /// Returns `(embeddings, logits)` for `(n, d_input)` features.
    pub fn forward(&self, features: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let embeddings =
            features.matmul(self.projection.val()) + self.bias.val().unsqueeze_dim::<2>(0);
        let logits = embeddings.clone().matmul(self.classifier.val());
        (embeddings, logits)
    }
}

/// [`SyntheticReidNet`] bound to its optimizer and the feature table it reads
/// batches from.
pub struct SyntheticReidModel<B: AutodiffBackend, O> {
    net: SyntheticReidNet<B>,
    optimizer: O,
    features: Vec<Vec<f32>>,
    device: B::Device,
}

impl<B: AutodiffBackend, O> SyntheticReidModel<B, O> {
    pub fn net(&self) -> &SyntheticReidNet<B> {
        &self.net
    }

    pub fn num_samples(&self) -> usize {
        self.features.len()
    }

    fn gather(&self, batch: &[usize]) -> anyhow::Result<Tensor<B, 2>> {
        let rows = batch
            .iter()
            .map(|&i| {
                self.features.get(i).cloned().ok_or_else(|| {
                    anyhow::anyhow!("sample {i} out of range ({} features)", self.features.len())
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(rows_to_tensor::<B>(&rows, &self.device)?)
    }

    /// Embeddings of every sample, in catalog order.
    pub fn embed_all(&self) -> anyhow::Result<Vec<Vec<f32>>> {
        let all: Vec<usize> = (0..self.features.len()).collect();
        let (embeddings, _) = self.net.forward(self.gather(&all)?);
        Ok(tensor_to_rows(embeddings)?)
    }
}

impl<B, O> ReidModel<B> for SyntheticReidModel<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<SyntheticReidNet<B>, B>,
{
    fn forward(&mut self, batch: &[usize]) -> anyhow::Result<ModelOutput<B>> {
        let (embeddings, logits) = self.net.forward(self.gather(batch)?);
        Ok(ModelOutput { embeddings, logits })
    }

    fn step(&mut self, loss: Tensor<B, 1>, lr: f64) -> anyhow::Result<()> {
        let grads = GradientsParams::from_grads(loss.backward(), &self.net);
        self.net = self.optimizer.step(lr, self.net.clone(), grads);
        Ok(())
    }
}
