//! Tensor bridge: conversions between host-side `Vec<f32>` rows / label
//! slices and burn tensors.
//!
//! Feature extraction happens outside the core and hands over plain vectors;
//! the loss terms need `Tensor<B, 2>` inputs and host-built identity masks.

use burn::prelude::*;
use burn::tensor::TensorData;

use crate::error::TrainError;

/// Convert a batch of f32 rows to a burn 2D tensor of shape `(rows, dim)`.
///
/// # Errors
/// `InvalidBatch` if `rows` is empty, has zero width, or rows differ in length.
pub fn rows_to_tensor<B: Backend>(
    rows: &[Vec<f32>],
    device: &B::Device,
) -> Result<Tensor<B, 2>, TrainError> {
    let Some(first) = rows.first() else {
        return Err(TrainError::InvalidBatch("no rows to convert".to_string()));
    };
    let dim = first.len();
    if dim == 0 {
        return Err(TrainError::InvalidBatch("row dimension must be > 0".to_string()));
    }
    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != dim) {
        return Err(TrainError::InvalidBatch(format!(
            "row {i} has length {}, expected {dim}",
            row.len()
        )));
    }

    let flat: Vec<f32> = rows.iter().flat_map(|v| v.iter().copied()).collect();
    Ok(Tensor::from_data(TensorData::new(flat, [rows.len(), dim]), device))
}

/// Extract the rows of a 2D tensor as `Vec<f32>`s.
pub fn tensor_to_rows<B: Backend>(tensor: Tensor<B, 2>) -> Result<Vec<Vec<f32>>, TrainError> {
    let [_, dim] = tensor.dims();
    let flat = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| TrainError::InvalidBatch(format!("cannot read tensor data: {e:?}")))?;
    if dim == 0 {
        return Ok(Vec::new());
    }
    Ok(flat.chunks(dim).map(|c| c.to_vec()).collect())
}

/// Extract a single f64 scalar from a burn 1D tensor.
///
/// # Panics
/// Panics if the tensor does not contain exactly one element.
pub fn tensor_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// `(n, n)` float mask: 1 where samples `i != j` share a label.
pub fn positive_mask<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 2> {
    let n = labels.len();
    let data: Vec<f32> = (0..n)
        .flat_map(|i| (0..n).map(move |j| (i != j && labels[i] == labels[j]) as u8 as f32))
        .collect();
    Tensor::from_data(TensorData::new(data, [n, n]), device)
}

/// `(n, n)` float mask: 1 where samples have different labels.
pub fn negative_mask<B: Backend>(labels: &[usize], device: &B::Device) -> Tensor<B, 2> {
    let n = labels.len();
    let data: Vec<f32> = (0..n)
        .flat_map(|i| (0..n).map(move |j| (labels[i] != labels[j]) as u8 as f32))
        .collect();
    Tensor::from_data(TensorData::new(data, [n, n]), device)
}

/// 1D float tensor from host values.
pub fn vector_to_tensor<B: Backend>(values: Vec<f32>, device: &B::Device) -> Tensor<B, 1> {
    let n = values.len();
    Tensor::from_data(TensorData::new(values, [n]), device)
}
