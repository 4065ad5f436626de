//! Host ↔ device conversions.
//!
//! Scalars are read back here for logging; evaluation itself stays on device.

use burn::prelude::*;
use burn::tensor::TensorData;

/// Copy integer class targets to host.
pub fn targets_to_vec<B: Backend>(targets: Tensor<B, 1, Int>) -> Vec<i64> {
    targets.into_data().iter::<i64>().collect()
}

/// Read a single-element float tensor.
pub fn scalar_to_f64<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    let value: f32 = tensor.into_scalar().elem();
    value as f64
}

/// Build a `(rows, cols)` tensor from equal-length host rows.
///
/// # Panics
/// Panics if `rows` is empty or the rows have different lengths.
pub fn rows_to_tensor<B: Backend>(rows: &[Vec<f32>], device: &B::Device) -> Tensor<B, 2> {
    assert!(!rows.is_empty(), "rows must not be empty");
    let cols = rows[0].len();
    for (i, row) in rows.iter().enumerate() {
        assert_eq!(row.len(), cols, "row {i} has length {}, expected {cols}", row.len());
    }
    let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
    Tensor::from_data(TensorData::new(flat, [rows.len(), cols]), device)
}

pub fn targets_to_tensor<B: Backend>(targets: &[i64], device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::from_data(TensorData::new(targets.to_vec(), [targets.len()]), device)
}
