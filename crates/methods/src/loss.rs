//! Cross-entropy with an ignore label.

use burn::prelude::*;
use burn::tensor::activation::log_softmax;

/// Target value excluded from the loss, the accuracy numerator and k-NN votes.
pub const IGNORE_INDEX: i64 = -1;

/// Mean cross-entropy over the targets that are not [`IGNORE_INDEX`].
///
/// # Arguments
/// - `logits`: shape `(batch, num_classes)`
/// - `targets`: shape `(batch,)`, class indices or `-1`
///
/// # Returns
/// Scalar loss tensor of shape `(1,)`. Returns 0 when every target is ignored.
///
/// burn's `CrossEntropyLossConfig::with_pad_tokens` only masks rows whose
/// target is a valid class index; those targets are still gathered, so a `-1`
/// would index out of bounds. Ignored rows are clamped and masked here instead.
pub fn cross_entropy_with_ignore<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let [batch, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);

    let valid = targets.clone().equal_elem(IGNORE_INDEX).bool_not().float();
    // ignored rows gather class 0 and are masked out below
    let index = targets.clamp_min(0).reshape([batch, 1]);
    let picked = log_probs.gather(1, index).reshape([batch]);

    let valid_count = valid.clone().sum().clamp_min(1.0);
    (picked.neg() * valid).sum() / valid_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::TensorData;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn loss_of(logits: [[f32; 3]; 2], targets: [i64; 2]) -> f32 {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(TensorData::from(logits), &device);
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from(targets), &device);
        cross_entropy_with_ignore(logits, targets).into_scalar().elem()
    }

    #[test]
    fn test_uniform_logits() {
        let loss = loss_of([[0.0; 3], [0.0; 3]], [0, 2]);
        let expected = 3.0_f32.ln();
        assert!((loss - expected).abs() < 1e-5, "expected {expected}, got {loss}");
    }

    #[test]
    fn test_confident_correct() {
        let loss = loss_of([[20.0, 0.0, 0.0], [0.0, 0.0, 20.0]], [0, 2]);
        assert!(loss < 1e-4, "confident correct predictions should give ~0 loss, got {loss}");
    }

    #[test]
    fn test_ignored_rows_do_not_count() {
        // second row is confidently wrong but ignored
        let with_ignore = loss_of([[0.0; 3], [20.0, 0.0, 0.0]], [1, -1]);
        let expected = 3.0_f32.ln();
        assert!((with_ignore - expected).abs() < 1e-5, "expected {expected}, got {with_ignore}");
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let loss = loss_of([[1.0, 2.0, 3.0], [3.0, 2.0, 1.0]], [-1, -1]);
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn test_gradient_skips_ignored_rows() {
        let device = Default::default();
        let logits = Tensor::<TestAutodiffBackend, 2>::from_data(
            TensorData::from([[1.0_f32, 2.0, 3.0], [3.0, 2.0, 1.0]]),
            &device,
        )
        .require_grad();
        let targets =
            Tensor::<TestAutodiffBackend, 1, Int>::from_data(TensorData::from([0_i64, -1]), &device);
        let grads = cross_entropy_with_ignore(logits.clone(), targets).backward();
        let grad: Vec<f32> = logits.grad(&grads).unwrap().into_data().iter::<f32>().collect();
        assert!(grad[..3].iter().any(|g| g.abs() > 1e-6), "valid row should get gradient");
        assert!(grad[3..].iter().all(|g| g.abs() < 1e-7), "ignored row got gradient {grad:?}");
    }
}
