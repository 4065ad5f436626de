use burn::prelude::*;

/// Number of rows whose target is among the `k` highest scores, for each `k`.
///
/// Ranking happens once, with `topk_with_indices` at the largest requested `k`
/// (clamped to the number of classes); smaller `k` read a prefix of that
/// ranking. A target of `-1` never matches a class index.
pub fn top_k_hits<B: Backend>(scores: Tensor<B, 2>, targets: Tensor<B, 1, Int>, top_k: &[usize]) -> Vec<usize> {
    let [batch, num_classes] = scores.dims();
    let max_k = top_k.iter().copied().max().unwrap_or(0).min(num_classes);
    if batch == 0 || max_k == 0 {
        return vec![0; top_k.len()];
    }

    let (_, ranked) = scores.topk_with_indices(max_k, 1);
    let hits = ranked
        .equal(targets.reshape([batch, 1]).expand([batch, max_k]))
        .int();

    top_k
        .iter()
        .map(|&k| match k.min(num_classes) {
            0 => 0,
            k => {
                let correct: i64 = hits.clone().narrow(1, 0, k).sum().into_scalar().elem();
                correct as usize
            }
        })
        .collect()
}

/// Top-k accuracy, in percent, for each requested `k`.
///
/// Every `k` is clamped to the number of classes. The denominator is the full
/// batch, so ignored (`-1`) targets count as misses.
pub fn accuracy_at_k<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    top_k: &[usize],
) -> Vec<f64> {
    let [batch, _] = logits.dims();
    if batch == 0 {
        return vec![0.0; top_k.len()];
    }
    top_k_hits(logits, targets, top_k)
        .into_iter()
        .map(|correct| correct as f64 * 100.0 / batch as f64)
        .collect()
}

/// Weighted mean of `value` over `outs`, weighted by `weight`.
///
/// Returns `None` when the total weight is zero.
pub fn weighted_mean<T>(
    outs: &[T],
    value: impl Fn(&T) -> f64,
    weight: impl Fn(&T) -> usize,
) -> Option<f64> {
    let (sum, total) = outs.iter().fold((0.0, 0usize), |(sum, total), out| {
        let w = weight(out);
        (sum + value(out) * w as f64, total + w)
    });
    (total > 0).then(|| sum / total as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::TensorData;

    use crate::bridge::{rows_to_tensor, targets_to_tensor};

    type TestBackend = NdArray<f32>;

    fn accuracy(rows: &[Vec<f32>], targets: &[i64], top_k: &[usize]) -> Vec<f64> {
        let device = Default::default();
        accuracy_at_k(
            rows_to_tensor::<TestBackend>(rows, &device),
            targets_to_tensor::<TestBackend>(targets, &device),
            top_k,
        )
    }

    #[test]
    fn test_top1_and_top2() {
        let logits = vec![
            vec![0.9, 0.05, 0.05], // target 0: top-1 hit
            vec![0.5, 0.4, 0.1],   // target 1: top-2 hit
            vec![0.1, 0.2, 0.7],   // target 0: miss
            vec![0.3, 0.3, 0.4],   // ignored
        ];
        let acc = accuracy(&logits, &[0, 1, 0, -1], &[1, 2]);
        assert!((acc[0] - 25.0).abs() < 1e-9, "top-1 {}", acc[0]);
        assert!((acc[1] - 50.0).abs() < 1e-9, "top-2 {}", acc[1]);
    }

    #[test]
    fn test_k_clamped_to_classes() {
        let logits = vec![vec![0.1, 0.9], vec![0.8, 0.2]];
        let acc = accuracy(&logits, &[0, 1], &[1, 5]);
        assert_eq!(acc[0], 0.0);
        assert_eq!(acc[1], 100.0, "with two classes top-5 covers everything");
    }

    #[test]
    fn test_hits_per_k() {
        let device = Default::default();
        let scores = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.1_f32, 0.2, 0.3, 0.4], [0.4, 0.3, 0.2, 0.1], [0.3, 1.0, 0.2, 0.0]]),
            &device,
        );
        // ranks of the targets: 3rd, 1st, 4th
        let targets = targets_to_tensor::<TestBackend>(&[1, 0, 3], &device);
        assert_eq!(top_k_hits(scores, targets, &[1, 3, 0]), vec![1, 2, 0]);
    }

    #[test]
    fn test_tensor_entry_point() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[2.0_f32, 1.0], [0.0, 3.0]]),
            &device,
        );
        let targets = Tensor::<TestBackend, 1, Int>::from_data(TensorData::from([0_i64, 0]), &device);
        let acc = accuracy_at_k(logits, targets, &[1]);
        assert!((acc[0] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_mean() {
        // (value, batch_size)
        let outs = [(1.0, 10_usize), (4.0, 30)];
        let mean = weighted_mean(&outs, |o| o.0, |o| o.1).unwrap();
        assert!((mean - 3.25).abs() < 1e-12, "got {mean}");
    }

    #[test]
    fn test_weighted_mean_empty() {
        let outs: [(f64, usize); 0] = [];
        assert!(weighted_mean(&outs, |o| o.0, |o| o.1).is_none());
        assert!(weighted_mean(&[(5.0, 0_usize)], |o| o.0, |o| o.1).is_none());
    }
}
