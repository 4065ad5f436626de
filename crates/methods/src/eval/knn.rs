//! Weighted k-nearest-neighbour classifier over accumulated features.
//!
//! Train features are gathered during the training epoch and test features
//! during validation, as device tensors. [`WeightedKnnClassifier::compute`]
//! scores the test set in chunks against the whole train bank: one matmul per
//! chunk for the similarities, `topk_with_indices` for the neighbours and a
//! scatter-add of their weights into per-class votes. Both banks are cleared
//! afterwards.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::MethodError;
use crate::eval::metrics::top_k_hits;

/// How neighbours are ranked and weighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceFn {
    /// Weight `1 / (d + eps)` with `d` the L2 distance.
    #[default]
    Euclidean,
    /// Features L2-normalized; weight `exp(s / T)` with `s` the dot product.
    Cosine,
}

impl fmt::Display for DistanceFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceFn::Euclidean => write!(f, "euclidean"),
            DistanceFn::Cosine => write!(f, "cosine"),
        }
    }
}

impl FromStr for DistanceFn {
    type Err = MethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "euclidean" => Ok(DistanceFn::Euclidean),
            "cosine" => Ok(DistanceFn::Cosine),
            other => Err(MethodError::InvalidConfig(format!(
                "knn distance '{other}' not in (euclidean, cosine)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WeightedKnnClassifier<B: Backend> {
    k: usize,
    temperature: f64,
    distance: DistanceFn,
    epsilon: f64,
    /// Test rows scored per similarity matmul.
    chunk_size: usize,
    train_features: Vec<Tensor<B, 2>>,
    train_targets: Vec<Tensor<B, 1, Int>>,
    test_features: Vec<Tensor<B, 2>>,
    test_targets: Vec<Tensor<B, 1, Int>>,
}

impl<B: Backend> Default for WeightedKnnClassifier<B> {
    fn default() -> Self {
        Self::new(20, DistanceFn::Euclidean)
    }
}

impl<B: Backend> WeightedKnnClassifier<B> {
    pub fn new(k: usize, distance: DistanceFn) -> Self {
        Self {
            k,
            temperature: 0.07,
            distance,
            epsilon: 1e-5,
            chunk_size: 256,
            train_features: Vec::new(),
            train_targets: Vec::new(),
            test_features: Vec::new(),
            test_targets: Vec::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn distance(&self) -> DistanceFn {
        self.distance
    }

    pub fn num_train(&self) -> usize {
        rows(&self.train_targets)
    }

    pub fn num_test(&self) -> usize {
        rows(&self.test_targets)
    }

    /// Accumulate train features `(n, dim)` and their targets `(n,)`.
    ///
    /// Rows targeted `-1` are kept in the bank but never vote.
    pub fn add_train(&mut self, features: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        debug_assert_eq!(features.dims()[0], targets.dims()[0]);
        self.train_features.push(features.detach());
        self.train_targets.push(targets);
    }

    /// Accumulate test features `(n, dim)` and their targets `(n,)`.
    pub fn add_test(&mut self, features: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        debug_assert_eq!(features.dims()[0], targets.dims()[0]);
        self.test_features.push(features.detach());
        self.test_targets.push(targets);
    }

    pub fn reset(&mut self) {
        self.train_features.clear();
        self.train_targets.clear();
        self.test_features.clear();
        self.test_targets.clear();
    }

    /// Top-1 and top-5 accuracy in percent over the accumulated test set.
    ///
    /// Both sets are cleared afterwards. Returns `(0, 0)` when either set is
    /// empty.
    pub fn compute(&mut self) -> (f64, f64) {
        let result = self.classify();
        self.reset();
        result
    }

    fn classify(&self) -> (f64, f64) {
        let num_train = self.num_train();
        let num_test = self.num_test();
        if num_train == 0 || num_test == 0 {
            tracing::warn!(
                train = num_train,
                test = num_test,
                "k-NN evaluation skipped: empty feature bank"
            );
            return (0.0, 0.0);
        }

        let train = Tensor::cat(self.train_features.clone(), 0);
        let train_targets = Tensor::cat(self.train_targets.clone(), 0);
        let test = Tensor::cat(self.test_features.clone(), 0);
        let test_targets = Tensor::cat(self.test_targets.clone(), 0);
        let device = train.device();

        let max_label: i64 = Tensor::cat(vec![train_targets.clone(), test_targets.clone()], 0)
            .max()
            .into_scalar()
            .elem();
        let num_classes = max_label.max(0) as usize + 1;
        let k = self.k.clamp(1, num_train);
        let top5 = 5.min(k).min(num_classes);

        let train = match self.distance {
            DistanceFn::Cosine => l2_normalize(train),
            DistanceFn::Euclidean => train,
        };
        let train_sq = train.clone().powf_scalar(2.0).sum_dim(1).reshape([1, num_train]);
        let train_t = train.transpose();
        let labeled = train_targets
            .clone()
            .greater_equal_elem(0)
            .float()
            .reshape([1, num_train]);
        let labels = train_targets.clamp_min(0);

        let mut correct = [0usize; 2];
        let mut start = 0;
        while start < num_test {
            let len = self.chunk_size.min(num_test - start);
            let chunk = test.clone().narrow(0, start, len);
            let weights = self.weights(chunk, train_t.clone(), train_sq.clone());

            // unlabeled rows score -1: ranked last, and clamped to a zero vote
            let mask = labeled.clone().expand([len, num_train]);
            let weights = weights * mask.clone() + mask.sub_scalar(1.0);

            let (top_weights, top_index) = weights.topk_with_indices(k, 1);
            let neighbour_labels = labels
                .clone()
                .select(0, top_index.reshape([len * k]))
                .reshape([len, k]);
            let votes = Tensor::<B, 2>::zeros([len, num_classes], &device).scatter(
                1,
                neighbour_labels,
                top_weights.clamp_min(0.0),
            );

            let hits = top_k_hits(votes, test_targets.clone().narrow(0, start, len), &[1, top5]);
            correct[0] += hits[0];
            correct[1] += hits[1];
            start += len;
        }

        let total = num_test as f64;
        (correct[0] as f64 * 100.0 / total, correct[1] as f64 * 100.0 / total)
    }

    /// Vote weights `(chunk, num_train)` of each chunk row against the bank.
    ///
    /// `train_t` is the transposed bank `(dim, num_train)`; `train_sq` its
    /// squared row norms `(1, num_train)`.
    fn weights(&self, chunk: Tensor<B, 2>, train_t: Tensor<B, 2>, train_sq: Tensor<B, 2>) -> Tensor<B, 2> {
        let [len, _] = chunk.dims();
        let [_, num_train] = train_t.dims();
        match self.distance {
            DistanceFn::Cosine => l2_normalize(chunk)
                .matmul(train_t)
                .div_scalar(self.temperature)
                .exp(),
            DistanceFn::Euclidean => {
                // |x - t|^2 = |x|^2 + |t|^2 - 2 x.t
                let chunk_sq = chunk.clone().powf_scalar(2.0).sum_dim(1).expand([len, num_train]);
                let cross = chunk.matmul(train_t).mul_scalar(2.0);
                let dist = (chunk_sq + train_sq.expand([len, num_train]) - cross)
                    .clamp_min(0.0)
                    .sqrt();
                dist.add_scalar(self.epsilon).recip()
            }
        }
    }
}

fn rows<B: Backend>(targets: &[Tensor<B, 1, Int>]) -> usize {
    targets.iter().map(|t| t.dims()[0]).sum()
}

fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let dims = x.dims();
    let norm = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norm.expand(dims)
}
