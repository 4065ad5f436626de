//! Online evaluation: top-k accuracy, batch-weighted means, weighted k-NN.

pub mod knn;
pub mod metrics;

pub use knn::{DistanceFn, WeightedKnnClassifier};
pub use metrics::{accuracy_at_k, top_k_hits, weighted_mean};
