//! Seeded synthetic image data with multi-crop views.
//!
//! Each class has a fixed random prototype image; a sample is its prototype
//! plus Gaussian noise, and every crop adds its own noise on top. Large crops
//! keep the full resolution, small crops are random square windows of a view.
//! Everything is generated host-side from a [`StdRng`], so a given seed and
//! epoch always produce the same batches.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::batch::{Crops, TrainBatch, ValBatch};
use crate::bridge::targets_to_tensor;
use crate::loss::IGNORE_INDEX;
use crate::policy::DataModule;

#[derive(Config, Debug)]
pub struct SyntheticDataConfig {
    #[config(default = 4)]
    pub num_classes: usize,
    #[config(default = 64)]
    pub train_samples: usize,
    #[config(default = 32)]
    pub val_samples: usize,
    #[config(default = 16)]
    pub batch_size: usize,
    /// Side of the full images and of the large crops.
    #[config(default = 16)]
    pub image_size: usize,
    /// Side of the small crops.
    #[config(default = 8)]
    pub small_crop_size: usize,
    #[config(default = 2)]
    pub num_large_crops: usize,
    #[config(default = 0)]
    pub num_small_crops: usize,
    /// Standard deviation of per-sample and per-crop noise.
    #[config(default = 0.5)]
    pub noise: f32,
    /// Share of training samples labeled `-1`.
    #[config(default = 0.0)]
    pub unlabeled_fraction: f64,
    #[config(default = 42)]
    pub seed: u64,
}

struct Sample {
    pixels: Vec<f32>,
    target: i64,
}

pub struct SyntheticDataModule<B: AutodiffBackend> {
    config: SyntheticDataConfig,
    train: Vec<Sample>,
    val: Vec<Sample>,
    device: B::Device,
}

fn gaussian(rng: &mut StdRng, len: usize, std: f32) -> Vec<f32> {
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal) * std).collect()
}

impl<B: AutodiffBackend> SyntheticDataModule<B> {
    pub fn new(config: SyntheticDataConfig, device: B::Device) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let numel = 3 * config.image_size * config.image_size;
        let prototypes: Vec<Vec<f32>> =
            (0..config.num_classes).map(|_| gaussian(&mut rng, numel, 1.0)).collect();

        let draw = |count: usize, unlabeled_fraction: f64, rng: &mut StdRng| -> Vec<Sample> {
            (0..count)
                .map(|i| {
                    let class = i % config.num_classes.max(1);
                    let noise = gaussian(rng, numel, config.noise);
                    let pixels = prototypes[class].iter().zip(noise).map(|(p, n)| p + n).collect();
                    let target =
                        if rng.gen_bool(unlabeled_fraction.clamp(0.0, 1.0)) { IGNORE_INDEX } else { class as i64 };
                    Sample { pixels, target }
                })
                .collect()
        };
        let train = draw(config.train_samples, config.unlabeled_fraction, &mut rng);
        let val = draw(config.val_samples, 0.0, &mut rng);

        tracing::info!(
            train = train.len(),
            val = val.len(),
            classes = config.num_classes,
            image_size = config.image_size,
            "Generated synthetic dataset"
        );
        Self { config, train, val, device }
    }

    pub fn config(&self) -> &SyntheticDataConfig {
        &self.config
    }

    fn images<BB: Backend>(&self, pixels: Vec<f32>, batch: usize, side: usize, device: &BB::Device) -> Tensor<BB, 4> {
        Tensor::from_data(TensorData::new(pixels, [batch, 3, side, side]), device)
    }

    /// One noisy full-size view per sample.
    fn large_view(&self, samples: &[&Sample], rng: &mut StdRng) -> Vec<f32> {
        samples
            .iter()
            .flat_map(|s| {
                let noise = gaussian(rng, s.pixels.len(), self.config.noise);
                s.pixels.iter().zip(noise).map(|(p, n)| p + n).collect::<Vec<_>>()
            })
            .collect()
    }

    /// A random `small_crop_size` window of a noisy view per sample.
    fn small_view(&self, samples: &[&Sample], rng: &mut StdRng) -> Vec<f32> {
        let side = self.config.image_size;
        let crop = self.config.small_crop_size.min(side);
        let view = self.large_view(samples, rng);
        let mut out = Vec::with_capacity(samples.len() * 3 * crop * crop);
        for image in view.chunks(3 * side * side) {
            let top = rng.gen_range(0..=side - crop);
            let left = rng.gen_range(0..=side - crop);
            for channel in image.chunks(side * side) {
                for row in top..top + crop {
                    out.extend_from_slice(&channel[row * side + left..row * side + left + crop]);
                }
            }
        }
        out
    }

    /// Crops, targets and dataset indices of the training samples in `chunk`.
    fn train_batch(&self, chunk: &[usize], rng: &mut StdRng) -> TrainBatch<B> {
        let samples: Vec<&Sample> = chunk.iter().map(|&i| &self.train[i]).collect();
        let n = samples.len();
        let small_side = self.config.small_crop_size.min(self.config.image_size);
        let mut crops: Vec<Tensor<B, 4>> = (0..self.config.num_large_crops)
            .map(|_| self.images(self.large_view(&samples, rng), n, self.config.image_size, &self.device))
            .collect();
        crops.extend(
            (0..self.config.num_small_crops)
                .map(|_| self.images(self.small_view(&samples, rng), n, small_side, &self.device)),
        );
        let targets: Vec<i64> = samples.iter().map(|s| s.target).collect();
        let indices: Vec<i64> = chunk.iter().map(|&i| i as i64).collect();
        TrainBatch {
            indices: targets_to_tensor(&indices, &self.device),
            crops: Crops::Multi(crops),
            targets: targets_to_tensor(&targets, &self.device),
        }
    }
}

impl<B: AutodiffBackend> DataModule<B> for SyntheticDataModule<B> {
    fn train_batches(&self, epoch: usize) -> Box<dyn Iterator<Item = TrainBatch<B>> + '_> {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1 + epoch as u64));
        let mut order: Vec<usize> = (0..self.train.len()).collect();
        order.shuffle(&mut rng);
        let chunks: Vec<Vec<usize>> = order.chunks(self.config.batch_size.max(1)).map(<[usize]>::to_vec).collect();

        Box::new(chunks.into_iter().map(move |chunk| self.train_batch(&chunk, &mut rng)))
    }

    fn val_batches(&self) -> Box<dyn Iterator<Item = ValBatch<B::InnerBackend>> + '_> {
        Box::new(self.val.chunks(self.config.batch_size.max(1)).map(|chunk| {
            let pixels: Vec<f32> = chunk.iter().flat_map(|s| s.pixels.iter().copied()).collect();
            let targets: Vec<i64> = chunk.iter().map(|s| s.target).collect();
            ValBatch {
                images: self.images::<B::InnerBackend>(pixels, chunk.len(), self.config.image_size, &self.device),
                targets: targets_to_tensor(&targets, &self.device),
            }
        }))
    }

    fn num_training_batches(&self) -> usize {
        self.train.len().div_ceil(self.config.batch_size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::targets_to_vec;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;

    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn module(config: SyntheticDataConfig) -> SyntheticDataModule<TestAutodiffBackend> {
        SyntheticDataModule::new(config, Default::default())
    }

    #[test]
    fn test_batch_layout() {
        let data = module(
            SyntheticDataConfig::new()
                .with_train_samples(10)
                .with_batch_size(4)
                .with_num_small_crops(3)
                .with_small_crop_size(6),
        );
        assert_eq!(data.num_training_batches(), 3);
        let batches: Vec<_> = data.train_batches(0).collect();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].targets.dims(), [2], "last batch is partial");
        assert_eq!(batches[0].crops.len(), 5);
        let crops = batches[0].crops.to_vec();
        assert_eq!(crops[0].dims(), [4, 3, 16, 16]);
        assert_eq!(crops[4].dims(), [4, 3, 6, 6]);
    }

    #[test]
    fn test_epochs_are_deterministic_and_distinct() {
        let data = module(SyntheticDataConfig::new().with_train_samples(16).with_batch_size(16));
        let first = |epoch| data.train_batches(epoch).next().map(|b| targets_to_vec(b.indices));
        let (a, b, c) = (first(0), first(0), first(1));
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c, "each epoch reshuffles");
    }

    #[test]
    fn test_unlabeled_fraction() {
        let data = module(SyntheticDataConfig::new().with_train_samples(40).with_unlabeled_fraction(1.0));
        for batch in data.train_batches(0) {
            assert!(targets_to_vec(batch.targets).iter().all(|&t| t == IGNORE_INDEX));
        }
        for batch in data.val_batches() {
            assert!(targets_to_vec(batch.targets).iter().all(|&t| t >= 0), "validation is always labeled");
        }
    }

    #[test]
    fn test_batches_are_built_on_demand() {
        let data = module(SyntheticDataConfig::new().with_train_samples(20).with_batch_size(8));
        let mut batches = data.train_batches(0);
        assert_eq!(batches.size_hint(), (3, Some(3)), "one item per chunk");
        assert_eq!(batches.next().map(|b| b.targets.dims()), Some([8]));

        // every sample is drawn exactly once per epoch
        let mut seen: Vec<i64> = data.train_batches(2).flat_map(|b| targets_to_vec(b.indices)).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20).collect::<Vec<i64>>());
        assert_eq!(data.train_batches(2).count(), data.num_training_batches());
    }
}
