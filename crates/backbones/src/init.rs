//! Kind-dispatched weight initialization.
//!
//! Modules describe themselves to the initializer through [`WeightInit::layer`],
//! which returns a [`Layer`] view: a convolution, a linear projection, a
//! normalization layer, a module with its own reset routine, or a container of
//! children. [`WeightInitializer::weights_init`] walks that view:
//!
//! ```text
//! Conv         → variance scaling (truncated normal, fan_in by default), bias = 0
//! Linear       → truncated normal (std 0.02), bias = 0
//! Norm         → weight = 1, bias = 0
//! CustomReset  → module's own reset_parameters (no descent)
//! Container    → each child by the rules above, recursing into containers
//! ```
//!
//! Sampling happens host-side with a seeded [`StdRng`] so that two
//! initializers with the same seed produce identical weights.

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::{BatchNorm, GroupNorm, LayerNorm, Linear};
use burn::prelude::*;
use burn::tensor::TensorData;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Standard deviation of a unit normal truncated to `(-2, 2)`.
pub const TRUNCATED_NORMAL_STD: f64 = 0.879_625_661_034_239_78;

/// Std used for linear layers by [`WeightInitializer::weights_init`].
pub const LINEAR_INIT_STD: f64 = 0.02;

/// Which fan the variance is scaled by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FanMode {
    #[default]
    FanIn,
    FanOut,
    FanAvg,
}

/// Sampling distribution for variance scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitDistribution {
    #[default]
    TruncatedNormal,
    Normal,
    Uniform,
}

/// Variance-scaling initializer: `variance = scale / fan`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VarianceScaling {
    pub scale: f64,
    pub mode: FanMode,
    pub distribution: InitDistribution,
}

impl Default for VarianceScaling {
    fn default() -> Self {
        Self { scale: 1.0, mode: FanMode::FanIn, distribution: InitDistribution::TruncatedNormal }
    }
}

impl VarianceScaling {
    /// Target variance for a weight of the given shape.
    ///
    /// Shapes follow the `[out, in, k...]` layout of convolution weights.
    pub fn variance(&self, dims: &[usize]) -> f64 {
        let (fan_in, fan_out) = fans(dims);
        let denom = match self.mode {
            FanMode::FanIn => fan_in,
            FanMode::FanOut => fan_out,
            FanMode::FanAvg => (fan_in + fan_out) / 2.0,
        };
        self.scale / denom.max(1.0)
    }
}

/// `(fan_in, fan_out)` for an `[out, in, k...]` weight.
pub fn fans(dims: &[usize]) -> (f64, f64) {
    match dims {
        [] => (1.0, 1.0),
        [n] => (*n as f64, *n as f64),
        [out, inp, rest @ ..] => {
            let receptive: usize = rest.iter().product();
            ((inp * receptive) as f64, (out * receptive) as f64)
        }
    }
}

/// A module's self-description for initialization.
pub enum Layer<'a, B: Backend> {
    Conv {
        weight: &'a mut Param<Tensor<B, 4>>,
        bias: Option<&'a mut Param<Tensor<B, 1>>>,
    },
    /// Weight layout is burn's `[d_input, d_output]`.
    Linear {
        weight: &'a mut Param<Tensor<B, 2>>,
        bias: Option<&'a mut Param<Tensor<B, 1>>>,
    },
    Norm {
        gamma: Option<&'a mut Param<Tensor<B, 1>>>,
        beta: Option<&'a mut Param<Tensor<B, 1>>>,
    },
    CustomReset(&'a mut dyn ResetParameters<B>),
    Container(Vec<&'a mut dyn WeightInit<B>>),
}

/// Implemented by every module the initializer can visit.
pub trait WeightInit<B: Backend> {
    fn layer(&mut self) -> Layer<'_, B>;
}

/// Modules that own their initialization routine.
///
/// The initializer calls this instead of descending into the module's children.
pub trait ResetParameters<B: Backend> {
    fn reset_parameters(&mut self, init: &mut WeightInitializer);
}

/// Seeded host-side sampler applying the initialization rules.
#[derive(Debug, Clone)]
pub struct WeightInitializer {
    rng: StdRng,
    conv: VarianceScaling,
}

impl WeightInitializer {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), conv: VarianceScaling::default() }
    }

    /// Replace the variance-scaling rule used for convolutions.
    pub fn with_conv_scaling(mut self, conv: VarianceScaling) -> Self {
        self.conv = conv;
        self
    }

    /// Initialize `module` and everything below it.
    pub fn weights_init<B: Backend>(&mut self, module: &mut dyn WeightInit<B>) {
        match module.layer() {
            Layer::Container(children) => self.init_children(children),
            Layer::CustomReset(custom) => custom.reset_parameters(self),
            leaf => self.init_leaf(leaf),
        }
    }

    /// Apply the initialization rules to each child of a container.
    ///
    /// Custom modules call this from their `reset_parameters` to get the
    /// standard treatment for their own children.
    pub fn init_children<B: Backend>(&mut self, children: Vec<&mut dyn WeightInit<B>>) {
        for child in children {
            match child.layer() {
                Layer::CustomReset(custom) => custom.reset_parameters(self),
                Layer::Container(grandchildren) => self.init_children(grandchildren),
                leaf => self.init_leaf(leaf),
            }
        }
    }

    fn init_leaf<B: Backend>(&mut self, layer: Layer<'_, B>) {
        match layer {
            Layer::Conv { weight, bias } => {
                let scaling = self.conv;
                self.variance_scaling(weight, scaling);
                if let Some(bias) = bias {
                    self.constant(bias, 0.0);
                }
            }
            Layer::Linear { weight, bias } => {
                self.truncated_normal(weight, LINEAR_INIT_STD);
                if let Some(bias) = bias {
                    self.constant(bias, 0.0);
                }
            }
            Layer::Norm { gamma, beta } => {
                if let Some(gamma) = gamma {
                    self.constant(gamma, 1.0);
                }
                if let Some(beta) = beta {
                    self.constant(beta, 0.0);
                }
            }
            Layer::CustomReset(_) | Layer::Container(_) => {}
        }
    }

    /// Variance-scaling initialization of a weight in place.
    pub fn variance_scaling<B: Backend, const D: usize>(
        &mut self,
        param: &mut Param<Tensor<B, D>>,
        scaling: VarianceScaling,
    ) {
        let dims = param.val().dims();
        let variance = scaling.variance(&dims);
        match scaling.distribution {
            InitDistribution::TruncatedNormal => {
                self.truncated_normal(param, variance.sqrt() / TRUNCATED_NORMAL_STD)
            }
            InitDistribution::Normal => self.normal(param, variance.sqrt()),
            InitDistribution::Uniform => {
                let bound = (3.0 * variance).sqrt();
                self.uniform(param, -bound, bound)
            }
        }
    }

    /// Normal samples with `std`, redrawn until they fall within ±2σ.
    pub fn truncated_normal<B: Backend, const D: usize>(
        &mut self,
        param: &mut Param<Tensor<B, D>>,
        std: f64,
    ) {
        let rng = &mut self.rng;
        replace(param, |n| {
            (0..n)
                .map(|_| loop {
                    let z: f64 = rng.sample(StandardNormal);
                    if z.abs() <= 2.0 {
                        break (z * std) as f32;
                    }
                })
                .collect()
        });
    }

    pub fn normal<B: Backend, const D: usize>(&mut self, param: &mut Param<Tensor<B, D>>, std: f64) {
        let rng = &mut self.rng;
        replace(param, |n| {
            (0..n).map(|_| (rng.sample::<f64, _>(StandardNormal) * std) as f32).collect()
        });
    }

    pub fn uniform<B: Backend, const D: usize>(
        &mut self,
        param: &mut Param<Tensor<B, D>>,
        low: f64,
        high: f64,
    ) {
        let rng = &mut self.rng;
        replace(param, |n| (0..n).map(|_| rng.gen_range(low..high) as f32).collect());
    }

    pub fn constant<B: Backend, const D: usize>(&mut self, param: &mut Param<Tensor<B, D>>, value: f64) {
        replace(param, |n| vec![value as f32; n]);
    }
}

impl Default for WeightInitializer {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Swap a parameter's value for freshly sampled host data of the same shape.
fn replace<B: Backend, const D: usize>(
    param: &mut Param<Tensor<B, D>>,
    sample: impl FnOnce(usize) -> Vec<f32>,
) {
    let current = param.val();
    let device = current.device();
    let dims = current.dims();
    let values = sample(dims.iter().product());
    let tensor = Tensor::from_data(TensorData::new(values, dims), &device);
    *param = Param::from_tensor(tensor);
}

impl<B: Backend> WeightInit<B> for Conv2d<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Conv { weight: &mut self.weight, bias: self.bias.as_mut() }
    }
}

impl<B: Backend> WeightInit<B> for Linear<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Linear { weight: &mut self.weight, bias: self.bias.as_mut() }
    }
}

impl<B: Backend> WeightInit<B> for BatchNorm<B, 2> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Norm { gamma: Some(&mut self.gamma), beta: Some(&mut self.beta) }
    }
}

impl<B: Backend> WeightInit<B> for LayerNorm<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Norm { gamma: Some(&mut self.gamma), beta: Some(&mut self.beta) }
    }
}

impl<B: Backend> WeightInit<B> for GroupNorm<B> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Norm { gamma: self.gamma.as_mut(), beta: self.beta.as_mut() }
    }
}

impl<B: Backend, T: WeightInit<B>> WeightInit<B> for Vec<T> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(self.iter_mut().map(|m| m as &mut dyn WeightInit<B>).collect())
    }
}

impl<B: Backend, T: WeightInit<B>> WeightInit<B> for Option<T> {
    fn layer(&mut self) -> Layer<'_, B> {
        Layer::Container(self.iter_mut().map(|m| m as &mut dyn WeightInit<B>).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::nn::conv::Conv2dConfig;
    use burn::nn::{BatchNormConfig, LinearConfig};

    type TestBackend = NdArray<f32>;

    fn values<const D: usize>(param: &Param<Tensor<TestBackend, D>>) -> Vec<f32> {
        param.val().into_data().iter::<f32>().collect()
    }

    fn std_of(values: &[f32]) -> f64 {
        let n = values.len() as f64;
        let mean = values.iter().map(|&v| v as f64).sum::<f64>() / n;
        (values.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n).sqrt()
    }

    /// A container with a conv, a norm and a linear child.
    struct Tiny {
        conv: Conv2d<TestBackend>,
        norm: BatchNorm<TestBackend, 2>,
        head: Linear<TestBackend>,
    }

    impl WeightInit<TestBackend> for Tiny {
        fn layer(&mut self) -> Layer<'_, TestBackend> {
            Layer::Container(vec![&mut self.conv as &mut dyn WeightInit<TestBackend>, &mut self.norm, &mut self.head])
        }
    }

    /// A module that fills its linear weight with a marker value.
    struct Marker {
        inner: Linear<TestBackend>,
    }

    impl ResetParameters<TestBackend> for Marker {
        fn reset_parameters(&mut self, init: &mut WeightInitializer) {
            init.constant(&mut self.inner.weight, 7.0);
        }
    }

    impl WeightInit<TestBackend> for Marker {
        fn layer(&mut self) -> Layer<'_, TestBackend> {
            Layer::CustomReset(self)
        }
    }

    struct Outer {
        marker: Marker,
        tiny: Tiny,
    }

    impl WeightInit<TestBackend> for Outer {
        fn layer(&mut self) -> Layer<'_, TestBackend> {
            Layer::Container(vec![&mut self.marker as &mut dyn WeightInit<TestBackend>, &mut self.tiny])
        }
    }

    fn tiny(device: &<TestBackend as Backend>::Device) -> Tiny {
        Tiny {
            conv: Conv2dConfig::new([16, 32], [3, 3]).init(device),
            norm: BatchNormConfig::new(32).init(device),
            head: LinearConfig::new(256, 128).init(device),
        }
    }

    #[test]
    fn test_fans() {
        assert_eq!(fans(&[64, 3, 7, 7]), (147.0, 3136.0));
        assert_eq!(fans(&[10, 20]), (20.0, 10.0));
    }

    #[test]
    fn test_variance_modes() {
        let dims = [8, 4, 3, 3];
        let fan_in = VarianceScaling { mode: FanMode::FanIn, ..Default::default() };
        let fan_out = VarianceScaling { mode: FanMode::FanOut, ..Default::default() };
        let fan_avg = VarianceScaling { mode: FanMode::FanAvg, scale: 2.0, ..Default::default() };
        assert!((fan_in.variance(&dims) - 1.0 / 36.0).abs() < 1e-12);
        assert!((fan_out.variance(&dims) - 1.0 / 72.0).abs() < 1e-12);
        assert!((fan_avg.variance(&dims) - 2.0 / 54.0).abs() < 1e-12);
    }

    #[test]
    fn test_container_rules() {
        let device = Default::default();
        let mut module = tiny(&device);
        WeightInitializer::new(42).weights_init(&mut module);

        // Norm: weight 1, bias 0
        assert!(values(&module.norm.gamma).iter().all(|&v| v == 1.0));
        assert!(values(&module.norm.beta).iter().all(|&v| v == 0.0));

        // Linear: truncated normal std 0.02, zero bias, within ±2σ
        let w = values(&module.head.weight);
        assert!(w.iter().all(|&v| v.abs() <= 0.04 + 1e-6), "linear sample outside ±2σ");
        let std = std_of(&w);
        assert!((std - 0.02 * TRUNCATED_NORMAL_STD).abs() < 0.002, "linear std {std}");
        let bias = module.head.bias.as_ref().map(values).unwrap();
        assert!(bias.iter().all(|&v| v == 0.0));

        // Conv: truncated normal, fan_in = 16 * 9, corrected so std ≈ sqrt(1/fan_in)
        let w = values(&module.conv.weight);
        let std = std_of(&w);
        let target = (1.0f64 / 144.0).sqrt();
        assert!((std - target).abs() < 0.1 * target, "conv std {std}, expected ≈ {target}");
    }

    #[test]
    fn test_custom_reset_is_not_descended() {
        let device = Default::default();
        let mut module = Outer {
            marker: Marker { inner: LinearConfig::new(4, 4).init(&device) },
            tiny: tiny(&device),
        };
        WeightInitializer::new(0).weights_init(&mut module);

        // Custom routine ran instead of the linear rule
        assert!(values(&module.marker.inner.weight).iter().all(|&v| v == 7.0));
        // Container child still got the standard rules
        assert!(values(&module.tiny.norm.gamma).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_uniform_bound() {
        let device = Default::default();
        let mut conv: Conv2d<TestBackend> = Conv2dConfig::new([4, 8], [3, 3]).init(&device);
        let scaling = VarianceScaling {
            distribution: InitDistribution::Uniform,
            ..Default::default()
        };
        WeightInitializer::new(3).variance_scaling(&mut conv.weight, scaling);
        let bound = (3.0f64 / 36.0).sqrt() as f32;
        assert!(values(&conv.weight).iter().all(|&v| v.abs() <= bound));
    }

    #[test]
    fn test_seed_is_deterministic() {
        let device = Default::default();
        let mut a = tiny(&device);
        let mut b = tiny(&device);
        WeightInitializer::new(9).weights_init(&mut a);
        WeightInitializer::new(9).weights_init(&mut b);
        assert_eq!(values(&a.conv.weight), values(&b.conv.weight));
        assert_eq!(values(&a.head.weight), values(&b.head.weight));
    }
}
