//! Public model weights.
//!
//! Every role derives the same weights from the model seed and the layer name, so no weight
//! ever travels over the mesh.

use ndarray::{Array1, Array2, Array4};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Uniform};

use crate::{OpErr, shape::FilterShape};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Mixes the model seed with a layer name.
pub fn layer_seed(seed: u64, name: &str) -> u64 {
    let hash = name.bytes().fold(FNV_OFFSET, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    });

    seed ^ hash
}

/// Filters and per-output-channel bias of a convolution.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvWeights {
    pub w: Array4<f32>,
    pub b: Array1<f32>,
}

/// `(in, out)` weights and bias of a dense layer.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseWeights {
    pub w: Array2<f32>,
    pub b: Array1<f32>,
}

fn uniform(fan_in: usize) -> Result<Uniform<f32>, OpErr> {
    let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
    Uniform::new(-bound, bound).map_err(|e| OpErr::Weights(e.to_string()))
}

/// Draws the weights of a convolution layer.
///
/// # Arguments
/// * `seed` - The model seed.
/// * `name` - The layer name.
/// * `filter` - The filter bank shape.
///
/// # Returns
/// Weights sampled from `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
pub fn conv_weights(seed: u64, name: &str, filter: FilterShape) -> Result<ConvWeights, OpErr> {
    let mut rng = StdRng::seed_from_u64(layer_seed(seed, name));
    let dist = uniform(filter.fan_in())?;

    let w = Array4::from_shape_fn(filter.dims(), |_| dist.sample(&mut rng));
    let b = Array1::from_shape_fn(filter.out_channels, |_| dist.sample(&mut rng));
    Ok(ConvWeights { w, b })
}

/// Draws the weights of a dense layer.
///
/// # Arguments
/// * `seed` - The model seed.
/// * `name` - The layer name.
/// * `inputs` - The features of a sample entering the layer.
/// * `units` - The features of a sample leaving the layer.
///
/// # Returns
/// Weights sampled from `U(-1/sqrt(inputs), 1/sqrt(inputs))`.
pub fn dense_weights(
    seed: u64,
    name: &str,
    inputs: usize,
    units: usize,
) -> Result<DenseWeights, OpErr> {
    let mut rng = StdRng::seed_from_u64(layer_seed(seed, name));
    let dist = uniform(inputs)?;

    let w = Array2::from_shape_fn((inputs, units), |_| dist.sample(&mut rng));
    let b = Array1::from_shape_fn(units, |_| dist.sample(&mut rng));
    Ok(DenseWeights { w, b })
}
