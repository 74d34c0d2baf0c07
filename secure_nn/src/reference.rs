use ndarray::{Array2, ArrayD, ArrayView, ArrayViewD, Dimension, Ix2, Ix4, IxDyn};

use crate::{
    NnErr, OpErr, Pipeline, Result, TensorShape,
    kernels::{self, Window},
    layers::{Layer, LayerKind},
    weights::{self, ConvWeights, DenseWeights},
};

#[derive(Debug)]
enum Step {
    Identity,
    Conv { weights: ConvWeights, window: Window },
    Dense(DenseWeights),
    Reshape(TensorShape),
    Relu,
    BatchNorm,
    MaxPool(Window),
}

/// The plaintext twin of a secret pipeline: same layers, same weights, no sharing.
///
/// Used to check that the shares of all roles open to the values a single machine would
/// have computed.
#[derive(Debug)]
pub struct ReferenceNet {
    input: TensorShape,
    steps: Vec<(String, Step)>,
}

impl ReferenceNet {
    /// Creates a new `ReferenceNet`.
    ///
    /// # Arguments
    /// * `pipeline` - A finished pipeline.
    /// * `seed` - The model seed the secret operators were created with.
    ///
    /// # Returns
    /// A new `ReferenceNet` instance.
    pub fn new(pipeline: &Pipeline, seed: u64) -> Result<Self> {
        let input = pipeline
            .input_shape()
            .ok_or_else(|| NnErr::config("the pipeline has no layers"))?;

        let steps = pipeline
            .layers()
            .iter()
            .map(|layer| Ok((layer.name().to_string(), step(layer, seed)?)))
            .collect::<Result<_>>()?;

        Ok(Self { input, steps })
    }

    /// Runs the network in the clear.
    ///
    /// # Arguments
    /// * `x` - A batch of the pipeline's input shape.
    ///
    /// # Returns
    /// The logits.
    pub fn forward(&self, x: ArrayViewD<f32>) -> Result<Array2<f32>> {
        let logits = self
            .activations(x)?
            .pop()
            .ok_or_else(|| NnErr::config("the pipeline has no layers"))?;

        Ok(logits.into_dimensionality::<Ix2>().map_err(OpErr::from)?)
    }

    /// Runs the network in the clear, keeping the output of every layer.
    ///
    /// # Arguments
    /// * `x` - A batch of the pipeline's input shape.
    ///
    /// # Returns
    /// One output per layer, in pipeline order.
    pub fn activations(&self, x: ArrayViewD<f32>) -> Result<Vec<ArrayD<f32>>> {
        if x.shape() != self.input.dims().as_slice() {
            return Err(NnErr::mismatch("input values", x.len(), self.input.numel()));
        }

        let mut outputs = Vec::with_capacity(self.steps.len());
        let mut x = x.to_owned();
        for (name, step) in &self.steps {
            x = run(step, x).map_err(|e| NnErr::from(e).at(name))?;
            outputs.push(x.clone());
        }

        Ok(outputs)
    }

    /// The layer names, in the order `activations` returns their outputs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|(name, _)| name.as_str())
    }
}

fn step(layer: &Layer, seed: u64) -> Result<Step> {
    let params = layer.op_params();

    let step = match layer.kind() {
        LayerKind::Input | LayerKind::Output => Step::Identity,
        LayerKind::Conv2d { .. } => {
            let filter = layer
                .filter()
                .ok_or_else(|| NnErr::config("a convolution needs a filter").at(layer.name()))?;
            Step::Conv {
                weights: weights::conv_weights(seed, layer.name(), filter)?,
                window: params.window(),
            }
        }
        LayerKind::Matmul { units } => Step::Dense(weights::dense_weights(
            seed,
            layer.name(),
            layer.input_shape().per_sample(),
            *units,
        )?),
        LayerKind::Flatten => Step::Reshape(layer.output_shape()),
        LayerKind::Relu => Step::Relu,
        LayerKind::BatchNorm => Step::BatchNorm,
        LayerKind::MaxPool2d { .. } => Step::MaxPool(params.window()),
    };

    Ok(step)
}

fn run(step: &Step, x: ArrayD<f32>) -> std::result::Result<ArrayD<f32>, OpErr> {
    let y = match step {
        Step::Identity => x,
        Step::Conv { weights, window } => {
            let x = x.into_dimensionality::<Ix4>()?;
            kernels::conv2d(x.view(), weights.w.view(), Some(weights.b.view()), window)?.into_dyn()
        }
        Step::Dense(weights) => {
            let x = x.into_dimensionality::<Ix2>()?;
            kernels::dense(x.view(), weights.w.view(), Some(weights.b.view())).into_dyn()
        }
        Step::Reshape(shape) => x.to_shape(IxDyn(&shape.dims()))?.into_owned(),
        Step::Relu => kernels::relu(x.view()),
        Step::BatchNorm => kernels::batch_norm(x.view()),
        Step::MaxPool(window) => {
            let x = x.into_dimensionality::<Ix4>()?;
            kernels::max_pool2d(x.view(), window).into_dyn()
        }
    };

    Ok(y)
}

/// The largest absolute difference between two equally shaped arrays, infinite if their
/// shapes differ.
pub fn max_abs_diff<D: Dimension>(a: ArrayView<f32, D>, b: ArrayView<f32, D>) -> f32 {
    if a.shape() != b.shape() {
        return f32::INFINITY;
    }

    a.iter()
        .zip(b.iter())
        .fold(0.0, |m, (x, y)| m.max((x - y).abs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{Block, Recipe};

    #[test]
    fn reference_outputs_logits_of_the_output_shape() {
        let pipeline = Recipe::new(TensorShape::image(3, 2, 6, 6))
            .then(Block::conv(4, 3))
            .then(Block::BatchNorm)
            .then(Block::Relu)
            .then(Block::pool(2))
            .then(Block::Flatten)
            .then(Block::dense(5))
            .build()
            .unwrap();

        let net = ReferenceNet::new(&pipeline, 11).unwrap();
        let x = ArrayD::from_elem(IxDyn(&[3, 2, 6, 6]), 0.5);
        let logits = net.forward(x.view()).unwrap();

        assert_eq!(logits.dim(), (3, 5));
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn activations_follow_the_layers() {
        let pipeline = Recipe::new(TensorShape::image(2, 1, 4, 4))
            .then(Block::conv(2, 3))
            .then(Block::Relu)
            .then(Block::Flatten)
            .then(Block::dense(3))
            .build()
            .unwrap();

        let net = ReferenceNet::new(&pipeline, 7).unwrap();
        let x = ArrayD::from_shape_fn(IxDyn(&[2, 1, 4, 4]), |d| d[2] as f32 - d[3] as f32);
        let outputs = net.activations(x.view()).unwrap();

        assert_eq!(outputs.len(), pipeline.len());
        assert_eq!(net.names().count(), pipeline.len());
        for (output, layer) in outputs.iter().zip(pipeline.layers()) {
            assert_eq!(output.shape(), layer.output_shape().dims().as_slice());
        }

        assert_eq!(outputs[0], x);
        let relu = &outputs[2];
        assert!(relu.iter().all(|&v| v >= 0.0));

        let logits = net.forward(x.view()).unwrap();
        assert_eq!(max_abs_diff(logits.view().into_dyn(), outputs[5].view()), 0.0);
    }

    #[test]
    fn wrong_input_shape_is_rejected() {
        let pipeline = Recipe::new(TensorShape::flat(2, 3))
            .then(Block::dense(2))
            .build()
            .unwrap();
        let net = ReferenceNet::new(&pipeline, 0).unwrap();

        let x = ArrayD::zeros(IxDyn(&[3, 3]));
        assert!(matches!(
            net.forward(x.view()),
            Err(NnErr::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn max_abs_diff_of_mismatched_shapes_is_infinite() {
        let a = Array2::zeros((2, 2));
        let b = Array2::ones((2, 2));
        let c = Array2::zeros((1, 2));

        assert_eq!(max_abs_diff(a.view(), b.view()), 1.0);
        assert!(max_abs_diff(a.view(), c.view()).is_infinite());
    }
}
