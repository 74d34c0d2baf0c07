use super::PartialShape;
use crate::{
    NnErr, Result, TensorShape,
    ops::{OpKind, OpParams},
    shape::{self, FilterShape},
};

/// What a layer computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Input,
    Conv2d {
        filters: usize,
        filter_hw: usize,
        /// `None` until linked, then the resolved padding.
        padding: Option<usize>,
        stride: usize,
    },
    BatchNorm,
    Relu,
    MaxPool2d {
        kernel: usize,
        padding: usize,
        stride: (usize, usize),
    },
    Flatten,
    Matmul {
        units: usize,
    },
    Output,
}

impl LayerKind {
    /// Returns a stable identifier for the layer kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Conv2d { .. } => "conv2d",
            LayerKind::BatchNorm => "batch_norm",
            LayerKind::Relu => "relu",
            LayerKind::MaxPool2d { .. } => "max_pool2d",
            LayerKind::Flatten => "flatten",
            LayerKind::Matmul { .. } => "matmul",
            LayerKind::Output => "output",
        }
    }

    /// The operators a layer of this kind is bound to, the first one runs the forward pass.
    pub fn op_kinds(&self) -> &'static [OpKind] {
        match self {
            LayerKind::Input => &[OpKind::Input],
            LayerKind::Conv2d { .. } => &[
                OpKind::Conv2d,
                OpKind::Conv2dInputGrad,
                OpKind::Conv2dWeightGrad,
            ],
            LayerKind::BatchNorm => &[OpKind::BatchNorm],
            LayerKind::Relu => &[OpKind::Relu],
            LayerKind::MaxPool2d { .. } => &[OpKind::MaxPool2d],
            LayerKind::Flatten => &[OpKind::Flatten],
            LayerKind::Matmul { .. } => &[OpKind::Matmul],
            LayerKind::Output => &[OpKind::Output],
        }
    }

    pub fn visibility(&self) -> Visibility {
        match self {
            LayerKind::Input | LayerKind::Output => Visibility::DataOwners,
            _ => Visibility::Shared,
        }
    }
}

/// Which roles feed real values into a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Only roles authorized to see plaintext inject real values, the rest hold a
    /// placeholder.
    DataOwners,
    /// Every role computes its own share.
    Shared,
}

/// A layer as declared by its builder, before it is linked into a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSpec {
    name: String,
    kind: LayerKind,
    shape: PartialShape,
}

impl LayerSpec {
    /// Creates a new `LayerSpec` whose input shape is entirely taken from its predecessor.
    ///
    /// # Arguments
    /// * `name` - The name of the layer, unique within its pipeline.
    /// * `kind` - What the layer computes.
    ///
    /// # Returns
    /// A new `LayerSpec` instance.
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shape: PartialShape::unset(),
        }
    }

    pub fn input(name: impl Into<String>, shape: TensorShape) -> Self {
        Self::new(name, LayerKind::Input).with_shape(shape.into())
    }

    /// A convolution with stride 1 and the default padding for its filter size.
    pub fn conv2d(name: impl Into<String>, filters: usize, filter_hw: usize) -> Self {
        Self::conv2d_with(name, filters, filter_hw, None, 1)
    }

    pub fn conv2d_with(
        name: impl Into<String>,
        filters: usize,
        filter_hw: usize,
        padding: Option<usize>,
        stride: usize,
    ) -> Self {
        Self::new(
            name,
            LayerKind::Conv2d {
                filters,
                filter_hw,
                padding,
                stride,
            },
        )
    }

    pub fn batch_norm(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::BatchNorm)
    }

    pub fn relu(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Relu)
    }

    /// A max pooling whose stride equals its window and without padding.
    pub fn max_pool2d(name: impl Into<String>, kernel: usize) -> Self {
        Self::max_pool2d_with(name, kernel, 0, (kernel, kernel))
    }

    pub fn max_pool2d_with(
        name: impl Into<String>,
        kernel: usize,
        padding: usize,
        stride: (usize, usize),
    ) -> Self {
        Self::new(
            name,
            LayerKind::MaxPool2d {
                kernel,
                padding,
                stride,
            },
        )
    }

    pub fn flatten(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Flatten)
    }

    pub fn matmul(name: impl Into<String>, units: usize) -> Self {
        Self::new(name, LayerKind::Matmul { units })
    }

    pub fn output(name: impl Into<String>) -> Self {
        Self::new(name, LayerKind::Output)
    }

    /// Declares (part of) the input shape explicitly.
    pub fn with_shape(mut self, shape: PartialShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// Links this layer after `prev` and computes its shapes.
    ///
    /// # Arguments
    /// * `index` - The position this layer takes in its pipeline.
    /// * `prev` - The immediate predecessor, if any.
    ///
    /// # Returns
    /// The wired layer or an error if its shape is incomplete or incompatible.
    pub fn init_shape(self, index: usize, prev: Option<&Layer>) -> Result<Layer> {
        let Self { name, kind, shape } = self;

        let input = shape
            .resolve(prev.map(Layer::output_shape))
            .map_err(|e| e.at(&name))?;

        let (kind, output) = link_kind(kind, input).map_err(|e| e.at(&name))?;

        Ok(Layer {
            name,
            kind,
            index,
            prev: prev.map(Layer::index),
            input,
            output,
        })
    }
}

fn link_kind(kind: LayerKind, input: TensorShape) -> Result<(LayerKind, TensorShape)> {
    let output = match kind {
        LayerKind::Input | LayerKind::BatchNorm | LayerKind::Relu => input,
        LayerKind::Output => match input {
            TensorShape::Flat { .. } => input,
            TensorShape::Image { .. } => {
                return Err(NnErr::config(format!(
                    "the output layer reveals flat logits, got {input}"
                )));
            }
        },
        LayerKind::Conv2d {
            filters,
            filter_hw,
            padding,
            stride,
        } => {
            let padding = padding.unwrap_or_else(|| shape::default_padding(filter_hw));
            let filter = FilterShape::new(filters, image_channels(input), filter_hw);
            let output = shape::conv2d_output_shape(input, filter, padding, stride)?;

            return Ok((
                LayerKind::Conv2d {
                    filters,
                    filter_hw,
                    padding: Some(padding),
                    stride,
                },
                output,
            ));
        }
        LayerKind::MaxPool2d {
            kernel,
            padding,
            stride,
        } => shape::pool2d_output_shape(input, kernel, padding, stride)?,
        LayerKind::Flatten => shape::flatten_shape(input),
        LayerKind::Matmul { units } => shape::matmul_output_shape(input, units)?,
    };

    Ok((kind, output))
}

fn image_channels(shape: TensorShape) -> usize {
    match shape {
        TensorShape::Image { channels, .. } => channels,
        TensorShape::Flat { .. } => 0,
    }
}

/// A layer linked into a pipeline: its shapes are final and it never changes again.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    name: String,
    kind: LayerKind,
    index: usize,
    prev: Option<usize>,
    input: TensorShape,
    output: TensorShape,
}

impl Layer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &LayerKind {
        &self.kind
    }

    /// The position of this layer in its pipeline.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The position of the predecessor in the same pipeline.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }

    pub fn input_shape(&self) -> TensorShape {
        self.input
    }

    pub fn output_shape(&self) -> TensorShape {
        self.output
    }

    pub fn visibility(&self) -> Visibility {
        self.kind.visibility()
    }

    /// The filter bank of a convolution.
    pub fn filter(&self) -> Option<FilterShape> {
        match self.kind {
            LayerKind::Conv2d {
                filters, filter_hw, ..
            } => Some(FilterShape::new(
                filters,
                image_channels(self.input),
                filter_hw,
            )),
            _ => None,
        }
    }

    pub fn op_kinds(&self) -> &'static [OpKind] {
        self.kind.op_kinds()
    }

    /// The parameters an operator bound to this layer needs.
    pub fn op_params(&self) -> OpParams {
        let mut params = OpParams::new(self.index as u32, self.input, self.output);

        match self.kind {
            LayerKind::Conv2d {
                padding, stride, ..
            } => {
                params.filter = self.filter();
                params.padding = padding.unwrap_or_default();
                params.stride = (stride, stride);
            }
            LayerKind::MaxPool2d {
                kernel,
                padding,
                stride,
            } => {
                params.kernel = kernel;
                params.padding = padding;
                params.stride = stride;
            }
            _ => {}
        }

        params
    }
}
