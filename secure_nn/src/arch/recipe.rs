use serde::{Deserialize, Serialize};

use crate::{Pipeline, Result, TensorShape, layers::LayerSpec};

/// One step of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "block", rename_all = "snake_case")]
pub enum Block {
    Conv {
        filters: usize,
        filter_hw: usize,
        #[serde(default)]
        padding: Option<usize>,
        #[serde(default = "unit_stride")]
        stride: usize,
    },
    BatchNorm,
    Relu,
    MaxPool {
        kernel: usize,
        #[serde(default)]
        padding: usize,
        /// `(row, column)` strides, the window size when absent.
        #[serde(default)]
        stride: Option<(usize, usize)>,
    },
    Flatten,
    Dense {
        units: usize,
    },
}

fn unit_stride() -> usize {
    1
}

impl Block {
    /// A convolution with stride 1 and the default padding.
    pub fn conv(filters: usize, filter_hw: usize) -> Self {
        Self::Conv {
            filters,
            filter_hw,
            padding: None,
            stride: 1,
        }
    }

    /// A max pooling with stride equal to its window and no padding.
    pub fn pool(kernel: usize) -> Self {
        Self::MaxPool {
            kernel,
            padding: 0,
            stride: None,
        }
    }

    pub fn dense(units: usize) -> Self {
        Self::Dense { units }
    }

    fn prefix(&self) -> &'static str {
        match self {
            Block::Conv { .. } => "conv",
            Block::BatchNorm => "norm",
            Block::Relu => "relu",
            Block::MaxPool { .. } => "pool",
            Block::Flatten => "flatten",
            Block::Dense { .. } => "fc",
        }
    }

    fn to_spec(&self, name: String) -> LayerSpec {
        match *self {
            Block::Conv {
                filters,
                filter_hw,
                padding,
                stride,
            } => LayerSpec::conv2d_with(name, filters, filter_hw, padding, stride),
            Block::BatchNorm => LayerSpec::batch_norm(name),
            Block::Relu => LayerSpec::relu(name),
            Block::MaxPool {
                kernel,
                padding,
                stride,
            } => LayerSpec::max_pool2d_with(name, kernel, padding, stride.unwrap_or((kernel, kernel))),
            Block::Flatten => LayerSpec::flatten(name),
            Block::Dense { units } => LayerSpec::matmul(name, units),
        }
    }
}

/// A declarative network description: an input shape and the blocks that follow it.
///
/// Building a recipe always yields a fresh pipeline, recipes hold no state of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub input: TensorShape,
    pub blocks: Vec<Block>,
}

impl Recipe {
    /// Creates a new `Recipe` without blocks.
    ///
    /// # Arguments
    /// * `input` - The shape of every batch fed to the network.
    ///
    /// # Returns
    /// A new `Recipe` instance.
    pub fn new(input: TensorShape) -> Self {
        Self {
            input,
            blocks: Vec::new(),
        }
    }

    /// Appends a block.
    pub fn then(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    /// Appends several blocks.
    pub fn extend<I>(mut self, blocks: I) -> Self
    where
        I: IntoIterator<Item = Block>,
    {
        self.blocks.extend(blocks);
        self
    }

    /// Interprets the recipe into a wired pipeline.
    ///
    /// Layers are named after their block kind and a per-kind counter (`conv1`, `relu3`,
    /// `fc2`), framed by `input` and `output`.
    ///
    /// # Returns
    /// The finished pipeline or the first shape or configuration error.
    pub fn build(&self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new();
        pipeline.push(LayerSpec::input("input", self.input))?;

        let mut counters = [0usize; 6];
        for block in &self.blocks {
            let slot = match block {
                Block::Conv { .. } => 0,
                Block::BatchNorm => 1,
                Block::Relu => 2,
                Block::MaxPool { .. } => 3,
                Block::Flatten => 4,
                Block::Dense { .. } => 5,
            };
            counters[slot] += 1;

            let name = format!("{}{}", block.prefix(), counters[slot]);
            pipeline.push(block.to_spec(name))?;
        }

        pipeline.push(LayerSpec::output("output"))?;
        pipeline.finish()
    }
}
