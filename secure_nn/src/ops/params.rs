use crate::{TensorShape, kernels::Window, shape::FilterShape};

/// Everything an operator needs to know about the layer it is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpParams {
    /// The position of the layer, used to tag every share the operator exchanges.
    pub layer: u32,
    pub input: TensorShape,
    pub output: TensorShape,
    pub filter: Option<FilterShape>,
    /// Pooling window size.
    pub kernel: usize,
    pub padding: usize,
    /// `(row, column)` steps.
    pub stride: (usize, usize),
}

impl OpParams {
    /// Creates a new `OpParams` for a layer without window or filter.
    ///
    /// # Arguments
    /// * `layer` - The position of the layer in its pipeline.
    /// * `input` - The layer's input shape.
    /// * `output` - The layer's output shape.
    ///
    /// # Returns
    /// A new `OpParams` instance.
    pub fn new(layer: u32, input: TensorShape, output: TensorShape) -> Self {
        Self {
            layer,
            input,
            output,
            filter: None,
            kernel: 0,
            padding: 0,
            stride: (1, 1),
        }
    }

    /// The sliding window of a convolution or pooling.
    pub fn window(&self) -> Window {
        let kernel = self.filter.map_or(self.kernel, |f| f.filter_hw);
        Window::new(kernel, self.padding, self.stride)
    }
}
