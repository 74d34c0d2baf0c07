use std::fmt;

/// The kinds of operators a factory can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Input,
    Conv2d,
    Conv2dInputGrad,
    Conv2dWeightGrad,
    Matmul,
    BatchNorm,
    Relu,
    MaxPool2d,
    Flatten,
    Output,
}

impl OpKind {
    /// Returns a stable identifier for the operator kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Input => "input",
            OpKind::Conv2d => "conv2d",
            OpKind::Conv2dInputGrad => "conv2d_input_grad",
            OpKind::Conv2dWeightGrad => "conv2d_weight_grad",
            OpKind::Matmul => "matmul",
            OpKind::BatchNorm => "batch_norm",
            OpKind::Relu => "relu",
            OpKind::MaxPool2d => "max_pool2d",
            OpKind::Flatten => "flatten",
            OpKind::Output => "output",
        }
    }

    /// Whether the operator needs the clear values of its input and thus a round trip
    /// through the helper.
    pub fn is_non_linear(&self) -> bool {
        matches!(self, OpKind::BatchNorm | OpKind::Relu | OpKind::MaxPool2d)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
