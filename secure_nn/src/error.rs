use std::{
    error::Error,
    fmt::{self, Display},
};

use comms::MeshErr;
use ndarray::ShapeError;

use crate::ops::OpKind;

/// The result type used in the entire secure network module.
pub type Result<T> = std::result::Result<T, NnErr>;

/// The secure network module's error type.
#[derive(Debug)]
pub enum NnErr {
    /// An invalid or missing parameter, detected before any execution.
    Configuration { layer: String, detail: String },
    /// Two shapes that must agree do not.
    ShapeMismatch {
        layer: String,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    Op(OpErr),
}

impl NnErr {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Self::Configuration {
            layer: String::new(),
            detail: detail.into(),
        }
    }

    pub(crate) fn mismatch(what: &'static str, got: usize, expected: usize) -> Self {
        Self::ShapeMismatch {
            layer: String::new(),
            what,
            got,
            expected,
        }
    }

    /// Attributes this error to `name` unless it already names a layer.
    ///
    /// # Arguments
    /// * `name` - The name of the layer being processed.
    ///
    /// # Returns
    /// The same error with its layer filled in.
    pub fn at(mut self, name: &str) -> Self {
        match &mut self {
            NnErr::Configuration { layer, .. } | NnErr::ShapeMismatch { layer, .. }
                if layer.is_empty() =>
            {
                *layer = name.to_string();
            }
            _ => {}
        }

        self
    }

    /// Whether this error comes from a peer failing or leaving the lockstep.
    pub fn is_sync_failure(&self) -> bool {
        matches!(self, NnErr::Op(OpErr::Mesh(e)) if e.is_sync_failure())
    }
}

impl Display for NnErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NnErr::Configuration { layer, detail } if layer.is_empty() => {
                write!(f, "configuration error: {detail}")
            }
            NnErr::Configuration { layer, detail } => {
                write!(f, "configuration error at layer {layer}: {detail}")
            }
            NnErr::ShapeMismatch {
                layer,
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch at layer {layer}: {what} is {got}, expected {expected}"
            ),
            NnErr::Op(e) => write!(f, "operator error: {e}"),
        }
    }
}

impl Error for NnErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NnErr::Op(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OpErr> for NnErr {
    fn from(value: OpErr) -> Self {
        Self::Op(value)
    }
}

/// Failures of a single secret-share operator.
#[derive(Debug)]
pub enum OpErr {
    Mesh(MeshErr),
    Unsupported {
        op: String,
        kind: OpKind,
        pass: &'static str,
    },
    Tensor(ShapeError),
    Length {
        op: String,
        got: usize,
        expected: usize,
    },
    Weights(String),
}

impl Display for OpErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpErr::Mesh(e) => write!(f, "{e}"),
            OpErr::Unsupported { op, kind, pass } => {
                write!(f, "{op}: {kind} has no secret-shared {pass} pass")
            }
            OpErr::Tensor(e) => write!(f, "tensor error: {e}"),
            OpErr::Length { op, got, expected } => write!(
                f,
                "{op}: share holds {got} values, expected {expected}"
            ),
            OpErr::Weights(detail) => write!(f, "weight initialization failed: {detail}"),
        }
    }
}

impl Error for OpErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OpErr::Mesh(e) => Some(e),
            OpErr::Tensor(e) => Some(e),
            _ => None,
        }
    }
}

impl From<MeshErr> for OpErr {
    fn from(value: MeshErr) -> Self {
        Self::Mesh(value)
    }
}

impl From<ShapeError> for OpErr {
    fn from(value: ShapeError) -> Self {
        Self::Tensor(value)
    }
}
