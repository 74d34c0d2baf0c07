use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{NnErr, Result};

/// The shape of a tensor flowing between layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorShape {
    Image {
        batch: usize,
        channels: usize,
        height: usize,
        width: usize,
    },
    Flat {
        batch: usize,
        features: usize,
    },
}

impl TensorShape {
    pub fn image(batch: usize, channels: usize, height: usize, width: usize) -> Self {
        Self::Image {
            batch,
            channels,
            height,
            width,
        }
    }

    pub fn flat(batch: usize, features: usize) -> Self {
        Self::Flat { batch, features }
    }

    pub fn batch(&self) -> usize {
        match *self {
            TensorShape::Image { batch, .. } | TensorShape::Flat { batch, .. } => batch,
        }
    }

    /// The amount of values of a single sample.
    pub fn per_sample(&self) -> usize {
        match *self {
            TensorShape::Image {
                channels,
                height,
                width,
                ..
            } => channels * height * width,
            TensorShape::Flat { features, .. } => features,
        }
    }

    /// The amount of values of the whole tensor.
    pub fn numel(&self) -> usize {
        self.batch() * self.per_sample()
    }

    /// The dimensions in `ndarray` order.
    pub fn dims(&self) -> Vec<usize> {
        match *self {
            TensorShape::Image {
                batch,
                channels,
                height,
                width,
            } => vec![batch, channels, height, width],
            TensorShape::Flat { batch, features } => vec![batch, features],
        }
    }

    /// The dimensions of a single sample.
    pub fn sample_dims(&self) -> Vec<usize> {
        self.dims().split_off(1)
    }

    /// Returns the same shape with another batch size.
    pub fn with_batch(self, batch: usize) -> Self {
        match self {
            TensorShape::Image {
                channels,
                height,
                width,
                ..
            } => Self::image(batch, channels, height, width),
            TensorShape::Flat { features, .. } => Self::flat(batch, features),
        }
    }

    fn check_positive(&self) -> Result<()> {
        if self.dims().contains(&0) {
            return Err(NnErr::config(format!("every dimension of {self} must be positive")));
        }

        Ok(())
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorShape::Image {
                batch,
                channels,
                height,
                width,
            } => write!(f, "({batch}, {channels}, {height}, {width})"),
            TensorShape::Flat { batch, features } => write!(f, "({batch}, {features})"),
        }
    }
}

/// The shape of a square convolution filter bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterShape {
    pub out_channels: usize,
    pub in_channels: usize,
    pub filter_hw: usize,
}

impl FilterShape {
    pub fn new(out_channels: usize, in_channels: usize, filter_hw: usize) -> Self {
        Self {
            out_channels,
            in_channels,
            filter_hw,
        }
    }

    /// `(out_channels, in_channels, filter_hw, filter_hw)`.
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (
            self.out_channels,
            self.in_channels,
            self.filter_hw,
            self.filter_hw,
        )
    }

    /// The amount of inputs feeding a single output value.
    pub fn fan_in(&self) -> usize {
        self.in_channels * self.filter_hw * self.filter_hw
    }
}

/// Padding used by a convolution when none is given.
///
/// For even filters this is the floor of `(filter_hw - 1) / 2`, so the output is one row
/// and one column smaller than the input.
pub fn default_padding(filter_hw: usize) -> usize {
    filter_hw.saturating_sub(1) / 2
}

/// Output size along one spatial axis: `floor((size + 2 * padding - kernel) / stride) + 1`.
///
/// # Arguments
/// * `axis` - The axis name, for error reporting.
/// * `size` - The input size along the axis.
/// * `kernel` - The window size.
/// * `padding` - The zero padding added on both sides.
/// * `stride` - The window step.
///
/// # Returns
/// The output size or a configuration error if it would not be positive.
pub fn spatial_output(
    axis: &str,
    size: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
) -> Result<usize> {
    if stride == 0 {
        return Err(NnErr::config(format!("{axis} stride must be positive")));
    }

    if kernel == 0 {
        return Err(NnErr::config(format!("{axis} window must be positive")));
    }

    let span = size + 2 * padding;
    if span < kernel {
        return Err(NnErr::config(format!(
            "{axis} window {kernel} is larger than the padded input {span}, the output would be empty"
        )));
    }

    Ok((span - kernel) / stride + 1)
}

/// Computes the output shape of a 2D convolution.
///
/// # Arguments
/// * `x` - The input shape, must be an image.
/// * `w` - The filter bank.
/// * `padding` - The zero padding on every side.
/// * `stride` - The step along both axes.
///
/// # Returns
/// `(batch, out_channels, height', width')` or an error if the parameters are invalid.
pub fn conv2d_output_shape(
    x: TensorShape,
    w: FilterShape,
    padding: usize,
    stride: usize,
) -> Result<TensorShape> {
    let TensorShape::Image {
        batch,
        channels,
        height,
        width,
    } = x
    else {
        return Err(NnErr::config(format!(
            "a convolution needs an image input, got {x}"
        )));
    };

    x.check_positive()?;

    if w.out_channels == 0 {
        return Err(NnErr::config("a convolution needs at least one filter"));
    }

    if w.in_channels != channels {
        return Err(NnErr::mismatch("filter input channels", w.in_channels, channels));
    }

    let out_h = spatial_output("height", height, w.filter_hw, padding, stride)?;
    let out_w = spatial_output("width", width, w.filter_hw, padding, stride)?;

    Ok(TensorShape::image(batch, w.out_channels, out_h, out_w))
}

/// Computes the output shape of a 2D max pooling.
///
/// # Arguments
/// * `x` - The input shape, must be an image.
/// * `kernel` - The square window size.
/// * `padding` - The padding on every side, at most half the window.
/// * `stride` - The `(row, column)` steps.
///
/// # Returns
/// The pooled shape, channels untouched.
pub fn pool2d_output_shape(
    x: TensorShape,
    kernel: usize,
    padding: usize,
    stride: (usize, usize),
) -> Result<TensorShape> {
    let TensorShape::Image {
        batch,
        channels,
        height,
        width,
    } = x
    else {
        return Err(NnErr::config(format!("pooling needs an image input, got {x}")));
    };

    x.check_positive()?;

    if 2 * padding > kernel {
        return Err(NnErr::config(format!(
            "pooling padding {padding} must be at most half the window {kernel}"
        )));
    }

    let out_h = spatial_output("height", height, kernel, padding, stride.0)?;
    let out_w = spatial_output("width", width, kernel, padding, stride.1)?;

    Ok(TensorShape::image(batch, channels, out_h, out_w))
}

/// Collapses every non-batch dimension into one.
pub fn flatten_shape(x: TensorShape) -> TensorShape {
    TensorShape::flat(x.batch(), x.per_sample())
}

/// Computes the output shape of a dense layer.
///
/// # Arguments
/// * `x` - The input shape, must be flat.
/// * `units` - The amount of output units.
///
/// # Returns
/// `(batch, units)`.
pub fn matmul_output_shape(x: TensorShape, units: usize) -> Result<TensorShape> {
    let TensorShape::Flat { batch, .. } = x else {
        return Err(NnErr::config(format!(
            "a dense layer needs a flat input, got {x}, add a flatten layer first"
        )));
    };

    x.check_positive()?;

    if units == 0 {
        return Err(NnErr::config("a dense layer needs at least one unit"));
    }

    Ok(TensorShape::flat(batch, units))
}
