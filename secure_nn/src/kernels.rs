//! Plaintext tensor kernels.
//!
//! The linear kernels are applied by every role to its own share, the non-linear ones only
//! ever see reconstructed values on the helper or inside the reference network.

use ndarray::{ShapeError, prelude::*};

/// Variance epsilon of the batch normalization.
pub const BN_EPS: f32 = 1e-5;

/// Geometry of a sliding window over the spatial axes of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub kernel: usize,
    pub padding: usize,
    /// `(row, column)` steps.
    pub stride: (usize, usize),
}

impl Window {
    pub fn new(kernel: usize, padding: usize, stride: (usize, usize)) -> Self {
        Self {
            kernel,
            padding,
            stride,
        }
    }

    /// Output `(height, width)` for an input of `(height, width)`.
    ///
    /// The caller must have validated the geometry through the shape calculator.
    pub fn output(&self, height: usize, width: usize) -> (usize, usize) {
        let span_h = height + 2 * self.padding;
        let span_w = width + 2 * self.padding;
        (
            (span_h - self.kernel) / self.stride.0 + 1,
            (span_w - self.kernel) / self.stride.1 + 1,
        )
    }

    /// The input position read by output position `o` at window offset `k`, `None` inside
    /// the padding.
    fn source(&self, o: usize, k: usize, stride: usize, size: usize) -> Option<usize> {
        (o * stride + k)
            .checked_sub(self.padding)
            .filter(|&i| i < size)
    }
}

/// Unrolls every window of a `(channels, height, width)` image into a column.
fn im2col(x: ArrayView3<f32>, win: &Window) -> Array2<f32> {
    let (channels, height, width) = x.dim();
    let k = win.kernel;
    let (out_h, out_w) = win.output(height, width);

    let mut cols = Array2::zeros((channels * k * k, out_h * out_w));
    for c in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = (c * k + ky) * k + kx;
                for oy in 0..out_h {
                    let Some(iy) = win.source(oy, ky, win.stride.0, height) else {
                        continue;
                    };
                    for ox in 0..out_w {
                        if let Some(ix) = win.source(ox, kx, win.stride.1, width) {
                            cols[[row, oy * out_w + ox]] = x[[c, iy, ix]];
                        }
                    }
                }
            }
        }
    }

    cols
}

/// Folds columns back into an image, adding up overlapping windows.
fn col2im(cols: ArrayView2<f32>, dim: (usize, usize, usize), win: &Window) -> Array3<f32> {
    let (channels, height, width) = dim;
    let k = win.kernel;
    let (out_h, out_w) = win.output(height, width);

    let mut x = Array3::zeros(dim);
    for c in 0..channels {
        for ky in 0..k {
            for kx in 0..k {
                let row = (c * k + ky) * k + kx;
                for oy in 0..out_h {
                    let Some(iy) = win.source(oy, ky, win.stride.0, height) else {
                        continue;
                    };
                    for ox in 0..out_w {
                        if let Some(ix) = win.source(ox, kx, win.stride.1, width) {
                            x[[c, iy, ix]] += cols[[row, oy * out_w + ox]];
                        }
                    }
                }
            }
        }
    }

    x
}

/// 2D convolution of a `(batch, channels, height, width)` tensor.
///
/// # Arguments
/// * `x` - The input.
/// * `w` - The `(out_channels, in_channels, k, k)` filters.
/// * `bias` - One value per output channel, if any.
/// * `win` - The window geometry, its kernel must match the filters.
///
/// # Returns
/// The `(batch, out_channels, height', width')` output.
pub fn conv2d(
    x: ArrayView4<f32>,
    w: ArrayView4<f32>,
    bias: Option<ArrayView1<f32>>,
    win: &Window,
) -> Result<Array4<f32>, ShapeError> {
    let (batch, _, height, width) = x.dim();
    let (out_c, in_c, k, _) = w.dim();
    let (out_h, out_w) = win.output(height, width);

    let wm = w.to_shape((out_c, in_c * k * k))?;
    let mut y = Array4::zeros((batch, out_c, out_h, out_w));

    for (xi, mut yi) in x.outer_iter().zip(y.outer_iter_mut()) {
        let cols = im2col(xi, win);
        let out = wm.dot(&cols);
        yi.assign(&out.to_shape((out_c, out_h, out_w))?);
    }

    if let Some(bias) = bias {
        for (mut channel, &b) in y.axis_iter_mut(Axis(1)).zip(bias.iter()) {
            channel += b;
        }
    }

    Ok(y)
}

/// Gradient of a convolution with respect to its input.
///
/// # Arguments
/// * `dy` - The `(batch, out_channels, height', width')` output gradient.
/// * `w` - The filters used in the forward pass.
/// * `input` - The `(channels, height, width)` of a forward input sample.
/// * `win` - The forward window geometry.
///
/// # Returns
/// The `(batch, channels, height, width)` input gradient.
pub fn conv2d_input_grad(
    dy: ArrayView4<f32>,
    w: ArrayView4<f32>,
    input: (usize, usize, usize),
    win: &Window,
) -> Result<Array4<f32>, ShapeError> {
    let (batch, out_c, out_h, out_w) = dy.dim();
    let (_, in_c, k, _) = w.dim();
    let (channels, height, width) = input;

    let wm = w.to_shape((out_c, in_c * k * k))?;
    let mut dx = Array4::zeros((batch, channels, height, width));

    for (dyi, mut dxi) in dy.outer_iter().zip(dx.outer_iter_mut()) {
        let dyi = dyi.to_shape((out_c, out_h * out_w))?;
        let cols = wm.t().dot(&dyi);
        dxi.assign(&col2im(cols.view(), input, win));
    }

    Ok(dx)
}

/// Max pooling, padded positions never win.
pub fn max_pool2d(x: ArrayView4<f32>, win: &Window) -> Array4<f32> {
    let (batch, channels, height, width) = x.dim();
    let (out_h, out_w) = win.output(height, width);

    Array4::from_shape_fn((batch, channels, out_h, out_w), |(n, c, oy, ox)| {
        let mut best = f32::NEG_INFINITY;
        for ky in 0..win.kernel {
            let Some(iy) = win.source(oy, ky, win.stride.0, height) else {
                continue;
            };
            for kx in 0..win.kernel {
                if let Some(ix) = win.source(ox, kx, win.stride.1, width) {
                    best = best.max(x[[n, c, iy, ix]]);
                }
            }
        }
        best
    })
}

/// Batch normalization with the statistics of the batch itself, per channel (axis 1).
pub fn batch_norm(x: ArrayViewD<f32>) -> ArrayD<f32> {
    let mut y = x.to_owned();

    for mut channel in y.axis_iter_mut(Axis(1)) {
        let n = channel.len() as f32;
        let mean = channel.sum() / n;
        let var = channel.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let inv_std = 1.0 / (var + BN_EPS).sqrt();

        channel.mapv_inplace(|v| (v - mean) * inv_std);
    }

    y
}

pub fn relu(x: ArrayViewD<f32>) -> ArrayD<f32> {
    x.mapv(|v| v.max(0.0))
}

/// `x · w + bias` for `(batch, in)` inputs and `(in, out)` weights.
pub fn dense(x: ArrayView2<f32>, w: ArrayView2<f32>, bias: Option<ArrayView1<f32>>) -> Array2<f32> {
    let mut y = x.dot(&w);
    if let Some(bias) = bias {
        y += &bias;
    }

    y
}

/// Gradient of a dense layer with respect to its input.
pub fn dense_input_grad(dy: ArrayView2<f32>, w: ArrayView2<f32>) -> Array2<f32> {
    dy.dot(&w.t())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Direct seven-loop convolution used as ground truth.
    fn naive_conv(x: &Array4<f32>, w: &Array4<f32>, win: &Window) -> Array4<f32> {
        let (batch, channels, height, width) = x.dim();
        let (out_c, _, k, _) = w.dim();
        let (out_h, out_w) = win.output(height, width);

        Array4::from_shape_fn((batch, out_c, out_h, out_w), |(n, o, oy, ox)| {
            let mut acc = 0.0;
            for c in 0..channels {
                for ky in 0..k {
                    for kx in 0..k {
                        let iy = (oy * win.stride.0 + ky) as isize - win.padding as isize;
                        let ix = (ox * win.stride.1 + kx) as isize - win.padding as isize;
                        if iy >= 0 && ix >= 0 && (iy as usize) < height && (ix as usize) < width {
                            acc += x[[n, c, iy as usize, ix as usize]] * w[[o, c, ky, kx]];
                        }
                    }
                }
            }
            acc
        })
    }

    fn ramp<D: Dimension>(shape: D, scale: f32) -> Array<f32, D> {
        let len = shape.size();
        Array::from_shape_vec(shape, (0..len).map(|i| (i as f32 * scale).sin()).collect()).unwrap()
    }

    #[test]
    fn conv_matches_the_direct_sum() {
        for (padding, stride) in [(0, 1), (1, 1), (2, 2), (10, 4)] {
            let x = ramp(Dim([2, 3, 9, 9]), 0.37);
            let w = ramp(Dim([4, 3, 3, 3]), 0.11);
            let win = Window::new(3, padding, (stride, stride));

            let got = conv2d(x.view(), w.view(), None, &win).unwrap();
            let expected = naive_conv(&x, &w, &win);

            assert_eq!(got.dim(), expected.dim());
            for (a, b) in got.iter().zip(expected.iter()) {
                assert!((a - b).abs() < 1e-4, "{a} != {b}");
            }
        }
    }

    #[test]
    fn conv_bias_is_per_output_channel() {
        let x = Array4::zeros((1, 1, 3, 3));
        let w = Array4::ones((2, 1, 1, 1));
        let b = Array1::from(vec![1.0, -2.0]);

        let y = conv2d(x.view(), w.view(), Some(b.view()), &Window::new(1, 0, (1, 1))).unwrap();
        assert!(y.index_axis(Axis(1), 0).iter().all(|&v| v == 1.0));
        assert!(y.index_axis(Axis(1), 1).iter().all(|&v| v == -2.0));
    }

    #[test]
    fn conv_input_grad_is_the_adjoint() {
        // <conv(x), dy> == <x, conv_input_grad(dy)>
        let win = Window::new(3, 1, (2, 2));
        let x = ramp(Dim([2, 2, 7, 7]), 0.21);
        let w = ramp(Dim([3, 2, 3, 3]), 0.53);

        let y = conv2d(x.view(), w.view(), None, &win).unwrap();
        let dy = ramp(y.raw_dim(), 0.17);
        let dx = conv2d_input_grad(dy.view(), w.view(), (2, 7, 7), &win).unwrap();

        let lhs: f32 = (&y * &dy).sum();
        let rhs: f32 = (&x * &dx).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} != {rhs}");
    }

    #[test]
    fn max_pool_ignores_padding() {
        let x = Array4::from_elem((1, 1, 2, 2), -3.0);
        let y = max_pool2d(x.view(), &Window::new(3, 1, (2, 2)));

        assert_eq!(y.dim(), (1, 1, 1, 1));
        assert_eq!(y[[0, 0, 0, 0]], -3.0);
    }

    #[test]
    fn max_pool_with_asymmetric_strides() {
        let x = Array4::from_shape_vec((1, 1, 2, 4), vec![1., 5., 2., 0., 3., 4., 9., 8.]).unwrap();
        let y = max_pool2d(x.view(), &Window::new(2, 0, (2, 2)));

        assert_eq!(y.into_raw_vec_and_offset().0, vec![5., 9.]);
    }

    #[test]
    fn batch_norm_centers_every_channel() {
        let x = ramp(Dim([4, 3, 2, 2]), 0.7).into_dyn();
        let y = batch_norm(x.view());

        for channel in y.axis_iter(Axis(1)) {
            let n = channel.len() as f32;
            let mean = channel.sum() / n;
            let var = channel.mapv(|v| (v - mean).powi(2)).sum() / n;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-2);
        }
    }

    #[test]
    fn dense_and_its_input_grad() {
        let x = Array2::from_shape_vec((1, 2), vec![1.0, 2.0]).unwrap();
        let w = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, -1.0, 0.5, 1.0, 2.0]).unwrap();
        let b = Array1::from(vec![0.0, 1.0, 0.0]);

        let y = dense(x.view(), w.view(), Some(b.view()));
        assert_eq!(y, Array2::from_shape_vec((1, 3), vec![2.0, 3.0, 3.0]).unwrap());

        let dx = dense_input_grad(Array2::ones((1, 3)).view(), w.view());
        assert_eq!(dx, Array2::from_shape_vec((1, 2), vec![0.0, 3.5]).unwrap());
    }
}
