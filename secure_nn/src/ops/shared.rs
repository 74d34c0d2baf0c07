use std::borrow::Cow;

use comms::{PartyRole, Transport};
use log::trace;
use ndarray::{ErrorKind, ShapeError, prelude::*};

use super::{OpKind, OpParams, OperatorFactory, SecretOp};
use crate::{
    OpErr, TensorShape,
    exec::ExecutionContext,
    kernels::{self, Window},
    weights::{self, ConvWeights, DenseWeights},
};

/// Creates additive-share operators whose weights are public and derived from a seed.
///
/// Linear operators run locally on each share. Non-linear ones send both data owner shares
/// to the helper, which reconstructs the values, applies the function and deals fresh shares
/// of the result back.
#[derive(Debug, Clone, Copy)]
pub struct SharedOpFactory {
    seed: u64,
}

impl SharedOpFactory {
    /// Creates a new `SharedOpFactory`.
    ///
    /// # Arguments
    /// * `seed` - The model seed every role must agree on.
    ///
    /// # Returns
    /// A new `SharedOpFactory` instance.
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl OperatorFactory for SharedOpFactory {
    type Op = SharedOp;

    fn create(
        &self,
        kind: OpKind,
        params: &OpParams,
        role: PartyRole,
        name: &str,
    ) -> Result<SharedOp, OpErr> {
        let kernel = match kind {
            OpKind::Input => Kernel::Input,
            OpKind::Output => Kernel::Output,
            OpKind::Conv2d => Kernel::Conv {
                weights: self.conv(params, name)?,
                window: params.window(),
            },
            OpKind::Conv2dInputGrad => Kernel::ConvInputGrad {
                w: self.conv(params, name)?.w,
                window: params.window(),
                input: image_dims(params.input)?,
            },
            OpKind::Conv2dWeightGrad => Kernel::ConvWeightGrad,
            OpKind::Matmul => Kernel::Matmul(weights::dense_weights(
                self.seed,
                name,
                params.input.per_sample(),
                params.output.per_sample(),
            )?),
            OpKind::Flatten => Kernel::Flatten,
            OpKind::Relu => Kernel::Relu,
            OpKind::BatchNorm => Kernel::BatchNorm,
            OpKind::MaxPool2d => Kernel::MaxPool(params.window()),
        };

        Ok(SharedOp {
            kind,
            name: name.to_string(),
            role,
            params: *params,
            kernel,
        })
    }
}

impl SharedOpFactory {
    fn conv(&self, params: &OpParams, name: &str) -> Result<ConvWeights, OpErr> {
        let filter = params
            .filter
            .ok_or_else(|| OpErr::Weights(format!("{name} has no filter shape")))?;

        weights::conv_weights(self.seed, name, filter)
    }
}

fn image_dims(shape: TensorShape) -> Result<(usize, usize, usize), OpErr> {
    match shape {
        TensorShape::Image {
            channels,
            height,
            width,
            ..
        } => Ok((channels, height, width)),
        TensorShape::Flat { .. } => Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into()),
    }
}

#[derive(Debug)]
enum Kernel {
    Input,
    Output,
    Conv {
        weights: ConvWeights,
        window: Window,
    },
    ConvInputGrad {
        w: Array4<f32>,
        window: Window,
        input: (usize, usize, usize),
    },
    ConvWeightGrad,
    Matmul(DenseWeights),
    Flatten,
    Relu,
    BatchNorm,
    MaxPool(Window),
}

/// An additive-share operator created by `SharedOpFactory`.
#[derive(Debug)]
pub struct SharedOp {
    kind: OpKind,
    name: String,
    role: PartyRole,
    params: OpParams,
    kernel: Kernel,
}

impl SharedOp {
    pub fn params(&self) -> &OpParams {
        &self.params
    }

    /// The shapes consumed and produced by `forward`.
    fn forward_shapes(&self) -> (TensorShape, TensorShape) {
        match self.kind {
            OpKind::Conv2dInputGrad => (self.params.output, self.params.input),
            _ => (self.params.input, self.params.output),
        }
    }

    fn unsupported(&self, pass: &'static str) -> OpErr {
        OpErr::Unsupported {
            op: self.name.clone(),
            kind: self.kind,
            pass,
        }
    }

    /// Checks `x` holds `shape.numel()` values and gives it `shape`'s dimensions.
    fn shaped(&self, x: ArrayD<f32>, shape: TensorShape) -> Result<ArrayD<f32>, OpErr> {
        if x.len() != shape.numel() {
            return Err(OpErr::Length {
                op: self.name.clone(),
                got: x.len(),
                expected: shape.numel(),
            });
        }

        let dims = shape.dims();
        if x.shape() == dims.as_slice() {
            return Ok(x);
        }

        Ok(x.to_shape(dims)?.into_owned())
    }

    async fn send<T: Transport>(
        &self,
        ctx: &mut ExecutionContext<T>,
        to: PartyRole,
        x: &ArrayD<f32>,
    ) -> Result<(), OpErr> {
        let values = flat(x);
        ctx.link().send_share(to, self.params.layer, &values).await?;
        Ok(())
    }

    async fn recv<T: Transport>(
        &self,
        ctx: &mut ExecutionContext<T>,
        from: PartyRole,
        shape: TensorShape,
    ) -> Result<ArrayD<f32>, OpErr> {
        let values = ctx.link().recv_share(from, self.params.layer).await?;
        if values.len() != shape.numel() {
            return Err(OpErr::Length {
                op: self.name.clone(),
                got: values.len(),
                expected: shape.numel(),
            });
        }

        Ok(ArrayD::from_shape_vec(IxDyn(&shape.dims()), values)?)
    }

    /// Splits the master's input into a random mask for the second data owner and the masked
    /// remainder. The helper's share is zero.
    async fn share_input<T: Transport>(
        &self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        match self.role {
            PartyRole::Role0 => {
                let mask = ctx.mask(x.raw_dim());
                self.send(ctx, PartyRole::Role1, &mask).await?;
                Ok(x - &mask)
            }
            PartyRole::Role1 => self.recv(ctx, PartyRole::Role0, self.params.input).await,
            PartyRole::Role2 => Ok(ArrayD::zeros(x.raw_dim())),
        }
    }

    /// Opens the output to both data owners, the helper keeps its share.
    async fn reveal<T: Transport>(
        &self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        let shape = self.params.output;

        match self.role {
            PartyRole::Role2 => {
                self.send(ctx, PartyRole::Role0, &x).await?;
                self.send(ctx, PartyRole::Role1, &x).await?;
                Ok(x)
            }
            PartyRole::Role0 => {
                let helper = self.recv(ctx, PartyRole::Role2, shape).await?;
                self.send(ctx, PartyRole::Role1, &x).await?;
                let other = self.recv(ctx, PartyRole::Role1, shape).await?;
                Ok(x + &other + &helper)
            }
            PartyRole::Role1 => {
                let helper = self.recv(ctx, PartyRole::Role2, shape).await?;
                let other = self.recv(ctx, PartyRole::Role0, shape).await?;
                self.send(ctx, PartyRole::Role0, &x).await?;
                Ok(x + &other + &helper)
            }
        }
    }

    async fn through_helper<T: Transport>(
        &self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        let helper = PartyRole::helper();
        if self.role != helper {
            self.send(ctx, helper, &x).await?;
            return self.recv(ctx, helper, self.params.output).await;
        }

        let first = self.recv(ctx, PartyRole::Role0, self.params.input).await?;
        let second = self.recv(ctx, PartyRole::Role1, self.params.input).await?;
        let y = self.apply(x + &first + &second)?;

        let mask = ctx.mask(y.raw_dim());
        self.send(ctx, PartyRole::Role0, &(&y - &mask)).await?;
        self.send(ctx, PartyRole::Role1, &mask).await?;
        Ok(ArrayD::zeros(y.raw_dim()))
    }

    /// Applies a non-linear function to reconstructed values.
    fn apply(&self, x: ArrayD<f32>) -> Result<ArrayD<f32>, OpErr> {
        match &self.kernel {
            Kernel::Relu => Ok(kernels::relu(x.view())),
            Kernel::BatchNorm => Ok(kernels::batch_norm(x.view())),
            Kernel::MaxPool(window) => {
                let x = x.into_dimensionality::<Ix4>()?;
                Ok(kernels::max_pool2d(x.view(), window).into_dyn())
            }
            _ => Err(self.unsupported("forward")),
        }
    }
}

impl SecretOp for SharedOp {
    fn kind(&self) -> OpKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn forward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        let (input, output) = self.forward_shapes();
        let x = self.shaped(x, input)?;
        trace!(layer = self.params.layer; "{} {} forward", self.name, self.kind);

        match &self.kernel {
            Kernel::Input => self.share_input(ctx, x).await,
            Kernel::Output => self.reveal(ctx, x).await,
            Kernel::Conv { weights, window } => {
                let bias = self.role.is_master().then(|| weights.b.view());
                let x = x.into_dimensionality::<Ix4>()?;
                Ok(kernels::conv2d(x.view(), weights.w.view(), bias, window)?.into_dyn())
            }
            Kernel::ConvInputGrad { w, window, input } => {
                let dy = x.into_dimensionality::<Ix4>()?;
                Ok(kernels::conv2d_input_grad(dy.view(), w.view(), *input, window)?.into_dyn())
            }
            Kernel::Matmul(weights) => {
                let bias = self.role.is_master().then(|| weights.b.view());
                let x = x.into_dimensionality::<Ix2>()?;
                Ok(kernels::dense(x.view(), weights.w.view(), bias).into_dyn())
            }
            Kernel::Flatten => self.shaped(x, output),
            Kernel::Relu | Kernel::BatchNorm | Kernel::MaxPool(_) => {
                self.through_helper(ctx, x).await
            }
            Kernel::ConvWeightGrad => Err(self.unsupported("forward")),
        }
    }

    async fn backward<T: Transport>(
        &mut self,
        _ctx: &mut ExecutionContext<T>,
        dy: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr> {
        let (input, output) = self.forward_shapes();
        let dy = self.shaped(dy, output)?;
        trace!(layer = self.params.layer; "{} {} backward", self.name, self.kind);

        match &self.kernel {
            Kernel::Input | Kernel::Output => Ok(dy),
            Kernel::Flatten => self.shaped(dy, input),
            Kernel::Matmul(weights) => {
                let dy = dy.into_dimensionality::<Ix2>()?;
                Ok(kernels::dense_input_grad(dy.view(), weights.w.view()).into_dyn())
            }
            _ => Err(self.unsupported("backward")),
        }
    }
}

fn flat(x: &ArrayD<f32>) -> Cow<'_, [f32]> {
    match x.as_slice() {
        Some(values) => Cow::Borrowed(values),
        None => Cow::Owned(x.iter().copied().collect()),
    }
}
