use comms::{PartyRole, Transport};
use log::{debug, warn};
use ndarray::{Array2, ArrayD, Ix2, IxDyn};

use super::ExecutionContext;
use crate::{
    NnErr, OpErr, Pipeline, Result, TensorShape,
    layers::Layer,
    loss::{CrossEntropy, LossFn},
    ops::{OpKind, OperatorFactory, SecretOp},
};

/// A layer bound to the operators that execute it on one role.
#[derive(Debug)]
pub struct SecretLayer<O> {
    layer: Layer,
    ops: Vec<O>,
    output: Option<ArrayD<f32>>,
}

impl<O: SecretOp> SecretLayer<O> {
    fn bind<F>(layer: Layer, factory: &F, role: PartyRole) -> Result<Self>
    where
        F: OperatorFactory<Op = O>,
    {
        let params = layer.op_params();
        let ops = layer
            .op_kinds()
            .iter()
            .map(|&kind| factory.create(kind, &params, role, layer.name()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| NnErr::from(e).at(layer.name()))?;

        Ok(Self {
            layer,
            ops,
            output: None,
        })
    }

    pub fn layer(&self) -> &Layer {
        &self.layer
    }

    pub fn ops(&self) -> &[O] {
        &self.ops
    }

    /// This role's share of the last forward output, until the caches are released.
    pub fn output(&self) -> Option<&ArrayD<f32>> {
        self.output.as_ref()
    }

    fn op(&mut self, kind: Option<OpKind>) -> Result<&mut O> {
        let found = match kind {
            Some(kind) => self.ops.iter_mut().find(|op| op.kind() == kind),
            None => self.ops.first_mut(),
        };

        found.ok_or_else(|| {
            NnErr::config(format!("no operator bound for {}", self.layer.kind().as_str()))
                .at(self.layer.name())
        })
    }

    async fn forward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        check(&self.layer, "input values", &x, self.layer.input_shape())?;

        let y = self.op(None)?.forward(ctx, x).await?;
        self.output = Some(y.clone());
        Ok(y)
    }

    async fn backward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        dy: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        check(&self.layer, "output gradient", &dy, self.layer.output_shape())?;

        // a convolution's input gradient is the forward pass of its transposed operator
        if self.ops.iter().any(|op| op.kind() == OpKind::Conv2dInputGrad) {
            let op = self.op(Some(OpKind::Conv2dInputGrad))?;
            return Ok(op.forward(ctx, dy).await?);
        }

        Ok(self.op(None)?.backward(ctx, dy).await?)
    }
}

fn check(layer: &Layer, what: &'static str, x: &ArrayD<f32>, shape: TensorShape) -> Result<()> {
    if x.shape() != shape.dims().as_slice() {
        return Err(NnErr::mismatch(what, x.len(), shape.numel()).at(layer.name()));
    }

    Ok(())
}

/// A pipeline bound to the operators of one role.
///
/// Data owners stage the batch input and targets before each forward pass, the helper
/// feeds placeholders. After the forward pass data owners hold the revealed logits.
#[derive(Debug)]
pub struct SecretPipeline<O> {
    role: PartyRole,
    pipeline: Pipeline,
    layers: Vec<SecretLayer<O>>,
    input: Option<ArrayD<f32>>,
    targets: Option<Vec<usize>>,
    revealed: Option<Array2<f32>>,
    loss: Option<f32>,
    forwards: usize,
}

impl<O: SecretOp> SecretPipeline<O> {
    /// Binds every layer of `pipeline` to operators created by `factory`.
    ///
    /// # Arguments
    /// * `pipeline` - A finished pipeline.
    /// * `factory` - Creates the operators each layer asks for.
    /// * `role` - The role that will execute the pipeline.
    ///
    /// # Returns
    /// The bound pipeline or the first layer whose operators could not be created.
    pub fn bind<F>(pipeline: Pipeline, factory: &F, role: PartyRole) -> Result<Self>
    where
        F: OperatorFactory<Op = O>,
    {
        let layers = pipeline
            .layers()
            .iter()
            .map(|layer| SecretLayer::bind(layer.clone(), factory, role))
            .collect::<Result<Vec<_>>>()?;

        debug!(role = role.id(); "bound {} layers", layers.len());

        Ok(Self {
            role,
            pipeline,
            layers,
            input: None,
            targets: None,
            revealed: None,
            loss: None,
            forwards: 0,
        })
    }

    pub fn role(&self) -> PartyRole {
        self.role
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn layers(&self) -> &[SecretLayer<O>] {
        &self.layers
    }

    /// Looks a bound layer up by name.
    pub fn get(&self, name: &str) -> Option<&SecretLayer<O>> {
        self.pipeline
            .get(name)
            .and_then(|layer| self.layers.get(layer.index()))
    }

    pub fn batch_size(&self) -> usize {
        self.pipeline.batch_size().unwrap_or_default()
    }

    /// The amount of completed forward passes.
    pub fn forwards(&self) -> usize {
        self.forwards
    }

    fn input_shape(&self) -> Result<TensorShape> {
        self.pipeline
            .input_shape()
            .ok_or_else(|| NnErr::config("the pipeline has no layers"))
    }

    fn ensure_data_owner(&self, what: &str) -> Result<()> {
        if !self.role.sees_plaintext() {
            return Err(NnErr::config(format!("{} may not load {what}", self.role)));
        }

        Ok(())
    }

    /// Stages the plaintext input of the next forward pass.
    ///
    /// # Arguments
    /// * `x` - The batch, its shape must match the pipeline input exactly.
    ///
    /// # Returns
    /// An error if the shape differs or this role may not see plaintext.
    pub fn set_input(&mut self, x: ArrayD<f32>) -> Result<()> {
        self.ensure_data_owner("inputs")?;

        let shape = self.input_shape()?;
        if x.shape() != shape.dims().as_slice() {
            let err = NnErr::mismatch("input values", x.len(), shape.numel());
            return Err(err.at(self.layers[0].layer.name()));
        }

        self.input = Some(x);
        Ok(())
    }

    /// Stages the class labels of the next forward pass.
    ///
    /// # Arguments
    /// * `targets` - One class index per sample of the batch.
    ///
    /// # Returns
    /// An error if the amount of labels differs from the batch size, a label is out of range
    /// or this role may not see plaintext.
    pub fn load_target(&mut self, targets: Vec<usize>) -> Result<()> {
        self.ensure_data_owner("targets")?;

        let batch = self.batch_size();
        if targets.len() != batch {
            return Err(NnErr::mismatch("targets", targets.len(), batch));
        }

        let classes = self
            .pipeline
            .output_shape()
            .map_or(0, |shape| shape.per_sample());
        if let Some(&bad) = targets.iter().find(|&&t| t >= classes) {
            return Err(NnErr::config(format!(
                "target class {bad} is out of range for {classes} classes"
            )));
        }

        self.targets = Some(targets);
        Ok(())
    }

    /// Runs every layer in order on this role's shares.
    ///
    /// The staged input is consumed, roles without one feed zeros. Data owners keep the
    /// revealed logits and, if targets were loaded, the batch loss.
    ///
    /// # Arguments
    /// * `ctx` - The execution context of this role.
    pub async fn forward<T: Transport>(&mut self, ctx: &mut ExecutionContext<T>) -> Result<()> {
        let shape = self.input_shape()?;
        let mut x = self
            .input
            .take()
            .unwrap_or_else(|| ArrayD::zeros(IxDyn(&shape.dims())));

        self.revealed = None;
        self.loss = None;

        for layer in &mut self.layers {
            x = layer.forward(ctx, x).await.inspect_err(|e| {
                warn!(layer = layer.layer.index(); "{} failed: {e}", layer.layer.name());
            })?;
        }

        self.forwards += 1;
        let targets = self.targets.take();

        if self.role.sees_plaintext() {
            let logits = x.into_dimensionality::<Ix2>().map_err(OpErr::from)?;
            self.loss = targets.map(|t| CrossEntropy.loss(logits.view(), &t));
            self.revealed = Some(logits);
        }

        Ok(())
    }

    /// Propagates a share of the output gradient back to the input, layer by layer.
    ///
    /// # Arguments
    /// * `ctx` - The execution context of this role.
    /// * `dy` - This role's share of the gradient with respect to the logits.
    ///
    /// # Returns
    /// This role's share of the gradient with respect to the input, or the first layer whose
    /// operators have no backward pass.
    pub async fn backward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        dy: ArrayD<f32>,
    ) -> Result<ArrayD<f32>> {
        let mut dx = dy;
        for layer in self.layers.iter_mut().rev() {
            dx = layer.backward(ctx, dx).await.inspect_err(|e| {
                warn!(layer = layer.layer.index(); "{} backward failed: {e}", layer.layer.name());
            })?;
        }

        Ok(dx)
    }

    /// The logits opened by the last forward pass, only on data owners.
    pub fn revealed(&self) -> Option<&Array2<f32>> {
        self.revealed.as_ref()
    }

    /// The cross entropy of the last forward pass, if targets were loaded.
    pub fn loss(&self) -> Option<f32> {
        self.loss
    }

    /// Drops every buffer kept from previous batches.
    pub fn release_caches(&mut self) {
        for layer in &mut self.layers {
            layer.output = None;
        }

        self.input = None;
        self.targets = None;
        self.revealed = None;
        self.loss = None;
    }
}
