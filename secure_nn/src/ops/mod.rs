mod kind;
mod params;
mod shared;

use comms::{PartyRole, Transport};
use ndarray::ArrayD;

use crate::{OpErr, exec::ExecutionContext};

pub use kind::OpKind;
pub use params::OpParams;
pub use shared::{SharedOp, SharedOpFactory};

/// A secret-share operator bound to a single layer.
///
/// It consumes this role's share of the layer input and produces this role's share of the
/// layer output, exchanging shares with the other roles through the context when needed.
#[allow(unused)]
#[trait_variant::make(SecretOp: Send)]
pub trait SecretOpTemplate {
    fn kind(&self) -> OpKind;

    /// The name of the layer the operator is bound to.
    fn name(&self) -> &str;

    /// Runs the operator on this role's share.
    ///
    /// # Arguments
    /// * `ctx` - The execution context of this role.
    /// * `x` - This role's input share.
    ///
    /// # Returns
    /// This role's output share.
    async fn forward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        x: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr>;

    /// Propagates this role's share of the output gradient to the input.
    ///
    /// # Arguments
    /// * `ctx` - The execution context of this role.
    /// * `dy` - This role's share of the gradient with respect to the output.
    ///
    /// # Returns
    /// This role's share of the gradient with respect to the input.
    async fn backward<T: Transport>(
        &mut self,
        ctx: &mut ExecutionContext<T>,
        dy: ArrayD<f32>,
    ) -> Result<ArrayD<f32>, OpErr>;
}

/// Creates the operators layers are bound to.
///
/// The factory decides the protocol; layers only know which kinds of operators they need.
pub trait OperatorFactory {
    type Op: SecretOp;

    /// Creates an operator.
    ///
    /// # Arguments
    /// * `kind` - The kind of operator wanted.
    /// * `params` - The shapes and window of the layer.
    /// * `role` - The role that will run the operator.
    /// * `name` - The name of the layer.
    ///
    /// # Returns
    /// A new operator or an error if the factory does not provide this kind.
    fn create(
        &self,
        kind: OpKind,
        params: &OpParams,
        role: PartyRole,
        name: &str,
    ) -> Result<Self::Op, OpErr>;
}
