//! Secret-shared neural network pipelines.
//!
//! A network is described by a [`Recipe`] or one of the predefined [`Topology`] values,
//! wired into a [`Pipeline`] whose shapes are all known before anything runs, and bound to
//! the operators of one role as a [`SecretPipeline`].

pub mod arch;
mod error;
pub mod exec;
pub mod kernels;
pub mod layers;
pub mod loss;
pub mod ops;
mod pipeline;
pub mod reference;
pub mod shape;
pub mod weights;

pub use arch::{ArchSpec, Block, Recipe, Topology};
pub use error::{NnErr, OpErr, Result};
pub use exec::{ExecutionContext, SecretLayer, SecretPipeline};
pub use ops::{OpKind, OpParams, OperatorFactory, SecretOp, SharedOp, SharedOpFactory};
pub use pipeline::Pipeline;
pub use reference::ReferenceNet;
pub use shape::{FilterShape, TensorShape};
