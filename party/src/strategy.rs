use comms::PartyRole;
use secure_nn::{SecretOp, SecretPipeline};

use crate::{Result, data::Batch};

/// What a role feeds into the boundary layers of each batch.
///
/// Selected once at startup from the role, so the rest of the party never branches on the
/// role itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleStrategy {
    /// Loads the real inputs and targets of every batch.
    DataOwner,
    /// Never touches plaintext, its boundary layers hold placeholders.
    Helper,
}

impl RoleStrategy {
    pub fn for_role(role: PartyRole) -> Self {
        if role.sees_plaintext() {
            Self::DataOwner
        } else {
            Self::Helper
        }
    }

    /// Returns a stable identifier for the strategy kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RoleStrategy::DataOwner => "data_owner",
            RoleStrategy::Helper => "helper",
        }
    }

    /// Stages the batch inputs if this role may see them.
    ///
    /// # Returns
    /// Whether real values were loaded.
    pub fn maybe_load_input<O: SecretOp>(
        &self,
        pipeline: &mut SecretPipeline<O>,
        batch: &Batch,
    ) -> Result<bool> {
        match self {
            RoleStrategy::DataOwner => {
                pipeline.set_input(batch.inputs.clone())?;
                Ok(true)
            }
            RoleStrategy::Helper => Ok(false),
        }
    }

    /// Stages the batch targets if this role may see them.
    ///
    /// # Returns
    /// Whether real values were loaded.
    pub fn maybe_load_target<O: SecretOp>(
        &self,
        pipeline: &mut SecretPipeline<O>,
        batch: &Batch,
    ) -> Result<bool> {
        match self {
            RoleStrategy::DataOwner => {
                pipeline.load_target(batch.targets.clone())?;
                Ok(true)
            }
            RoleStrategy::Helper => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use secure_nn::{Block, Recipe, SharedOp, SharedOpFactory, TensorShape};

    use super::*;

    fn pipeline(role: PartyRole) -> SecretPipeline<SharedOp> {
        let pipeline = Recipe::new(TensorShape::flat(2, 3))
            .then(Block::dense(2))
            .build()
            .unwrap();
        SecretPipeline::bind(pipeline, &SharedOpFactory::new(0), role).unwrap()
    }

    fn batch() -> Batch {
        Batch {
            inputs: ArrayD::ones(IxDyn(&[2, 3])),
            targets: vec![1, 0],
        }
    }

    #[test]
    fn roles_map_to_strategies() {
        assert_eq!(RoleStrategy::for_role(PartyRole::Role0), RoleStrategy::DataOwner);
        assert_eq!(RoleStrategy::for_role(PartyRole::Role1), RoleStrategy::DataOwner);
        assert_eq!(RoleStrategy::for_role(PartyRole::Role2), RoleStrategy::Helper);
        assert_eq!(RoleStrategy::Helper.kind(), "helper");
    }

    #[test]
    fn helper_loads_nothing() {
        let mut p = pipeline(PartyRole::Role2);
        let strategy = RoleStrategy::for_role(PartyRole::Role2);

        assert!(!strategy.maybe_load_input(&mut p, &batch()).unwrap());
        assert!(!strategy.maybe_load_target(&mut p, &batch()).unwrap());
    }

    #[test]
    fn data_owner_loads_both() {
        let mut p = pipeline(PartyRole::Role1);
        let strategy = RoleStrategy::for_role(PartyRole::Role1);

        assert!(strategy.maybe_load_input(&mut p, &batch()).unwrap());
        assert!(strategy.maybe_load_target(&mut p, &batch()).unwrap());
    }
}
