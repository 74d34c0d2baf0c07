use std::fmt;

use comms::{PartyRole, Transport};
use log::{debug, warn};
use ndarray::Array2;
use secure_nn::{ExecutionContext, NnErr, SecretOp, SecretPipeline};

use crate::{PartyErr, Result, data::Batch, strategy::RoleStrategy};

/// Where a role stands within the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingBarrier,
    Executing,
    Completed,
    /// Terminal, entered on any fatal error.
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::AwaitingBarrier => "awaiting_barrier",
            Phase::Executing => "executing",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal step of the batch cycle.
    pub fn can_become(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::AwaitingBarrier)
                | (Phase::AwaitingBarrier, Phase::Executing)
                | (Phase::Executing, Phase::Completed)
                | (Phase::Completed, Phase::Idle)
        ) || (self != Phase::Failed && next == Phase::Failed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The outcome of one executed batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Cross entropy of the revealed logits, only on data owners.
    pub loss: Option<f32>,
    pub logits: Option<Array2<f32>>,
}

/// Drives a role through the batch cycle: stage the data, meet the other roles at the
/// barrier, run the forward pass.
#[derive(Debug)]
pub struct PartyCoordinator<T, O> {
    ctx: ExecutionContext<T>,
    pipeline: SecretPipeline<O>,
    strategy: RoleStrategy,
    phase: Phase,
}

impl<T, O> PartyCoordinator<T, O>
where
    T: Transport,
    O: SecretOp,
{
    /// Creates a new `PartyCoordinator`.
    ///
    /// # Arguments
    /// * `ctx` - The execution context of this role.
    /// * `pipeline` - The pipeline bound to this role's operators.
    ///
    /// # Returns
    /// A new `PartyCoordinator` in the `Idle` phase.
    pub fn new(ctx: ExecutionContext<T>, pipeline: SecretPipeline<O>) -> Self {
        ctx.init();
        let strategy = RoleStrategy::for_role(ctx.role());
        debug!(role = ctx.role().id(); "coordinating as {}", strategy.kind());

        Self {
            ctx,
            pipeline,
            strategy,
            phase: Phase::Idle,
        }
    }

    pub fn role(&self) -> PartyRole {
        self.ctx.role()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn strategy(&self) -> RoleStrategy {
        self.strategy
    }

    pub fn pipeline(&self) -> &SecretPipeline<O> {
        &self.pipeline
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_become(next) {
            return Err(PartyErr::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }

        self.phase = next;
        Ok(())
    }

    /// Executes one batch on this role.
    ///
    /// # Arguments
    /// * `epoch` - The current epoch.
    /// * `index` - The batch counter within the epoch, identical on every role.
    /// * `batch` - The batch, ignored by roles that may not see it.
    ///
    /// # Returns
    /// The batch report, or the error that moved the coordinator to `Failed`.
    pub async fn run_batch(
        &mut self,
        epoch: usize,
        index: usize,
        batch: &Batch,
    ) -> Result<BatchReport> {
        if !self.phase.can_become(Phase::AwaitingBarrier) {
            return Err(PartyErr::InvalidTransition {
                from: self.phase,
                to: Phase::AwaitingBarrier,
            });
        }

        match self.execute(epoch, index, batch).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(role = self.role().id(), epoch, batch = index; "batch failed in {}: {e}", self.phase);
                self.phase = Phase::Failed;
                Err(e)
            }
        }
    }

    async fn execute(&mut self, epoch: usize, index: usize, batch: &Batch) -> Result<BatchReport> {
        self.strategy.maybe_load_input(&mut self.pipeline, batch)?;
        self.strategy.maybe_load_target(&mut self.pipeline, batch)?;

        self.transition(Phase::AwaitingBarrier)?;
        self.ctx.link().barrier(epoch, index).await?;

        self.transition(Phase::Executing)?;
        self.pipeline.forward(&mut self.ctx).await?;

        self.transition(Phase::Completed)?;
        let report = BatchReport {
            loss: self.pipeline.loss(),
            logits: self.pipeline.revealed().cloned(),
        };
        debug!(epoch, batch = index; "batch completed");

        self.transition(Phase::Idle)?;
        Ok(report)
    }

    /// Drops the runtime buffers kept by the pipeline.
    pub fn release_caches(&mut self) {
        self.pipeline.release_caches();
    }

    /// Says goodbye to the peers and hands the link back.
    pub async fn shutdown(self) -> Result<T> {
        let link = self.ctx.teardown().await.map_err(NnErr::from)?;
        Ok(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_cycle_is_the_only_legal_path() {
        let cycle = [
            Phase::Idle,
            Phase::AwaitingBarrier,
            Phase::Executing,
            Phase::Completed,
            Phase::Idle,
        ];
        for pair in cycle.windows(2) {
            assert!(pair[0].can_become(pair[1]), "{} -> {}", pair[0], pair[1]);
        }

        assert!(!Phase::Idle.can_become(Phase::Executing));
        assert!(!Phase::Executing.can_become(Phase::Idle));
        assert!(!Phase::Completed.can_become(Phase::AwaitingBarrier));
    }

    #[test]
    fn failed_is_terminal() {
        for phase in [
            Phase::Idle,
            Phase::AwaitingBarrier,
            Phase::Executing,
            Phase::Completed,
        ] {
            assert!(phase.can_become(Phase::Failed));
            assert!(!Phase::Failed.can_become(phase));
        }
        assert!(!Phase::Failed.can_become(Phase::Failed));
    }
}
