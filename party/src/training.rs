use comms::Transport;
use log::{debug, info, warn};
use secure_nn::{ReferenceNet, SecretOp, reference::max_abs_diff};

use crate::{
    Result,
    coordinator::{BatchReport, PartyCoordinator},
    data::{Batch, BatchSource},
};

/// Counters kept across the whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    /// Executed batches within the current epoch.
    pub batch: usize,
    pub executed: usize,
    /// Batches dropped because their size differed from the pipeline's.
    pub skipped: usize,
    pub running_loss: f32,
    /// Batches whose loss went into `running_loss`.
    pub losses: usize,
    /// Worst difference to the plaintext reference seen so far, in comparison mode.
    pub max_abs_diff: Option<f32>,
}

impl TrainingState {
    pub fn mean_loss(&self) -> Option<f32> {
        (self.losses > 0).then(|| self.running_loss / self.losses as f32)
    }
}

/// Feeds batches to a coordinator, epoch after epoch.
pub struct TrainingLoop<S> {
    source: S,
    epochs: usize,
    max_batches: Option<usize>,
    reference: Option<ReferenceNet>,
    state: TrainingState,
}

impl<S: BatchSource> TrainingLoop<S> {
    /// Creates a new `TrainingLoop`.
    ///
    /// # Arguments
    /// * `source` - The batches, restarted every epoch.
    /// * `epochs` - How many times the source is walked.
    ///
    /// # Returns
    /// A new `TrainingLoop` instance.
    pub fn new(source: S, epochs: usize) -> Self {
        Self {
            source,
            epochs,
            max_batches: None,
            reference: None,
            state: TrainingState::default(),
        }
    }

    /// Stops each epoch after `limit` executed batches.
    pub fn with_batch_limit(mut self, limit: Option<usize>) -> Self {
        self.max_batches = limit;
        self
    }

    /// Enables comparison mode against a plaintext twin of the pipeline.
    pub fn with_reference(mut self, reference: ReferenceNet) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Runs every epoch.
    ///
    /// Batches whose size differs from the pipeline's batch dimension are skipped on every
    /// role alike, so they never reach the barrier.
    ///
    /// # Arguments
    /// * `coordinator` - The coordinator of this role.
    ///
    /// # Returns
    /// The final counters or the first fatal error.
    pub async fn run<T, O>(&mut self, coordinator: &mut PartyCoordinator<T, O>) -> Result<TrainingState>
    where
        T: Transport,
        O: SecretOp,
    {
        let batch_size = coordinator.pipeline().batch_size();

        for epoch in 0..self.epochs {
            self.source.reset();
            self.state.epoch = epoch;
            self.state.batch = 0;

            while let Some(batch) = self.source.next_batch()? {
                if self.max_batches.is_some_and(|limit| self.state.batch >= limit) {
                    break;
                }

                if batch.len() != batch_size {
                    self.state.skipped += 1;
                    warn!(epoch; "skipping a batch of {} samples, the pipeline takes {batch_size}", batch.len());
                    continue;
                }

                let report = coordinator.run_batch(epoch, self.state.batch, &batch).await?;
                self.record(&batch, report);
            }

            coordinator.release_caches();
            info!(
                epoch, executed = self.state.batch, skipped = self.state.skipped;
                "epoch finished, mean loss {:?}", self.state.mean_loss()
            );
        }

        Ok(self.state.clone())
    }

    fn record(&mut self, batch: &Batch, report: BatchReport) {
        let state = &mut self.state;

        if let Some(loss) = report.loss {
            state.running_loss += loss;
            state.losses += 1;
            debug!(epoch = state.epoch, batch = state.batch; "loss {loss}");
        }

        if let (Some(reference), Some(logits)) = (&self.reference, &report.logits) {
            match reference.forward(batch.inputs.view()) {
                Ok(expected) => {
                    let diff = max_abs_diff(logits.view(), expected.view());
                    state.max_abs_diff = Some(state.max_abs_diff.map_or(diff, |d| d.max(diff)));
                    info!(epoch = state.epoch, batch = state.batch; "max abs diff to plaintext {diff}");
                }
                Err(e) => warn!("plaintext reference failed: {e}"),
            }
        }

        state.batch += 1;
        state.executed += 1;
    }
}
