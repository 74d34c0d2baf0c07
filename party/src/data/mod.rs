pub mod dataloader;
pub mod dataset;

use serde::{Deserialize, Serialize};

use crate::{PartyErr, Result};

pub use dataloader::DataLoader;
pub use dataset::{Batch, InMemoryDataset};

/// A restartable iterator over batches.
pub trait BatchSource {
    /// Rewinds to the first batch, called at the start of every epoch.
    fn reset(&mut self);

    /// Returns the next batch, or `None` once the epoch is exhausted.
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Where the samples come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataConfig {
    /// Uniform noise with random labels, shaped after the network input.
    Synthetic { samples: usize, seed: u64 },
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            DataConfig::Synthetic { samples: 0, .. } => {
                Err(PartyErr::Config("a dataset needs at least one sample".into()))
            }
            DataConfig::Synthetic { .. } => Ok(()),
        }
    }

    /// Materializes the dataset.
    ///
    /// # Arguments
    /// * `sample_dims` - The dimensions of a single network input sample.
    /// * `classes` - The amount of network outputs.
    ///
    /// # Returns
    /// A new in-memory dataset.
    pub fn load(&self, sample_dims: Vec<usize>, classes: usize) -> Result<InMemoryDataset> {
        match *self {
            DataConfig::Synthetic { samples, seed } => {
                InMemoryDataset::synthetic(sample_dims, samples, classes, seed)
            }
        }
    }
}
