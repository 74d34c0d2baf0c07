use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::Uniform;

use crate::{PartyErr, Result};

/// A batch of samples and their class labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `(batch, ...)` shaped like the network input, except possibly for the batch.
    pub inputs: ArrayD<f32>,
    pub targets: Vec<usize>,
}

impl Batch {
    /// The amount of samples in this batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

/// A labelled dataset kept in memory, samples stored back to back.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
    sample_dims: Vec<usize>,
    values: Vec<f32>,
    labels: Vec<usize>,
}

impl InMemoryDataset {
    /// Creates a new dataset from owned buffers.
    ///
    /// # Arguments
    /// * `sample_dims` - The dimensions of a single sample.
    /// * `values` - Every sample, flattened and concatenated.
    /// * `labels` - One class index per sample.
    ///
    /// # Returns
    /// The dataset or an error if the buffers disagree or are empty.
    pub fn new(sample_dims: Vec<usize>, values: Vec<f32>, labels: Vec<usize>) -> Result<Self> {
        let sample_len: usize = sample_dims.iter().product();

        if labels.is_empty() || sample_len == 0 {
            return Err(PartyErr::Data("dataset must be non-empty".into()));
        }

        if values.len() != labels.len() * sample_len {
            return Err(PartyErr::Data(format!(
                "{} labels need {} values, got {}",
                labels.len(),
                labels.len() * sample_len,
                values.len()
            )));
        }

        Ok(Self {
            sample_dims,
            values,
            labels,
        })
    }

    /// Generates a reproducible dataset of uniform `[0, 1)` samples and random labels.
    ///
    /// # Arguments
    /// * `sample_dims` - The dimensions of a single sample.
    /// * `samples` - The amount of samples.
    /// * `classes` - The amount of classes labels are drawn from.
    /// * `seed` - Every role must use the same seed to see the same batches.
    ///
    /// # Returns
    /// A new dataset.
    pub fn synthetic(
        sample_dims: Vec<usize>,
        samples: usize,
        classes: usize,
        seed: u64,
    ) -> Result<Self> {
        if classes == 0 {
            return Err(PartyErr::Data("labels need at least one class".into()));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let sample_len: usize = sample_dims.iter().product();

        let unit = Uniform::new(0.0f32, 1.0).map_err(|e| PartyErr::Data(e.to_string()))?;
        let values = (&mut rng).sample_iter(unit).take(samples * sample_len).collect();
        let labels = (0..samples).map(|_| rng.random_range(0..classes)).collect();

        Self::new(sample_dims, values, labels)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn sample_dims(&self) -> &[usize] {
        &self.sample_dims
    }

    /// Copies the samples in `start..end` into a batch.
    pub fn batch(&self, start: usize, end: usize) -> Result<Batch> {
        let end = end.min(self.len());
        let start = start.min(end);
        let sample_len: usize = self.sample_dims.iter().product();

        let mut dims = vec![end - start];
        dims.extend_from_slice(&self.sample_dims);

        let values = self.values[start * sample_len..end * sample_len].to_vec();
        let inputs = ArrayD::from_shape_vec(IxDyn(&dims), values)
            .map_err(|e| PartyErr::Data(e.to_string()))?;

        Ok(Batch {
            inputs,
            targets: self.labels[start..end].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_rejects_mismatched_buffers() {
        assert!(InMemoryDataset::new(vec![2], vec![1.0, 2.0, 3.0], vec![0, 1]).is_err());
        assert!(InMemoryDataset::new(vec![2], vec![], vec![]).is_err());
        assert!(InMemoryDataset::new(vec![2], vec![1.0, 2.0, 3.0, 4.0], vec![0, 1]).is_ok());
    }

    #[test]
    fn batches_copy_the_requested_range() {
        let ds = InMemoryDataset::new(vec![2], (0..8).map(|i| i as f32).collect(), vec![0, 1, 2, 3])
            .unwrap();

        let batch = ds.batch(1, 3).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.inputs.shape(), &[2, 2]);
        assert_eq!(batch.inputs.iter().copied().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(batch.targets, vec![1, 2]);

        assert_eq!(ds.batch(3, 10).unwrap().len(), 1);
    }

    #[test]
    fn synthetic_datasets_are_reproducible() {
        let a = InMemoryDataset::synthetic(vec![1, 3, 3], 5, 4, 7).unwrap();
        let b = InMemoryDataset::synthetic(vec![1, 3, 3], 5, 4, 7).unwrap();

        assert_eq!(a.batch(0, 5).unwrap(), b.batch(0, 5).unwrap());
        assert!(a.labels.iter().all(|&l| l < 4));
        assert!(a.values.iter().all(|&v| (0.0..1.0).contains(&v)));
    }
}
