use super::{Batch, BatchSource, InMemoryDataset};
use crate::{PartyErr, Result};

/// Walks a dataset in fixed-size batches, the last one possibly shorter.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: InMemoryDataset,
    batch_size: usize,
    cursor: usize,
}

impl DataLoader {
    pub fn new(dataset: InMemoryDataset, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PartyErr::Data("batch_size must be > 0".into()));
        }

        Ok(Self {
            dataset,
            batch_size,
            cursor: 0,
        })
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn dataset(&self) -> &InMemoryDataset {
        &self.dataset
    }
}

impl BatchSource for DataLoader {
    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.cursor >= self.dataset.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.dataset.len());
        let batch = self.dataset.batch(self.cursor, end)?;

        self.cursor = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataloader_yields_a_short_tail_and_restarts() {
        let ds = InMemoryDataset::new(vec![1], (0..10).map(|i| i as f32).collect(), vec![0; 10])
            .unwrap();
        let mut dl = DataLoader::new(ds, 4).unwrap();

        let mut sizes = Vec::new();
        while let Some(batch) = dl.next_batch().unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![4, 4, 2]);

        dl.reset();
        let first = dl.next_batch().unwrap().unwrap();
        assert_eq!(first.inputs.iter().copied().collect::<Vec<_>>(), vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let ds = InMemoryDataset::new(vec![1], vec![0.0], vec![0]).unwrap();
        assert!(DataLoader::new(ds, 0).is_err());
    }
}
