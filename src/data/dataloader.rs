//! DataLoader: full-size batches over an in-memory dataset.
//!
//! Rows keep their order and are never dropped. When the row count is not a
//! multiple of the batch size, the dataset is padded with rows sampled with
//! replacement (from a seeded RNG) so that every batch is full.

use ndarray::{ArrayD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("batch size must be positive")]
    ZeroBatchSize,

    #[error("dataset has no rows")]
    Empty,

    #[error("features have {features} rows but labels have {labels}")]
    RowMismatch { features: usize, labels: usize },
}

/// Batch of rows: `(features, labels)` plus the source row of each entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub features: ArrayD<f32>,
    pub labels: ArrayD<f32>,
    pub indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Cursor over the batches of one epoch.
///
/// [`DataLoader::next_batch`] wraps to the first batch once the epoch is
/// exhausted; the `Iterator` impl stops there instead.
#[derive(Debug, Clone)]
pub struct DataLoader {
    features: ArrayD<f32>,
    labels: ArrayD<f32>,
    batch_size: usize,
    /// Row order of the padded dataset.
    rows: Vec<usize>,
    cursor: usize,
}

impl DataLoader {
    pub fn new(features: ArrayD<f32>, labels: ArrayD<f32>, batch_size: usize) -> Result<Self, DataError> {
        Self::with_seed(features, labels, batch_size, 0)
    }

    /// Loader whose padding rows are drawn from `StdRng::seed_from_u64(seed)`.
    pub fn with_seed(features: ArrayD<f32>, labels: ArrayD<f32>, batch_size: usize, seed: u64) -> Result<Self, DataError> {
        if batch_size == 0 {
            return Err(DataError::ZeroBatchSize);
        }
        let n = features.shape().first().copied().unwrap_or(0);
        let m = labels.shape().first().copied().unwrap_or(0);
        if n != m {
            return Err(DataError::RowMismatch { features: n, labels: m });
        }
        if n == 0 {
            return Err(DataError::Empty);
        }

        let padded = (n + batch_size - 1) / batch_size * batch_size;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut rows: Vec<usize> = (0..n).collect();
        rows.extend((n..padded).map(|_| rng.gen_range(0..n)));

        Ok(Self { features, labels, batch_size, rows, cursor: 0 })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Batches per epoch.
    pub fn num_batches(&self) -> usize {
        self.rows.len() / self.batch_size
    }

    /// Row count after padding.
    pub fn padded_len(&self) -> usize {
        self.rows.len()
    }

    /// Index of the batch the next call to `next_batch` returns.
    pub fn cursor(&self) -> usize {
        self.cursor % self.num_batches()
    }

    /// Whether the current epoch still has a batch to hand out.
    pub fn has_next(&self) -> bool {
        self.cursor < self.num_batches()
    }

    /// Returns the batch at the cursor and advances it, wrapping to the
    /// first batch after the last one.
    pub fn next_batch(&mut self) -> Batch {
        if !self.has_next() {
            self.cursor = 0;
        }
        let start = self.cursor * self.batch_size;
        let indices = self.rows[start..start + self.batch_size].to_vec();
        self.cursor += 1;
        Batch {
            features: self.features.select(Axis(0), &indices),
            labels: self.labels.select(Axis(0), &indices),
            indices,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

impl Iterator for DataLoader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.has_next() {
            Some(self.next_batch())
        } else {
            None
        }
    }
}

/// Consecutive, non-overlapping row ranges of at most `batch_size` rows.
/// The last one is shorter when `rows` is not a multiple of `batch_size`.
pub fn row_chunks(rows: usize, batch_size: usize) -> impl Iterator<Item = std::ops::Range<usize>> {
    let step = batch_size.max(1);
    (0..rows).step_by(step).map(move |start| start..(start + step).min(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, IxDyn};

    fn dataset(rows: usize) -> (ArrayD<f32>, ArrayD<f32>) {
        let x = Array2::from_shape_fn((rows, 3), |(i, j)| (i * 3 + j) as f32).into_dyn();
        let y = ArrayD::from_shape_vec(IxDyn(&[rows, 1]), (0..rows).map(|i| i as f32).collect()).unwrap();
        (x, y)
    }

    #[test]
    fn two_epochs_with_reset_repeat_the_sequence() {
        let (x, y) = dataset(6);
        let mut loader = DataLoader::new(x, y, 2).unwrap();
        assert_eq!(loader.num_batches(), 3);

        let first: Vec<Batch> = loader.by_ref().collect();
        assert!(!loader.has_next());
        loader.reset();
        let second: Vec<Batch> = loader.by_ref().collect();

        assert_eq!(first.len() + second.len(), 6);
        assert!(first.iter().chain(second.iter()).all(|b| b.len() == 2 && b.features.shape() == &[2, 3]));
        assert_eq!(first, second);
        assert_eq!(first[1].indices, vec![2, 3]);
    }

    #[test]
    fn next_batch_wraps_after_the_last_batch() {
        let (x, y) = dataset(4);
        let mut loader = DataLoader::new(x, y, 2).unwrap();
        let a = loader.next_batch();
        loader.next_batch();
        assert!(!loader.has_next());
        let wrapped = loader.next_batch();
        assert_eq!(wrapped, a);
        assert_eq!(loader.cursor(), 1);
    }

    #[test]
    fn short_datasets_are_padded_with_existing_rows() {
        let (x, y) = dataset(5);
        let mut loader = DataLoader::with_seed(x, y, 4, 9).unwrap();
        assert_eq!(loader.padded_len(), 8);
        loader.next_batch();
        let last = loader.next_batch();
        assert_eq!(last.indices[0], 4);
        assert!(last.indices.iter().all(|&i| i < 5));
        for (row, &i) in last.indices.iter().enumerate() {
            assert_eq!(last.labels[[row, 0]], i as f32);
        }
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let (x, y) = dataset(3);
        assert_eq!(DataLoader::new(x.clone(), y.clone(), 0).unwrap_err(), DataError::ZeroBatchSize);
        let (_, y4) = dataset(4);
        assert!(matches!(DataLoader::new(x, y4, 2), Err(DataError::RowMismatch { features: 3, labels: 4 })));
    }

    #[test]
    fn row_chunks_keep_the_remainder() {
        let chunks: Vec<_> = row_chunks(5, 2).collect();
        assert_eq!(chunks, vec![0..2, 2..4, 4..5]);
    }
}
