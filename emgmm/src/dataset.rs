use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use std::{ops::Index, sync::Arc};

use crate::error::{Error, Result};
use crate::utils::Mask;

/// A data sample with potentially missing values. Missing values are always stored as `0.0`.
#[derive(Debug, Clone)]
pub struct MaskedSample {
    pub(crate) data: DVector<f64>,
    pub(crate) mask: Mask,
}

impl MaskedSample {
    /// Creates a masked sample from a ratings row, where `0.0` means "not rated".
    pub fn mask_zeros(data: DVector<f64>) -> MaskedSample {
        let mask = Mask::nonzero(&data);
        MaskedSample::new(data, mask)
    }

    /// Creates a masked sample from data and a mask. The value is considered missing if its index
    /// in the masked is set to `false`.
    ///
    /// # Panics
    ///
    /// Panics if the mask and the data have different lengths.
    pub fn new(data: DVector<f64>, mask: Mask) -> MaskedSample {
        assert_eq!(data.len(), mask.len(), "mask and data sizes differ");
        MaskedSample {
            data: mask.fillna(&data),
            mask,
        }
    }

    /// Creates a sample without any masked values.
    pub fn unmasked(data: DVector<f64>) -> MaskedSample {
        MaskedSample {
            mask: Mask::unmasked(data.len()),
            data,
        }
    }

    /// Returns the data vector associated with this sample. Masked entries are `0.0`.
    pub fn data_vector(&self) -> &DVector<f64> {
        &self.data
    }

    /// Returns the mask of this sample.
    pub fn mask(&self) -> &Mask {
        &self.mask
    }

    /// Returns whether the `idx` dimension in this sample is set.
    ///
    /// # Panics
    ///
    /// This function panics if `idx` is out of bounds.
    pub fn is_set(&self, idx: usize) -> bool {
        self.mask.is_set(idx)
    }

    /// The observed `(index, value)` pairs of this sample.
    pub fn observed(&self) -> impl '_ + Iterator<Item = (usize, f64)> {
        self.mask
            .filter(self.data.iter().copied().enumerate())
    }
}

impl Index<usize> for MaskedSample {
    type Output = f64;
    fn index(&self, index: usize) -> &Self::Output {
        if self.is_set(index) {
            &self.data[index]
        } else {
            panic!("Index out of bounds: index {index} is masked in sample")
        }
    }
}

/// Represents a dataset. This is a wrapper over a 2D array of dimensions
/// `(n_samples, n_features)`, where each entry may be missing.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// The data rows of this dataset.
    pub data: Arc<Vec<MaskedSample>>,
}

impl From<Vec<MaskedSample>> for Dataset {
    fn from(value: Vec<MaskedSample>) -> Self {
        Dataset::new(value)
    }
}

impl FromIterator<MaskedSample> for Dataset {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = MaskedSample>,
    {
        let data: Vec<_> = iter.into_iter().collect();
        Self::new(data)
    }
}

impl FromParallelIterator<MaskedSample> for Dataset {
    fn from_par_iter<T>(iter: T) -> Self
    where
        T: IntoParallelIterator<Item = MaskedSample>,
    {
        let data: Vec<_> = iter.into_par_iter().collect();
        Self::new(data)
    }
}

impl Dataset {
    /// Creates a new dataset from a set of masked samples.
    pub fn new(data: Vec<MaskedSample>) -> Dataset {
        Dataset {
            data: Arc::new(data),
        }
    }

    /// Reads a ratings matrix where `0.0` marks a missing entry. This is the only place where
    /// the zero convention is interpreted; everything downstream works on explicit masks.
    pub fn from_zero_sentinel(matrix: &DMatrix<f64>) -> Dataset {
        matrix
            .row_iter()
            .map(|row| MaskedSample::mask_zeros(row.transpose()))
            .collect()
    }

    /// Wraps a matrix in which every entry is observed (zeros included).
    pub fn from_dense(matrix: &DMatrix<f64>) -> Dataset {
        matrix
            .row_iter()
            .map(|row| MaskedSample::unmasked(row.transpose()))
            .collect()
    }

    /// The length of this dataset.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether this dataset is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The number of dimensions in each sample. Returns `None` if dataset is empty.
    pub fn output_size(&self) -> Option<usize> {
        self.data.first().map(|sample| sample.mask().len())
    }

    /// Checks that the dataset is non-empty and that every sample has the same size. Returns
    /// that size.
    pub fn validate(&self) -> Result<usize> {
        let output_size = self.output_size().ok_or(Error::EmptyDataset)?;
        for sample in self.data.iter() {
            if sample.data.len() != output_size {
                return Err(Error::shape("sample size", output_size, sample.data.len()));
            }
        }

        Ok(output_size)
    }

    /// Whether no entry of this dataset is missing.
    pub fn is_fully_observed(&self) -> bool {
        self.data.par_iter().all(|sample| sample.mask.0.all())
    }

    /// The stored values as a `(n_samples, n_features)` matrix, with `0.0` on missing entries.
    pub fn to_matrix(&self) -> DMatrix<f64> {
        let rows = self
            .data
            .iter()
            .map(|sample| sample.data.transpose())
            .collect::<Vec<_>>();
        DMatrix::from_rows(&rows)
    }

    /// The `(n_samples, n_features)` observation indicator: `1.0` where a value was observed,
    /// `0.0` elsewhere.
    pub fn observation_matrix(&self) -> DMatrix<f64> {
        let rows = self
            .data
            .iter()
            .map(|sample| sample.mask.as_vector().transpose())
            .collect::<Vec<_>>();
        DMatrix::from_rows(&rows)
    }
}

#[cfg(test)]
mod test {
    use nalgebra::{dmatrix, dvector};

    use super::*;

    #[test]
    fn test_zero_sentinel_round_trip() {
        let matrix = dmatrix![
            5.0, 0.0, 3.0;
            0.0, 0.0, 1.0;
        ];
        let dataset = Dataset::from_zero_sentinel(&matrix);

        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.validate(), Ok(3));
        assert!(!dataset.is_fully_observed());
        assert_eq!(dataset.to_matrix(), matrix);
        assert_eq!(
            dataset.observation_matrix(),
            dmatrix![
                1.0, 0.0, 1.0;
                0.0, 0.0, 1.0;
            ]
        );
    }

    #[test]
    fn test_dense_keeps_zeros() {
        let dataset = Dataset::from_dense(&dmatrix![0.0, 1.0]);
        assert!(dataset.is_fully_observed());
        assert_eq!(dataset.data[0][0], 0.0);
    }

    #[test]
    fn test_masked_entries_are_stored_as_zero() {
        let sample = MaskedSample::new(dvector![1.0, 7.0], Mask::nonzero(&dvector![1.0, 0.0]));
        assert_eq!(sample.data_vector(), &dvector![1.0, 0.0]);
        assert_eq!(sample.observed().collect::<Vec<_>>(), vec![(0, 1.0)]);
    }

    #[test]
    fn test_validate() {
        assert_eq!(Dataset::new(vec![]).validate(), Err(Error::EmptyDataset));

        let ragged = Dataset::new(vec![
            MaskedSample::unmasked(dvector![1.0, 2.0]),
            MaskedSample::unmasked(dvector![1.0]),
        ]);
        assert_eq!(
            ragged.validate(),
            Err(Error::ShapeMismatch {
                what: "sample size",
                expected: 2,
                found: 1
            })
        );
    }
}
