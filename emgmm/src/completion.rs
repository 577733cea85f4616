use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::dataset::{Dataset, MaskedSample};
use crate::error::Result;
use crate::incomplete;
use crate::mixture::GaussianMixture;

/// Extrapolates the missing values of a single sample with their expected value under
/// `posterior` (the sample's soft assignment to the components of `mixture`). The observed
/// values are returned unaltered.
pub fn extrapolate_one(
    sample: &MaskedSample,
    posterior: &DVector<f64>,
    mixture: &GaussianMixture,
) -> DVector<f64> {
    let expected = mixture.means().tr_mul(posterior);
    sample.mask.choose(&sample.data, &expected)
}

/// Fills every missing entry of a dataset with its expected value under a fitted mixture.
/// Runs one (incomplete-data) E-step to get the soft assignments; entry `(i, c)` then becomes
/// `sum_j posterior[i, j] * mean[j, c]`. Observed entries are left unchanged.
pub fn fill_matrix(dataset: &Dataset, mixture: &GaussianMixture) -> Result<DMatrix<f64>> {
    let posterior = incomplete::estep(dataset, mixture)?.posterior;

    let rows = dataset
        .data
        .par_iter()
        .enumerate()
        .map(|(i, sample)| {
            extrapolate_one(sample, &posterior.row(i).transpose(), mixture).transpose()
        })
        .collect::<Vec<_>>();

    Ok(DMatrix::from_rows(&rows))
}
