//! EM for a fully observed dataset. Every stored value of every sample counts as an
//! observation, so this variant should only be used with datasets without masked entries
//! (masked entries would be read as `0.0`).

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::dataset::Dataset;
use crate::em::{component_mass, expectation, EStep, MixtureEm, LN_2PI};
use crate::error::{Error, Result};
use crate::mixture::GaussianMixture;

/// E-step: soft assignment of each sample under the isotropic Gaussian densities in the full
/// `d`-dimensional space.
pub fn estep(dataset: &Dataset, mixture: &GaussianMixture) -> Result<EStep> {
    mixture.check_dataset(dataset)?;
    mixture.check_variances()?;

    let output_size = mixture.output_size() as f64;
    // `ln(w_j) - d/2 * ln(2 pi var_j)`, which does not depend on the sample.
    let offsets = mixture
        .weights()
        .zip_map(mixture.variances(), |weight, variance| {
            weight.ln() - output_size / 2.0 * (LN_2PI + variance.ln())
        });

    expectation(dataset, |sample| {
        mixture
            .means()
            .row_iter()
            .zip(mixture.variances().iter())
            .zip(offsets.iter())
            .map(|((mean, &variance), &offset)| {
                offset - (sample.data.transpose() - mean).norm_squared() / (2.0 * variance)
            })
            .collect::<Vec<_>>()
            .into()
    })
}

/// M-step: closed form maximum likelihood estimate of the weights, means and variances. No
/// variance floor is applied, so a very tight component may end up with a tiny (or zero)
/// variance.
pub fn mstep(dataset: &Dataset, posterior: &DMatrix<f64>) -> Result<GaussianMixture> {
    let output_size = dataset.validate()?;
    if posterior.nrows() != dataset.len() {
        return Err(Error::shape("posterior rows", dataset.len(), posterior.nrows()));
    }
    let n_samples = dataset.len() as f64;

    let components = (0..posterior.ncols())
        .into_par_iter()
        .map(|j| {
            let mass = component_mass(posterior, j)?;
            let responsibilities = posterior.column(j);

            let mean = dataset
                .data
                .iter()
                .zip(responsibilities.iter())
                .map(|(sample, &p)| p * &sample.data)
                .fold(DVector::zeros(output_size), |acc, x| acc + x)
                / mass;
            let square_error = dataset
                .data
                .iter()
                .zip(responsibilities.iter())
                .map(|(sample, &p)| p * (&sample.data - &mean).norm_squared())
                .sum::<f64>();

            Ok((mean, square_error / (output_size as f64 * mass), mass / n_samples))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(assemble(components))
}

pub(crate) fn assemble(components: Vec<(DVector<f64>, f64, f64)>) -> GaussianMixture {
    let mean_rows = components
        .iter()
        .map(|(mean, _, _)| mean.transpose())
        .collect::<Vec<_>>();
    let variances = components.iter().map(|&(_, variance, _)| variance).collect::<Vec<_>>();
    let weights = components.iter().map(|&(_, _, weight)| weight).collect::<Vec<_>>();

    GaussianMixture::new(
        DMatrix::from_rows(&mean_rows),
        variances.into(),
        weights.into(),
    )
}

/// EM over fully observed data. See [`estep`] and [`mstep`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveEm;

impl MixtureEm for NaiveEm {
    fn estep(&self, dataset: &Dataset, mixture: &GaussianMixture) -> Result<EStep> {
        estep(dataset, mixture)
    }

    fn mstep(
        &self,
        dataset: &Dataset,
        posterior: &DMatrix<f64>,
        mixture: &GaussianMixture,
    ) -> Result<GaussianMixture> {
        mixture.check_posterior(dataset, posterior)?;
        mstep(dataset, posterior)
    }
}
