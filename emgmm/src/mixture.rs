use bit_vec::BitVec;
use nalgebra::{DMatrix, DVector};
use rand::distributions::Distribution;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rand_distr::{Bernoulli, StandardNormal, WeightedIndex};

use crate::dataset::{Dataset, MaskedSample};
use crate::error::{Error, Result};
use crate::utils::Mask;

/// A mixture of `K` isotropic Gaussians over a `d`-dimensional space. Each component has a
/// mean vector, a single variance shared by all dimensions and a mixing weight.
///
/// This is plain data: the EM steps always build a fresh mixture from their inputs.
///
/// ## Note
///
/// The means are stored row-wise, i.e., `means.row(j)` is the mean of component `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianMixture {
    means: DMatrix<f64>,
    variances: DVector<f64>,
    weights: DVector<f64>,
}

impl GaussianMixture {
    /// Creates a mixture from its parameters.
    ///
    /// # Panics
    ///
    /// Panics if there are no components or if the numbers of means, variances and weights
    /// differ.
    pub fn new(means: DMatrix<f64>, variances: DVector<f64>, weights: DVector<f64>) -> GaussianMixture {
        assert!(means.nrows() > 0, "a mixture needs at least one component");
        assert_eq!(means.nrows(), variances.len());
        assert_eq!(means.nrows(), weights.len());

        GaussianMixture {
            means,
            variances,
            weights,
        }
    }

    /// Creates a random __untrained__ mixture of `n_components` components for a dataset.
    /// The means are `n_components` distinct samples (missing entries read as `0.0`), each
    /// variance is the mean squared deviation of the stored data from its mean and the
    /// weights are uniform. Also returns the matching uniform posterior.
    ///
    /// The same seed always yields the same mixture.
    pub fn init(
        dataset: &Dataset,
        n_components: usize,
        seed: u64,
    ) -> Result<(GaussianMixture, DMatrix<f64>)> {
        let output_size = dataset.validate()?;
        let n_samples = dataset.len();
        if n_components == 0 || n_components > n_samples {
            return Err(Error::InvalidComponentCount {
                requested: n_components,
                n_samples,
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let chosen = rand::seq::index::sample(&mut rng, n_samples, n_components);
        let mean_rows = chosen
            .iter()
            .map(|idx| dataset.data[idx].data.transpose())
            .collect::<Vec<_>>();
        let means = DMatrix::from_rows(&mean_rows);

        let n_entries = (n_samples * output_size) as f64;
        let variances: DVector<f64> = means
            .row_iter()
            .map(|mean| {
                dataset
                    .data
                    .iter()
                    .map(|sample| (sample.data.transpose() - mean).norm_squared())
                    .sum::<f64>()
                    / n_entries
            })
            .collect::<Vec<_>>()
            .into();

        let uniform = 1.0 / n_components as f64;
        let weights = DVector::from_element(n_components, uniform);
        let posterior = DMatrix::from_element(n_samples, n_components, uniform);

        Ok((GaussianMixture::new(means, variances, weights), posterior))
    }

    /// The number of components `K`.
    pub fn n_components(&self) -> usize {
        self.means.nrows()
    }

    /// The number of features `d`.
    pub fn output_size(&self) -> usize {
        self.means.ncols()
    }

    /// The `(K, d)` matrix of component means.
    pub fn means(&self) -> &DMatrix<f64> {
        &self.means
    }

    /// The variance of each component.
    pub fn variances(&self) -> &DVector<f64> {
        &self.variances
    }

    /// The mixing weight (_a priori_ probability) of each component.
    pub fn weights(&self) -> &DVector<f64> {
        &self.weights
    }

    /// The total number of free parameters (used for information criteria).
    pub fn n_parameters(&self) -> usize {
        self.n_components() * (self.output_size() + 1) + self.n_components() - 1
    }

    /// The Bayesian Information Criterion of this mixture, in the "larger is better"
    /// convention: `llk - n_parameters * ln(n_samples) / 2`.
    pub fn bic(&self, log_likelihood: f64, n_samples: usize) -> f64 {
        log_likelihood - self.n_parameters() as f64 * (n_samples as f64).ln() / 2.0
    }

    /// Checks that a dataset lives in the same space as this mixture.
    pub fn check_dataset(&self, dataset: &Dataset) -> Result<()> {
        let output_size = dataset.validate()?;
        if output_size != self.output_size() {
            return Err(Error::shape("feature count", self.output_size(), output_size));
        }

        Ok(())
    }

    /// Checks that a posterior matrix matches this mixture and a dataset.
    pub fn check_posterior(&self, dataset: &Dataset, posterior: &DMatrix<f64>) -> Result<()> {
        self.check_dataset(dataset)?;
        if posterior.nrows() != dataset.len() {
            return Err(Error::shape("posterior rows", dataset.len(), posterior.nrows()));
        }
        if posterior.ncols() != self.n_components() {
            return Err(Error::shape(
                "posterior columns",
                self.n_components(),
                posterior.ncols(),
            ));
        }

        Ok(())
    }

    /// Fails if some variance cannot be used to evaluate a density.
    pub(crate) fn check_variances(&self) -> Result<()> {
        match self
            .variances
            .iter()
            .position(|&variance| !(variance.is_finite() && variance > 0.0))
        {
            Some(component) => Err(Error::degenerate(
                component,
                "variance is not a positive finite number",
            )),
            None => Ok(()),
        }
    }

    /// Sample a full dataset from the mixture and masks each entry according to a
    /// Bernoulli (coin-toss) distribution of probability `mask_prob` of erasing the
    /// generated value.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        dataset_size: usize,
        mask_prob: f64,
    ) -> Dataset {
        let index = WeightedIndex::new(self.weights.iter().copied())
            .expect("can create WeighedIndex from distribution");
        (0..dataset_size)
            .map(|_| {
                let component = index.sample(rng);
                self.sample_component(rng, component, mask_prob)
            })
            .collect()
    }

    fn sample_component<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        component: usize,
        mask_prob: f64,
    ) -> MaskedSample {
        let std = self.variances[component].sqrt();
        let data: DVector<f64> = self
            .means
            .row(component)
            .iter()
            .map(|&mean| {
                let standard: f64 = StandardNormal.sample(rng);
                mean + std * standard
            })
            .collect::<Vec<_>>()
            .into();
        let mask = Mask(
            Bernoulli::new(1.0 - mask_prob)
                .expect("invalid mask probability")
                .sample_iter(&mut *rng)
                .take(self.output_size())
                .collect::<BitVec>(),
        );

        MaskedSample::new(data, mask)
    }
}
