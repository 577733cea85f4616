//! Hard-assignment counterpart of [`crate::naive`]: each sample belongs entirely to its
//! closest mean. Useful as a cheap baseline and to compare seeds before running EM.

use nalgebra::DMatrix;
use ordered_float::OrderedFloat;
use rayon::prelude::*;

use crate::dataset::Dataset;
use crate::error::Result;
use crate::mixture::GaussianMixture;
use crate::naive;

/// Assigns every sample to its closest mean (squared Euclidean distance over the stored
/// values). Returns the one-hot posterior and the total cost, i.e., the sum of the squared
/// distances of each sample to its mean.
pub fn estep(dataset: &Dataset, mixture: &GaussianMixture) -> Result<(DMatrix<f64>, f64)> {
    mixture.check_dataset(dataset)?;

    let assignments = dataset
        .data
        .par_iter()
        .map(|sample| {
            mixture
                .means()
                .row_iter()
                .map(|mean| (sample.data.transpose() - mean).norm_squared())
                .enumerate()
                .min_by_key(|&(_, distance)| OrderedFloat(distance))
                .expect("mixture has at least one component")
        })
        .collect::<Vec<_>>();

    let mut posterior = DMatrix::zeros(dataset.len(), mixture.n_components());
    for (i, &(component, _)) in assignments.iter().enumerate() {
        posterior[(i, component)] = 1.0;
    }
    let cost = assignments.iter().map(|(_, distance)| distance).sum();

    Ok((posterior, cost))
}

/// Configuration of the k-means loop.
#[derive(Debug, Clone, Copy)]
pub struct KMeans {
    /// The loop stops once an iteration lowers the cost by no more than this.
    pub tolerance: f64,
    /// Maximum number of assignment/update pairs.
    pub max_iterations: usize,
}

impl Default for KMeans {
    fn default() -> KMeans {
        KMeans {
            tolerance: 1e-4,
            max_iterations: 1_000,
        }
    }
}

/// The result of [`KMeans::run`].
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// Means are the cluster centroids; variances and weights are those of the hard clusters.
    pub mixture: GaussianMixture,
    /// One-hot assignment of the last iteration.
    pub posterior: DMatrix<f64>,
    /// Cost of the last assignment.
    pub cost: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl KMeans {
    /// Alternates assignments and centroid updates until the cost stops decreasing. A
    /// cluster left without samples is reported as [`crate::Error::DegenerateComponent`].
    pub fn run(&self, dataset: &Dataset, mixture: GaussianMixture) -> Result<KMeansFit> {
        let mut mixture = mixture;
        let mut previous_cost: Option<f64> = None;
        let mut iterations = 0;

        loop {
            let (posterior, cost) = estep(dataset, &mixture)?;
            mixture = naive::mstep(dataset, &posterior)?;
            iterations += 1;
            tracing::debug!(iteration = iterations, cost, "k-means iteration");

            let converged = previous_cost
                .map(|previous| previous - cost <= self.tolerance)
                .unwrap_or(false);

            if converged || iterations >= self.max_iterations {
                if !converged {
                    tracing::warn!(iterations, cost, "k-means stopped at the iteration cap");
                }

                return Ok(KMeansFit {
                    mixture,
                    posterior,
                    cost,
                    iterations,
                    converged,
                });
            }
            previous_cost = Some(cost);
        }
    }
}
