//! EM for datasets with missing entries. Each sample only contributes through its observed
//! coordinates: densities are evaluated on the observed sub-space, means are re-estimated
//! from the observations each component is responsible for, and variances are averaged
//! over observed coordinates only.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::dataset::Dataset;
use crate::em::{component_mass, expectation, EStep, MixtureEm, LN_2PI};
use crate::error::{Error, Result};
use crate::mixture::GaussianMixture;
use crate::naive::assemble;

/// Added to every weight before taking its log in the E-step, so that a collapsed weight
/// does not produce `ln(0)`.
pub const WEIGHT_SMOOTHING: f64 = 1e-16;

/// Default lower bound for the component variances.
pub const DEFAULT_MIN_VARIANCE: f64 = 0.25;

/// E-step: soft assignment of each sample using only its observed coordinates. A sample
/// observing `m` coordinates is scored with the `m`-dimensional restriction of each
/// component; a sample observing nothing is assigned according to the weights alone.
pub fn estep(dataset: &Dataset, mixture: &GaussianMixture) -> Result<EStep> {
    mixture.check_dataset(dataset)?;
    mixture.check_variances()?;

    let log_weights = mixture
        .weights()
        .map(|weight| (weight + WEIGHT_SMOOTHING).ln());
    let log_normalizers = mixture
        .variances()
        .map(|variance| (LN_2PI + variance.ln()) / 2.0);

    expectation(dataset, |sample| {
        let observed = sample.mask.observed_indices();
        let n_observed = observed.len() as f64;

        (0..mixture.n_components())
            .map(|j| {
                let mean = mixture.means().row(j);
                let square_error = observed
                    .iter()
                    .map(|&c| (sample.data[c] - mean[c]).powi(2))
                    .sum::<f64>();

                log_weights[j]
                    - square_error / (2.0 * mixture.variances()[j])
                    - n_observed * log_normalizers[j]
            })
            .collect::<Vec<_>>()
            .into()
    })
}

/// M-step: re-estimates the mixture from observed entries only.
///
/// For each component `j` and coordinate `c`, the _support_ is the responsibility-weighted
/// number of samples observing `c`. The mean coordinate is only updated when the support is
/// strictly greater than one; otherwise the value from `mixture` is kept as is. Variances
/// are clamped from below by `min_variance`, which must be positive.
pub fn mstep(
    dataset: &Dataset,
    posterior: &DMatrix<f64>,
    mixture: &GaussianMixture,
    min_variance: f64,
) -> Result<GaussianMixture> {
    Error::positive("min_variance", min_variance)?;
    mixture.check_posterior(dataset, posterior)?;
    let output_size = mixture.output_size();
    let n_samples = dataset.len() as f64;

    let components = (0..mixture.n_components())
        .into_par_iter()
        .map(|j| {
            let mass = component_mass(posterior, j)?;
            let responsibilities = posterior.column(j);

            let (support, weighted_sum) = dataset
                .data
                .iter()
                .zip(responsibilities.iter())
                .fold(
                    (DVector::zeros(output_size), DVector::zeros(output_size)),
                    |(mut support, mut weighted_sum): (DVector<f64>, DVector<f64>), (sample, &p)| {
                        for (c, value) in sample.observed() {
                            support[c] += p;
                            weighted_sum[c] += p * value;
                        }
                        (support, weighted_sum)
                    },
                );

            let previous_mean = mixture.means().row(j);
            let mean: DVector<f64> = (0..output_size)
                .map(|c| {
                    if support[c] > 1.0 {
                        weighted_sum[c] / support[c]
                    } else {
                        previous_mean[c]
                    }
                })
                .collect::<Vec<_>>()
                .into();

            let (square_error, observations) = dataset
                .data
                .iter()
                .zip(responsibilities.iter())
                .map(|(sample, &p)| {
                    let (square_error, count) = sample
                        .observed()
                        .fold((0.0, 0usize), |(square_error, count), (c, value)| {
                            (square_error + (value - mean[c]).powi(2), count + 1)
                        });
                    (p * square_error, p * count as f64)
                })
                .fold((0.0, 0.0), |(a, b), (c, d)| (a + c, b + d));

            if !(observations > 0.0) {
                return Err(Error::degenerate(
                    j,
                    "no observed coordinates under its responsibility",
                ));
            }
            let variance = (square_error / observations).max(min_variance);

            Ok((mean, variance, mass / n_samples))
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(assemble(components))
}

/// EM over data with missing entries. See [`estep`] and [`mstep`].
#[derive(Debug, Clone, Copy)]
pub struct IncompleteEm {
    /// Lower bound for every component variance after an M-step.
    pub min_variance: f64,
}

impl Default for IncompleteEm {
    fn default() -> IncompleteEm {
        IncompleteEm {
            min_variance: DEFAULT_MIN_VARIANCE,
        }
    }
}

impl IncompleteEm {
    /// Fails with [`Error::InvalidParameter`] if `min_variance` is not a positive number.
    pub fn with_min_variance(min_variance: f64) -> Result<IncompleteEm> {
        Ok(IncompleteEm {
            min_variance: Error::positive("min_variance", min_variance)?,
        })
    }
}

impl MixtureEm for IncompleteEm {
    fn estep(&self, dataset: &Dataset, mixture: &GaussianMixture) -> Result<EStep> {
        estep(dataset, mixture)
    }

    fn mstep(
        &self,
        dataset: &Dataset,
        posterior: &DMatrix<f64>,
        mixture: &GaussianMixture,
    ) -> Result<GaussianMixture> {
        mstep(dataset, posterior, mixture, self.min_variance)
    }
}

#[cfg(test)]
mod test {
    use nalgebra::{dmatrix, dvector};
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::dataset::MaskedSample;
    use crate::em::{run, EmConfig};
    use crate::naive;

    fn ratings(seed: u64) -> Dataset {
        let truth = GaussianMixture::new(
            dmatrix![
                1.0, 1.5, 4.5, 4.0, 1.0;
                4.5, 4.0, 1.0, 1.5, 3.0;
                3.0, 3.0, 3.0, 3.0, 3.0;
            ],
            dvector![0.3, 0.4, 0.5],
            dvector![0.3, 0.3, 0.4],
        );
        truth.sample(&mut StdRng::seed_from_u64(seed), 200, 0.4)
    }

    #[test]
    fn test_estep_uses_observed_coordinates_only() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![2.0, 0.0]);
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 100.0;
                2.0, -100.0;
            ],
            dvector![1.0, 1.0],
            dvector![0.5, 0.5],
        );
        let EStep {
            posterior,
            log_likelihood,
        } = estep(&dataset, &mixture).unwrap();

        let first = 0.5 * (-0.5f64).exp() / (2.0 * std::f64::consts::PI).sqrt();
        let second = 0.5 / (2.0 * std::f64::consts::PI).sqrt();
        approx::assert_relative_eq!(log_likelihood, (first + second).ln(), epsilon = 1e-12);
        approx::assert_relative_eq!(posterior[(0, 1)], second / (first + second), epsilon = 1e-12);
    }

    #[test]
    fn test_estep_empty_sample_follows_weights() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![0.0, 0.0]);
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 1.0;
                5.0, 5.0;
            ],
            dvector![1.0, 2.0],
            dvector![0.2, 0.8],
        );
        let EStep {
            posterior,
            log_likelihood,
        } = estep(&dataset, &mixture).unwrap();

        approx::assert_relative_eq!(posterior[(0, 0)], 0.2, epsilon = 1e-12);
        approx::assert_relative_eq!(posterior[(0, 1)], 0.8, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(log_likelihood, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_estep_survives_collapsed_weight() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![1.0, 1.0]);
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 1.0;
                5.0, 5.0;
            ],
            dvector![1.0, 1.0],
            dvector![0.0, 1.0],
        );
        let EStep {
            posterior,
            log_likelihood,
        } = estep(&dataset, &mixture).unwrap();

        assert!(log_likelihood.is_finite());
        assert!(posterior.iter().all(|p| p.is_finite()));
        approx::assert_abs_diff_eq!(posterior.row(0).sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mstep_keeps_poorly_supported_means() {
        // Only the first sample observes the last coordinate, so no component can gather a
        // support larger than one there.
        let dataset = Dataset::from_zero_sentinel(&dmatrix![
            1.0, 2.0, 5.0;
            1.5, 2.5, 0.0;
            4.0, 4.0, 0.0;
            4.5, 3.5, 0.0;
        ]);
        let posterior = dmatrix![
            0.9, 0.1;
            0.8, 0.2;
            0.1, 0.9;
            0.3, 0.7;
        ];
        let mixture = GaussianMixture::new(
            dmatrix![
                0.1234567, 0.2, 0.7654321;
                0.3, 0.4, 0.9876543;
            ],
            dvector![1.0, 1.0],
            dvector![0.5, 0.5],
        );
        let fitted = mstep(&dataset, &posterior, &mixture, 0.25).unwrap();

        assert_eq!(fitted.means()[(0, 2)], 0.7654321);
        assert_eq!(fitted.means()[(1, 2)], 0.9876543);
        // The well supported coordinates are re-estimated.
        approx::assert_relative_eq!(
            fitted.means()[(0, 0)],
            (0.9 * 1.0 + 0.8 * 1.5 + 0.1 * 4.0 + 0.3 * 4.5) / 2.1,
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_mstep_support_threshold_is_strict() {
        // Exactly one unit of support does not move the mean.
        let dataset = Dataset::from_zero_sentinel(&dmatrix![
            3.0, 0.0;
            0.0, 2.0;
            0.0, 4.0;
        ]);
        let posterior = DMatrix::from_element(3, 1, 1.0);
        let mixture = GaussianMixture::new(dmatrix![0.5, 0.5], dvector![1.0], dvector![1.0]);
        let fitted = mstep(&dataset, &posterior, &mixture, 0.25).unwrap();

        assert_eq!(fitted.means(), &dmatrix![0.5, 3.0]);
    }

    #[test]
    fn test_mstep_variance_over_observed_coordinates() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![
            1.0, 3.0;
            3.0, 0.0;
            0.0, 5.0;
        ]);
        let posterior = DMatrix::from_element(3, 1, 1.0);
        let mixture = GaussianMixture::new(dmatrix![0.0, 0.0], dvector![1.0], dvector![1.0]);
        let fitted = mstep(&dataset, &posterior, &mixture, 0.25).unwrap();

        // Means are [2, 4]; four observations, each one unit away from its mean.
        assert_eq!(fitted.means(), &dmatrix![2.0, 4.0]);
        approx::assert_relative_eq!(fitted.variances()[0], 1.0);
        approx::assert_relative_eq!(fitted.weights()[0], 1.0);
    }

    #[test]
    fn test_mstep_variance_floor() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![
            1.0, 1.0;
            1.0, 1.1;
            1.0, 0.9;
        ]);
        let posterior = DMatrix::from_element(3, 1, 1.0);
        let mixture = GaussianMixture::new(dmatrix![0.0, 0.0], dvector![1.0], dvector![1.0]);

        let fitted = mstep(&dataset, &posterior, &mixture, 0.25).unwrap();
        assert_eq!(fitted.variances()[0], 0.25);

        let fitted = mstep(&dataset, &posterior, &mixture, 0.5).unwrap();
        assert_eq!(fitted.variances()[0], 0.5);
    }

    #[test]
    fn test_mstep_component_without_observations() {
        let dataset = Dataset::new(vec![
            MaskedSample::mask_zeros(dvector![0.0, 0.0]),
            MaskedSample::mask_zeros(dvector![1.0, 2.0]),
        ]);
        let posterior = dmatrix![
            1.0, 0.0;
            0.0, 1.0;
        ];
        let mixture = GaussianMixture::new(
            dmatrix![
                0.0, 0.0;
                1.0, 1.0;
            ],
            dvector![1.0, 1.0],
            dvector![0.5, 0.5],
        );
        assert!(matches!(
            mstep(&dataset, &posterior, &mixture, 0.25),
            Err(Error::DegenerateComponent { component: 0, .. })
        ));
    }

    #[test]
    fn test_mstep_rejects_bad_inputs() {
        let dataset = Dataset::from_zero_sentinel(&dmatrix![
            1.0, 0.0;
            2.0, 3.0;
        ]);
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 1.0;
                2.0, 2.0;
            ],
            dvector![1.0, 1.0],
            dvector![0.5, 0.5],
        );

        let too_few_rows = DMatrix::from_element(1, 2, 0.5);
        assert_eq!(
            mstep(&dataset, &too_few_rows, &mixture, 0.25).unwrap_err(),
            Error::ShapeMismatch {
                what: "posterior rows",
                expected: 2,
                found: 1
            }
        );
        let too_many_columns = DMatrix::from_element(2, 3, 1.0 / 3.0);
        assert_eq!(
            IncompleteEm::default()
                .mstep(&dataset, &too_many_columns, &mixture)
                .unwrap_err(),
            Error::ShapeMismatch {
                what: "posterior columns",
                expected: 2,
                found: 3
            }
        );

        let posterior = DMatrix::from_element(2, 2, 0.5);
        for min_variance in [0.0, -1.0] {
            assert_eq!(
                mstep(&dataset, &posterior, &mixture, min_variance).unwrap_err(),
                Error::InvalidParameter {
                    name: "min_variance",
                    value: min_variance
                }
            );
        }
        assert!(IncompleteEm::with_min_variance(0.0).is_err());
        assert_eq!(IncompleteEm::with_min_variance(0.5).unwrap().min_variance, 0.5);
    }

    #[test]
    fn test_run_is_monotone_and_respects_floor() {
        let dataset = ratings(21);
        let (mixture, _) = GaussianMixture::init(&dataset, 3, 2).unwrap();
        let fit = run(&IncompleteEm::default(), &dataset, mixture, &EmConfig::default()).unwrap();

        assert!(fit.converged);
        for window in fit.history.windows(2) {
            assert!(window[1] >= window[0] - 1e-8 * window[0].abs());
        }
        assert!(fit
            .mixture
            .variances()
            .iter()
            .all(|&variance| variance >= DEFAULT_MIN_VARIANCE));
        approx::assert_relative_eq!(fit.mixture.weights().sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_missing_values_lower_the_likelihood_of_tight_clusters() {
        let truth = dmatrix![
            1.0, 2.0, 3.0;
            4.0, 5.0, 5.0;
            1.1, 2.1, 2.9;
        ];
        let incomplete = dmatrix![
            1.0, 0.0, 3.0;
            4.0, 5.0, 0.0;
            0.0, 2.1, 2.9;
        ];
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 2.0, 3.0;
                4.0, 5.0, 5.0;
            ],
            dvector![0.05, 0.05],
            dvector![0.5, 0.5],
        );

        let naive_llk = naive::estep(&Dataset::from_dense(&truth), &mixture)
            .unwrap()
            .log_likelihood;
        let incomplete_llk = estep(&Dataset::from_zero_sentinel(&incomplete), &mixture)
            .unwrap()
            .log_likelihood;

        assert!(incomplete_llk <= naive_llk);
    }

    #[test]
    fn test_agrees_with_naive_on_complete_data() {
        let dataset = Dataset::from_dense(&dmatrix![
            1.0, 2.0;
            2.0, 1.0;
            5.0, 6.0;
            6.0, 5.5;
        ]);
        let mixture = GaussianMixture::new(
            dmatrix![
                1.0, 1.0;
                6.0, 6.0;
            ],
            dvector![1.0, 1.0],
            dvector![0.5, 0.5],
        );
        let naive = naive::estep(&dataset, &mixture).unwrap();
        let incomplete = estep(&dataset, &mixture).unwrap();

        approx::assert_relative_eq!(naive.log_likelihood, incomplete.log_likelihood, epsilon = 1e-9);
        approx::assert_relative_eq!(naive.posterior, incomplete.posterior, epsilon = 1e-9);
    }

    proptest! {
        #[test]
        fn posterior_is_stochastic_and_weights_sum_to_one(
            seed in 0u64..1_000,
            n_components in 1usize..4,
        ) {
            let dataset = ratings(seed);
            let (mixture, _) = GaussianMixture::init(&dataset, n_components, seed).unwrap();
            let EStep { posterior, .. } = estep(&dataset, &mixture).unwrap();

            for row in posterior.row_iter() {
                prop_assert!((row.sum() - 1.0).abs() < 1e-9);
            }

            let fitted = mstep(&dataset, &posterior, &mixture, DEFAULT_MIN_VARIANCE).unwrap();
            prop_assert!(fitted.weights().iter().all(|&weight| weight >= 0.0));
            prop_assert!((fitted.weights().sum() - 1.0).abs() < 1e-9);
            prop_assert!(fitted.variances().iter().all(|&variance| variance >= DEFAULT_MIN_VARIANCE));
        }
    }
}
