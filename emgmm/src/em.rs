use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::dataset::{Dataset, MaskedSample};
use crate::error::{Error, Result};
use crate::mixture::GaussianMixture;
use crate::utils::robust_softmax;

pub(crate) const LN_2PI: f64 = 1.8378770664093453;

/// The output of an E-step.
#[derive(Debug, Clone)]
pub struct EStep {
    /// `(n_samples, n_components)` matrix of soft assignments. Each row sums to one.
    pub posterior: DMatrix<f64>,
    /// The log-likelihood of the dataset under the mixture used in the E-step.
    pub log_likelihood: f64,
}

/// One flavour of the EM algorithm for isotropic Gaussian mixtures. Both steps are pure:
/// they build fresh outputs from their inputs.
pub trait MixtureEm: Sync {
    /// Softly assigns each sample to the mixture components.
    fn estep(&self, dataset: &Dataset, mixture: &GaussianMixture) -> Result<EStep>;

    /// Re-estimates the mixture from the soft assignments. The input mixture is used for
    /// shapes and, depending on the variant, as a fallback for parameters lacking evidence.
    fn mstep(
        &self,
        dataset: &Dataset,
        posterior: &DMatrix<f64>,
        mixture: &GaussianMixture,
    ) -> Result<GaussianMixture>;
}

/// Stopping rule of the EM loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Convergence {
    /// Stop when `llk - previous_llk <= tolerance * |llk|`.
    #[default]
    Relative,
    /// Stop when `llk - previous_llk <= |llk| / tolerance`. This is far looser than
    /// [`Convergence::Relative`] and only exists to reproduce results of older runs.
    Legacy,
}

impl Convergence {
    pub fn has_converged(&self, previous: f64, current: f64, tolerance: f64) -> bool {
        let improvement = current - previous;
        match self {
            Convergence::Relative => improvement <= tolerance * current.abs(),
            Convergence::Legacy => improvement <= current.abs() / tolerance,
        }
    }
}

/// Configuration for [`run`].
#[derive(Debug, Clone)]
pub struct EmConfig {
    /// Relative log-likelihood improvement under which the loop stops.
    pub tolerance: f64,
    /// Maximum number of E/M pairs.
    pub max_iterations: usize,
    /// How `tolerance` is applied.
    pub convergence: Convergence,
}

impl Default for EmConfig {
    fn default() -> EmConfig {
        EmConfig {
            tolerance: 1e-6,
            max_iterations: 1_000,
            convergence: Convergence::Relative,
        }
    }
}

impl EmConfig {
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_convergence(mut self, convergence: Convergence) -> Self {
        self.convergence = convergence;
        self
    }

    /// Fails with [`Error::InvalidParameter`] unless the tolerance is positive and at least
    /// one iteration is allowed.
    pub fn validate(&self) -> Result<()> {
        Error::positive("tolerance", self.tolerance)?;
        Error::positive("max_iterations", self.max_iterations as f64)?;
        Ok(())
    }
}

/// The result of running EM to convergence.
#[derive(Debug, Clone)]
pub struct Fit {
    /// The mixture produced by the last M-step.
    pub mixture: GaussianMixture,
    /// The posterior of the last E-step.
    pub posterior: DMatrix<f64>,
    /// The log-likelihood of the last E-step.
    pub log_likelihood: f64,
    /// Number of E/M pairs performed.
    pub iterations: usize,
    /// Whether the stopping rule was met before the iteration cap.
    pub converged: bool,
    /// The log-likelihood of every E-step, in order.
    pub history: Vec<f64>,
}

impl Fit {
    /// Turns a fit that hit the iteration cap into [`Error::NonConvergence`].
    pub fn require_converged(self) -> Result<Fit> {
        if self.converged {
            Ok(self)
        } else {
            Err(Error::NonConvergence {
                iterations: self.iterations,
                log_likelihood: self.log_likelihood,
            })
        }
    }
}

/// Alternates E- and M-steps, starting from `mixture`, until the log-likelihood stops
/// improving. At least one E/M pair is always performed. The log-likelihood never
/// decreases along the way (up to round-off).
pub fn run<E: MixtureEm + ?Sized>(
    em: &E,
    dataset: &Dataset,
    mixture: GaussianMixture,
    config: &EmConfig,
) -> Result<Fit> {
    config.validate()?;
    mixture.check_dataset(dataset)?;

    let mut mixture = mixture;
    let mut history = Vec::new();

    loop {
        let EStep {
            posterior,
            log_likelihood,
        } = em.estep(dataset, &mixture)?;
        mixture = em.mstep(dataset, &posterior, &mixture)?;

        let previous = history.last().copied();
        history.push(log_likelihood);
        let iterations = history.len();
        tracing::debug!(iteration = iterations, log_likelihood, "EM iteration");

        let converged = match previous {
            Some(previous) => {
                if log_likelihood < previous - 1e-9 * previous.abs() {
                    tracing::warn!(
                        iteration = iterations,
                        previous,
                        log_likelihood,
                        "log-likelihood decreased"
                    );
                }
                config
                    .convergence
                    .has_converged(previous, log_likelihood, config.tolerance)
            }
            None => false,
        };

        if converged || iterations >= config.max_iterations {
            if !converged {
                tracing::warn!(
                    iterations,
                    log_likelihood,
                    "EM stopped at the iteration cap before converging"
                );
            }

            return Ok(Fit {
                mixture,
                posterior,
                log_likelihood,
                iterations,
                converged,
                history,
            });
        }
    }
}

/// Shared E-step skeleton: scores every sample against every component (in parallel),
/// normalizes each row in the log domain and sums the per-row log-likelihoods.
pub(crate) fn expectation<F>(dataset: &Dataset, score: F) -> Result<EStep>
where
    F: Fn(&MaskedSample) -> DVector<f64> + Sync,
{
    let rows = dataset
        .data
        .par_iter()
        .enumerate()
        .map(|(row, sample)| {
            let (posterior, log_likelihood) = robust_softmax(&score(sample));
            if log_likelihood.is_finite() {
                Ok((posterior.transpose(), log_likelihood))
            } else {
                Err(Error::NonFiniteLikelihood { row })
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let log_likelihood = rows.iter().map(|(_, llk)| llk).sum::<f64>();
    let posterior_rows = rows
        .into_iter()
        .map(|(posterior, _)| posterior)
        .collect::<Vec<_>>();

    Ok(EStep {
        posterior: DMatrix::from_rows(&posterior_rows),
        log_likelihood,
    })
}

/// The responsibility mass `sum_i posterior[i, j]` of a component, checked to be usable as
/// a denominator.
pub(crate) fn component_mass(posterior: &DMatrix<f64>, component: usize) -> Result<f64> {
    let mass = posterior.column(component).sum();
    if mass.is_finite() && mass > 0.0 {
        Ok(mass)
    } else {
        Err(Error::degenerate(component, "no responsibility mass"))
    }
}
