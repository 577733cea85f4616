use thiserror::Error;

/// Result alias for `emgmm`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the EM engine.
///
/// Numerical corner cases with a well defined fallback (rows without any observed value,
/// coordinates without enough support to re-estimate a mean) are **not** errors; they are
/// handled in place by the E- and M-steps.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A component lost all of its responsibility mass (or its variance is not a positive
    /// finite number), so its parameters cannot be estimated or evaluated.
    #[error("component {component} is degenerate: {reason}")]
    DegenerateComponent {
        /// Index of the offending component.
        component: usize,
        /// What exactly went wrong.
        reason: &'static str,
    },

    /// Inputs disagree on their dimensions. Reported before any computation starts.
    #[error("shape mismatch in {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        /// Which quantity has the wrong shape.
        what: &'static str,
        /// Expected size.
        expected: usize,
        /// Actual size.
        found: usize,
    },

    /// The convergence loop hit its iteration cap.
    #[error("EM did not converge after {iterations} iterations (log-likelihood {log_likelihood})")]
    NonConvergence {
        /// Number of E/M pairs performed.
        iterations: usize,
        /// Log-likelihood of the last E-step.
        log_likelihood: f64,
    },

    /// A row has zero (or undefined) density under every component.
    #[error("sample {row} has no finite likelihood under the mixture")]
    NonFiniteLikelihood {
        /// Index of the offending row.
        row: usize,
    },

    /// The dataset has no samples.
    #[error("dataset is empty")]
    EmptyDataset,

    /// A tuning parameter is out of its valid range.
    #[error("{name} must be positive, got {value}")]
    InvalidParameter {
        /// Which parameter.
        name: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// Cannot build the requested number of components from the dataset.
    #[error("cannot initialize {requested} components from {n_samples} samples")]
    InvalidComponentCount {
        /// Requested number of components.
        requested: usize,
        /// Number of samples available.
        n_samples: usize,
    },
}

impl Error {
    pub(crate) fn shape(what: &'static str, expected: usize, found: usize) -> Error {
        Error::ShapeMismatch {
            what,
            expected,
            found,
        }
    }

    /// Checks that `value` is a positive finite number.
    pub(crate) fn positive(name: &'static str, value: f64) -> Result<f64> {
        if value.is_finite() && value > 0.0 {
            Ok(value)
        } else {
            Err(Error::InvalidParameter { name, value })
        }
    }

    pub(crate) fn degenerate(component: usize, reason: &'static str) -> Error {
        Error::DegenerateComponent { component, reason }
    }
}
