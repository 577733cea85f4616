//! This crate fits mixtures of isotropic Gaussians to data with missing values using the
//! _Expectation-Maximization_ (EM) algorithm, and uses the fitted mixture to fill in the
//! missing entries (e.g., predicting the unrated entries of a sparse ratings matrix).
//!
//! Two EM flavours are available:
//! * [`NaiveEm`] ([`naive`]): every entry of every sample is observed.
//! * [`IncompleteEm`] ([`incomplete`]): each sample only contributes through its observed
//! entries, and variances are kept above a configurable floor.
//!
//! Both plug into the same convergence loop, [`run`], through the [`MixtureEm`] trait. Once a
//! mixture is fitted, [`fill_matrix`] replaces every missing entry by its expected value.
//!
//! Missing values are expressed with explicit masks ([`Mask`], [`MaskedSample`]). Ratings
//! matrices where `0.0` means "missing" can be read with [`Dataset::from_zero_sentinel`].
//!
//! To know more about EM for Gaussian mixtures with missing data, please check:
//! * <http://perception.inrialpes.fr/people/Horaud/Courses/pdf/Horaud-MLSVP9.pdf>: lecture
//! slides, covering mixtures and EM.

mod completion;
mod dataset;
mod em;
mod error;
pub mod incomplete;
pub mod kmeans;
mod mixture;
pub mod naive;
mod utils;

pub use completion::{extrapolate_one, fill_matrix};
pub use dataset::{Dataset, MaskedSample};
pub use em::{run, Convergence, EStep, EmConfig, Fit, MixtureEm};
pub use error::{Error, Result};
pub use incomplete::IncompleteEm;
pub use kmeans::{KMeans, KMeansFit};
pub use mixture::GaussianMixture;
pub use naive::NaiveEm;
pub use utils::Mask;
