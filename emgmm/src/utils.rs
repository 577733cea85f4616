use bit_vec::BitVec;
use nalgebra::DVector;

/// Computes `ln(sum(exp(data)))` without overflowing. Returns the maximum itself when it
/// is not finite (e.g., every entry is `-inf`), so that callers can detect the situation.
pub(crate) fn robust_log_softnorm(data: &DVector<f64>) -> f64 {
    let max = data.max();
    if !max.is_finite() {
        return max;
    }
    let log_norm = data.iter().map(|&xi| (xi - max).exp()).sum::<f64>().ln();
    max + log_norm
}

/// Turns unnormalized log-scores into a probability distribution (Bayes' rule in the log
/// domain). Also returns the normalization constant, which is the log-likelihood of the
/// scores.
pub(crate) fn robust_softmax(data: &DVector<f64>) -> (DVector<f64>, f64) {
    let log_norm = robust_log_softnorm(data);
    (data.map(|xi| (xi - log_norm).exp()), log_norm)
}

/// Which entries of a sample were actually observed. A set bit means "observed".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask(pub BitVec);

impl Mask {
    /// A mask with every entry observed.
    pub fn unmasked(size: usize) -> Mask {
        Mask(BitVec::from_elem(size, true))
    }

    /// Marks every nonzero entry as observed. This is the compatibility convention for
    /// ratings matrices, where an exact `0.0` stands for "no rating".
    pub fn nonzero(vector: &DVector<f64>) -> Mask {
        Mask(vector.iter().map(|&xi| xi != 0.0).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn filter<'a, I: IntoIterator>(&'a self, it: I) -> impl 'a + Iterator<Item = I::Item>
    where
        I::IntoIter: 'a,
    {
        self.0
            .iter()
            .zip(it)
            .filter(|(selected, _)| *selected)
            .map(|(_, element)| element)
    }

    /// Whether entry `idx` is observed.
    ///
    /// # Panics
    ///
    /// This function panics if `idx` is out of bounds.
    pub fn is_set(&self, idx: usize) -> bool {
        self.0[idx]
    }

    /// The number of observed entries.
    pub fn count(&self) -> usize {
        self.0.iter().filter(|&selected| selected).count()
    }

    /// The indices of the observed entries, in increasing order.
    pub fn observed_indices(&self) -> Vec<usize> {
        self.filter(0..self.0.len()).collect()
    }

    /// The mask as a 0/1 indicator vector.
    pub fn as_vector(&self) -> DVector<f64> {
        self.0
            .iter()
            .map(|selected| selected as i8 as f64)
            .collect::<Vec<f64>>()
            .into()
    }

    /// Zeroes every unobserved entry.
    pub(crate) fn fillna(&self, vector: &DVector<f64>) -> DVector<f64> {
        vector
            .iter()
            .zip(&self.0)
            .map(|(xi, selected)| if selected { *xi } else { 0.0 })
            .collect::<Vec<f64>>()
            .into()
    }

    /// Takes observed entries from `selected` and unobserved ones from `excluded`.
    pub(crate) fn choose(&self, selected: &DVector<f64>, excluded: &DVector<f64>) -> DVector<f64> {
        self.0
            .iter()
            .zip(selected)
            .zip(excluded)
            .map(
                |((is_selected, selected), excluded)| {
                    if is_selected {
                        *selected
                    } else {
                        *excluded
                    }
                },
            )
            .collect::<Vec<_>>()
            .into()
    }
}
