//! Posterior draws, addressed by parameter name.

use ndarray::{Array1, Array2, ArrayView1, Axis};

/// Constrained draws of every chain, one column per named parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorDraws {
    names: Vec<String>,
    /// One `[draws_per_chain, n_params]` matrix per chain, in chain order.
    chains: Vec<Array2<f64>>,
}

impl PosteriorDraws {
    /// # Panics
    /// Panics if a chain's column count differs from `names.len()` or chains
    /// have different lengths.
    pub fn new(names: Vec<String>, chains: Vec<Array2<f64>>) -> Self {
        assert!(
            chains.iter().all(|c| c.ncols() == names.len()),
            "every chain needs one column per parameter"
        );
        assert!(
            chains.windows(2).all(|w| w[0].nrows() == w[1].nrows()),
            "chains must have equal length"
        );
        Self { names, chains }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    pub fn draws_per_chain(&self) -> usize {
        self.chains.first().map_or(0, |c| c.nrows())
    }

    /// Total draws over all chains.
    pub fn n_draws(&self) -> usize {
        self.n_chains() * self.draws_per_chain()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    /// The draws of one parameter, per chain.
    pub fn by_chain(&self, name: &str) -> Option<Vec<ArrayView1<'_, f64>>> {
        let j = self.index_of(name)?;
        Some(self.chains.iter().map(|c| c.column(j)).collect())
    }

    /// The draws of one parameter with chains concatenated in chain order.
    pub fn pooled(&self, name: &str) -> Option<Array1<f64>> {
        let j = self.index_of(name)?;
        Some(
            self.chains
                .iter()
                .flat_map(|c| c.column(j).to_vec())
                .collect(),
        )
    }

    /// Every draw of every parameter, chains stacked: `[n_draws, n_params]`.
    pub fn pooled_matrix(&self) -> Array2<f64> {
        let views: Vec<_> = self.chains.iter().map(|c| c.view()).collect();
        if views.is_empty() {
            return Array2::zeros((0, self.names.len()));
        }
        ndarray::concatenate(Axis(0), &views).unwrap_or_else(|_| Array2::zeros((0, self.names.len())))
    }

    pub fn chain(&self, index: usize) -> Option<&Array2<f64>> {
        self.chains.get(index)
    }
}
