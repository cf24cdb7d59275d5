//! Precomputed log-gamma values for integer arguments.
//!
//! Every COI move evaluates a zero-truncated Poisson density and a latent
//! genotype probability that both need `ln(m!)`. The table is built once per
//! run from the maximum COI bound and shared read-only by every chain.

use crate::error::McmcError;
use log::debug;
use statrs::function::gamma::ln_gamma;

#[derive(Debug, Clone)]
pub struct Lookup {
    max_coi: usize,
    /// `ln_gamma[n] = ln Γ(n)` for `n` in `0..=max_coi + 1`. Index 0 holds +inf.
    ln_gamma: Vec<f64>,
}

impl Lookup {
    pub fn new(max_coi: usize) -> Result<Self, McmcError> {
        if max_coi == 0 {
            return Err(McmcError::InvalidMaxCoi(max_coi));
        }

        let ln_gamma_table: Vec<f64> = (0..=max_coi + 1)
            .map(|n| if n == 0 { f64::INFINITY } else { ln_gamma(n as f64) })
            .collect();

        debug!(
            "Built log-gamma lookup with {} entries (max COI {}).",
            ln_gamma_table.len(),
            max_coi
        );

        Ok(Self {
            max_coi,
            ln_gamma: ln_gamma_table,
        })
    }

    #[inline]
    pub fn max_coi(&self) -> usize {
        self.max_coi
    }

    /// `ln Γ(n)`. Panics if `n > max_coi + 1`.
    #[inline]
    pub fn ln_gamma(&self, n: usize) -> f64 {
        self.ln_gamma[n]
    }

    /// `ln(n!) = ln Γ(n + 1)`. Panics if `n > max_coi`.
    #[inline]
    pub fn ln_factorial(&self, n: usize) -> f64 {
        self.ln_gamma[n + 1]
    }
}
