//! Random variates and log-densities used by the Metropolis-Hastings moves.
//!
//! The engine only talks to the [`VariateSource`] trait. Its required methods
//! are the handful of primitive draws a numeric backend must supply; every
//! composite draw (Dirichlet, logit-normal walk, latent genotype, COI step)
//! and every log-density is a provided method built on top of them.
//! [`Sampler`] is the production backend: one ChaCha stream per chain, with
//! `rand_distr` variates and `statrs` densities.

use crate::lookup::Lookup;
use rand::distr::Open01;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Distribution, Gamma, Geometric, Normal};
use statrs::distribution::{Beta as BetaDist, Continuous, Gamma as GammaDist};
use statrs::function::gamma::ln_gamma;
use std::sync::Arc;

/// Floor for gamma variates and simplex components.
pub const UNDERFLO: f64 = 1e-100;
/// Ceiling for gamma variates.
pub const OVERFLO: f64 = 1e100;

/// Capability interface the chains draw from.
pub trait VariateSource {
    /// Uniform on the open interval (0, 1).
    fn uniform(&mut self) -> f64;

    /// Fair coin.
    fn bernoulli(&mut self) -> bool;

    /// Number of failures before the first success.
    fn geometric(&mut self, success_prob: f64) -> u64;

    /// Unclamped gamma variate with the given shape and rate.
    fn gamma_raw(&mut self, shape: f64, rate: f64) -> f64;

    fn normal(&mut self, mean: f64, std_dev: f64) -> f64;

    fn binomial(&mut self, trials: u64, prob: f64) -> u64;

    fn lookup(&self) -> &Lookup;

    /// `ln(U)` for the accept/reject test. Always `<= 0`.
    fn sample_log_mh_acceptance(&mut self) -> f64 {
        self.uniform().ln()
    }

    fn rgamma(&mut self, shape: f64, rate: f64) -> f64 {
        let x = self.gamma_raw(shape, rate);
        if x.is_nan() || x < UNDERFLO {
            UNDERFLO
        } else if x > OVERFLO {
            OVERFLO
        } else {
            x
        }
    }

    fn rdirichlet(&mut self, shape_vec: &[f64]) -> Vec<f64> {
        let mut res: Vec<f64> = shape_vec.iter().map(|&shape| self.rgamma(shape, 1.0)).collect();
        let res_sum_inv = 1.0 / res.iter().sum::<f64>();
        for x in res.iter_mut() {
            *x *= res_sum_inv;
        }
        res
    }

    /// Random walk on the additive log-ratios `ln(p_i / p_last)`.
    fn rlogit_norm(&mut self, p: &[f64], variance: f64) -> Vec<f64> {
        let n = p.len() - 1;
        let std_dev = variance.sqrt();
        let mut ret = vec![0.0; n + 1];

        let mut tmp1 = 0.0;
        for i in 0..n {
            let log_ratio = (p[i] / p[n]).ln() + self.normal(0.0, std_dev);
            ret[i] = log_ratio.min(MAX_LOG_RATIO).exp();
            tmp1 += ret[i];
        }

        let tmp2 = 1.0 / (1.0 + tmp1);
        for x in ret.iter_mut().take(n) {
            *x *= tmp2;
        }
        ret[n] = tmp2;
        ret
    }

    fn sample_epsilon(&mut self, curr_epsilon: f64, variance: f64) -> f64 {
        self.normal(curr_epsilon, variance.sqrt())
    }

    fn sample_mean_coi(&mut self, mean_shape: f64, mean_rate: f64) -> f64 {
        self.rgamma(mean_shape, mean_rate) + 1.0
    }

    /// `+1` or `-1`.
    fn sample_coi_delta(&mut self) -> i64 {
        if self.bernoulli() {
            1
        } else {
            -1
        }
    }

    /// Random sign times `Geometric(1 / (1 + coi_prop_mean))`. May be zero.
    fn sample_coi_delta_geometric(&mut self, coi_prop_mean: f64) -> i64 {
        let magnitude = self.geometric(1.0 / (1.0 + coi_prop_mean)) as i64;
        self.sample_coi_delta() * magnitude
    }

    /// Dirichlet proposal with shape `alpha * p`.
    fn sample_allele_frequencies(&mut self, curr_allele_frequencies: &[f64], alpha: f64) -> Vec<f64> {
        let shape_vec: Vec<f64> = curr_allele_frequencies.iter().map(|&p| p * alpha).collect();
        floor_simplex(self.rdirichlet(&shape_vec))
    }

    fn sample_allele_frequencies_logit(&mut self, curr_allele_frequencies: &[f64], variance: f64) -> Vec<f64> {
        floor_simplex(self.rlogit_norm(curr_allele_frequencies, variance))
    }

    /// Distinct alleles hit by `coi` categorical draws from `allele_frequencies`.
    /// Sorted, never empty for `coi >= 1`.
    fn sample_latent_genotype(&mut self, coi: usize, allele_frequencies: &[f64]) -> Vec<usize> {
        let mut allele_index_vec = Vec::with_capacity(coi.min(allele_frequencies.len()));
        let mut remaining_trials = coi as u64;
        let mut remaining_mass = 1.0;
        let last = allele_frequencies.len() - 1;

        for (allele, &p) in allele_frequencies.iter().enumerate() {
            if remaining_trials == 0 {
                break;
            }
            let hits = if allele == last {
                remaining_trials
            } else {
                let prob = p / remaining_mass;
                if !(prob > 0.0) {
                    0
                } else if prob >= 1.0 {
                    remaining_trials
                } else {
                    self.binomial(remaining_trials, prob)
                }
            };
            if hits > 0 {
                allele_index_vec.push(allele);
            }
            remaining_trials -= hits;
            remaining_mass -= p;
        }
        allele_index_vec
    }

    fn dbeta(&self, x: f64, alpha: f64, beta: f64) -> f64 {
        BetaDist::new(alpha, beta)
            .unwrap_or_else(|e| panic!("invalid Beta({}, {}) density: {}", alpha, beta, e))
            .ln_pdf(x)
    }

    /// Log-density of a Gamma with the given shape and rate.
    fn dgamma(&self, x: f64, shape: f64, rate: f64) -> f64 {
        GammaDist::new(shape, rate)
            .unwrap_or_else(|e| panic!("invalid Gamma({}, {}) density: {}", shape, rate, e))
            .ln_pdf(x)
    }

    /// Zero-truncated Poisson log-pmf: `x ln(lambda) - ln(e^lambda - 1) - ln(x!)`.
    fn dztpois(&self, x: usize, lambda: f64) -> f64 {
        assert!(x >= 1, "zero-truncated Poisson has no mass at x = 0");
        assert!(
            lambda > 0.0,
            "zero-truncated Poisson requires lambda > 0, got {}",
            lambda
        );
        // ln(e^l - 1) = l + ln(1 - e^-l), stable for large lambda.
        let log_normalizer = lambda + (-(-lambda).exp()).ln_1p();
        x as f64 * lambda.ln() - log_normalizer - self.lookup().ln_gamma(x + 1)
    }

    fn ddirichlet(&self, x: &[f64], alpha: &[f64]) -> f64 {
        let alpha_sum: f64 = alpha.iter().sum();
        let mut log_density = ln_gamma(alpha_sum);
        for (&xi, &ai) in x.iter().zip(alpha) {
            log_density += (ai - 1.0) * xi.ln() - ln_gamma(ai);
        }
        log_density
    }

    fn get_coi_log_prob(&self, coi: usize, mean: f64) -> f64 {
        self.dztpois(coi, mean)
    }

    fn get_coi_mean_log_prior(&self, mean: f64, shape: f64, rate: f64) -> f64 {
        self.dgamma(mean, shape, rate)
    }

    fn get_epsilon_log_prior(&self, x: f64, alpha: f64, beta: f64) -> f64 {
        self.dbeta(x, alpha, beta)
    }
}

/// Keeps the logit-normal step from overflowing `exp`.
const MAX_LOG_RATIO: f64 = 700.0;

/// Floors every component at `UNDERFLO` and renormalizes.
pub fn floor_simplex(mut p: Vec<f64>) -> Vec<f64> {
    let mut total = 0.0;
    for x in p.iter_mut() {
        if !(*x >= UNDERFLO) {
            *x = UNDERFLO;
        }
        total += *x;
    }
    for x in p.iter_mut() {
        *x /= total;
    }
    p
}

/// Production [`VariateSource`]: a ChaCha8 stream plus the shared lookup table.
pub struct Sampler {
    eng: ChaCha8Rng,
    lookup: Arc<Lookup>,
}

impl Sampler {
    /// Every chain shares `seed` but sits on its own `stream`, so no two
    /// chains ever draw from the same sequence.
    pub fn new(lookup: Arc<Lookup>, seed: u64, stream: u64) -> Self {
        let mut eng = ChaCha8Rng::seed_from_u64(seed);
        eng.set_stream(stream);
        Self { eng, lookup }
    }
}

impl VariateSource for Sampler {
    fn uniform(&mut self) -> f64 {
        self.eng.sample(Open01)
    }

    fn bernoulli(&mut self) -> bool {
        self.eng.random_bool(0.5)
    }

    fn geometric(&mut self, success_prob: f64) -> u64 {
        Geometric::new(success_prob)
            .unwrap_or_else(|e| panic!("invalid geometric success probability {}: {}", success_prob, e))
            .sample(&mut self.eng)
    }

    fn gamma_raw(&mut self, shape: f64, rate: f64) -> f64 {
        Gamma::new(shape, 1.0 / rate)
            .unwrap_or_else(|e| panic!("invalid Gamma({}, {}) variate: {}", shape, rate, e))
            .sample(&mut self.eng)
    }

    fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        Normal::new(mean, std_dev)
            .unwrap_or_else(|e| panic!("invalid Normal({}, {}) variate: {}", mean, std_dev, e))
            .sample(&mut self.eng)
    }

    fn binomial(&mut self, trials: u64, prob: f64) -> u64 {
        Binomial::new(trials, prob)
            .unwrap_or_else(|e| panic!("invalid Binomial({}, {}) variate: {}", trials, prob, e))
            .sample(&mut self.eng)
    }

    fn lookup(&self) -> &Lookup {
        &self.lookup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sampler(stream: u64) -> Sampler {
        Sampler::new(Arc::new(Lookup::new(25).unwrap()), 42, stream)
    }

    #[test]
    fn log_uniform_is_never_positive() {
        let mut s = sampler(0);
        for _ in 0..10_000 {
            let u = s.sample_log_mh_acceptance();
            assert!(u <= 0.0 && u.is_finite());
        }
    }

    #[test]
    fn ztpois_reference_value() {
        let s = sampler(0);
        let expected = -(std::f64::consts::E - 1.0).ln();
        assert_abs_diff_eq!(s.dztpois(1, 1.0), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(s.dztpois(1, 1.0), -0.5413, epsilon = 1e-4);
    }

    #[test]
    fn ztpois_sums_to_one() {
        let s = sampler(0);
        let total: f64 = (1..=25).map(|x| s.dztpois(x, 2.5).exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
    }

    #[test]
    #[should_panic(expected = "lambda > 0")]
    fn ztpois_rejects_non_positive_lambda() {
        sampler(0).dztpois(1, 0.0);
    }

    #[test]
    #[should_panic(expected = "no mass at x = 0")]
    fn ztpois_rejects_zero_count() {
        sampler(0).dztpois(0, 2.0);
    }

    #[test]
    fn dirichlet_draws_are_simplices() {
        let mut s = sampler(1);
        let shapes = [[0.5, 0.5, 0.5], [1.0, 2.0, 3.0], [1e-3, 1e-3, 50.0]];
        for shape in shapes.iter() {
            for _ in 0..500 {
                let p = s.rdirichlet(shape);
                assert!(p.iter().all(|&x| x >= 0.0));
                assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn logit_normal_draws_are_simplices() {
        let mut s = sampler(2);
        let mut p = vec![0.2, 0.3, 0.5];
        for _ in 0..1000 {
            p = s.sample_allele_frequencies_logit(&p, 0.5);
            assert!(p.iter().all(|&x| x > 0.0));
            assert_abs_diff_eq!(p.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn gamma_draws_are_clamped() {
        let mut s = sampler(3);
        for _ in 0..1000 {
            let x = s.rgamma(1e-4, 1.0);
            assert!((UNDERFLO..=OVERFLO).contains(&x));
        }
    }

    #[test]
    fn latent_genotype_is_sorted_unique_and_bounded() {
        let mut s = sampler(4);
        let p = [0.1, 0.2, 0.3, 0.4];
        for coi in 1..8 {
            for _ in 0..200 {
                let g = s.sample_latent_genotype(coi, &p);
                assert!(!g.is_empty());
                assert!(g.len() <= coi.min(p.len()));
                assert!(g.windows(2).all(|w| w[0] < w[1]));
                assert!(g.iter().all(|&a| a < p.len()));
            }
        }
    }

    #[test]
    fn single_strain_genotype_follows_frequencies() {
        let mut s = sampler(5);
        let p = [0.25, 0.75];
        let draws = 20_000;
        let hits = (0..draws)
            .filter(|_| s.sample_latent_genotype(1, &p) == vec![1])
            .count();
        assert_abs_diff_eq!(hits as f64 / draws as f64, 0.75, epsilon = 0.02);
    }

    #[test]
    fn coi_deltas() {
        let mut s = sampler(6);
        for _ in 0..1000 {
            let d = s.sample_coi_delta();
            assert!(d == 1 || d == -1);
        }
        let mean_abs: f64 = (0..20_000)
            .map(|_| s.sample_coi_delta_geometric(2.0).abs() as f64)
            .sum::<f64>()
            / 20_000.0;
        // Failures before success with p = 1/3 has mean 2.
        assert_abs_diff_eq!(mean_abs, 2.0, epsilon = 0.1);
    }

    #[test]
    fn streams_are_independent_and_reproducible() {
        let mut a = sampler(0);
        let mut b = sampler(0);
        let mut c = sampler(1);
        let xa: Vec<f64> = (0..10).map(|_| a.uniform()).collect();
        let xb: Vec<f64> = (0..10).map(|_| b.uniform()).collect();
        let xc: Vec<f64> = (0..10).map(|_| c.uniform()).collect();
        assert_eq!(xa, xb);
        assert_ne!(xa, xc);
    }

    #[test]
    fn dirichlet_density_of_flat_prior_is_log_gamma_of_dimension() {
        let s = sampler(0);
        let log_density = s.ddirichlet(&[0.2, 0.3, 0.5], &[1.0, 1.0, 1.0]);
        assert_abs_diff_eq!(log_density, 2f64.ln(), epsilon = 1e-10);
    }
}
