//! One Markov chain: current parameter values, cached likelihood pieces and
//! the Metropolis-Hastings moves that update them.
//!
//! # Likelihood
//!
//! For each (locus, sample) cell the joint log-likelihood has two parts:
//!
//! - `latent_llik`: `ln P(G | coi, p)`, the probability that `coi` draws from
//!   the locus allele frequencies hit exactly the latent allele set `G`;
//! - the observation term, `ln P(calls | G, eps_pos, eps_neg)`, which only
//!   depends on the four per-cell call counts (true/false positives and
//!   negatives). Those counts are cached per cell and summed chain-wide, so an
//!   error-rate move costs O(1).
//!
//! Priors enter the acceptance ratios but not the reported log-likelihood.
//!
//! # Moves
//!
//! Every move goes through [`Chain::metropolis_step`]: propose a candidate,
//! score its log acceptance ratio, accept against `ln U`, commit. A proposal
//! that leaves the support is a rejection.

use crate::error::McmcError;
use crate::genotyping_data::GenotypingData;
use crate::lookup::Lookup;
use crate::parameters::{AlleleFreqKernel, CoiDeltaKernel, Parameters};
use crate::sampler::{floor_simplex, VariateSource};
use log::{debug, warn};
use ndarray::{Array2, ArrayView1};
use std::sync::Arc;

/// The closed set of Metropolis-Hastings moves, in sweep order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MoveKind {
    LatentGenotype,
    Coi,
    MeanCoi,
    AlleleFrequencies,
    EpsilonPos,
    EpsilonNeg,
}

impl MoveKind {
    pub const ALL: [MoveKind; 6] = [
        MoveKind::LatentGenotype,
        MoveKind::Coi,
        MoveKind::MeanCoi,
        MoveKind::AlleleFrequencies,
        MoveKind::EpsilonPos,
        MoveKind::EpsilonNeg,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MoveKind::LatentGenotype => "latent_genotype",
            MoveKind::Coi => "coi",
            MoveKind::MeanCoi => "mean_coi",
            MoveKind::AlleleFrequencies => "allele_frequencies",
            MoveKind::EpsilonPos => "eps_pos",
            MoveKind::EpsilonNeg => "eps_neg",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Agreement between observed calls and a latent genotype at one cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub true_pos: u64,
    pub false_neg: u64,
    pub false_pos: u64,
    pub true_neg: u64,
}

impl CallCounts {
    /// Compares 0/1 calls with a sorted set of latent allele indices.
    pub fn tally(observed: ArrayView1<u8>, genotype: &[usize]) -> Self {
        let mut counts = CallCounts::default();
        let mut latent = genotype.iter().peekable();
        for (allele, &call) in observed.iter().enumerate() {
            let present = latent.next_if(|&&a| a == allele).is_some();
            match (present, call == 1) {
                (true, true) => counts.true_pos += 1,
                (true, false) => counts.false_neg += 1,
                (false, true) => counts.false_pos += 1,
                (false, false) => counts.true_neg += 1,
            }
        }
        counts
    }

    pub fn log_likelihood(&self, eps_pos: f64, eps_neg: f64) -> f64 {
        let mut llik = 0.0;
        if self.true_pos > 0 {
            llik += self.true_pos as f64 * (1.0 - eps_neg).ln();
        }
        if self.false_neg > 0 {
            llik += self.false_neg as f64 * eps_neg.ln();
        }
        if self.false_pos > 0 {
            llik += self.false_pos as f64 * eps_pos.ln();
        }
        if self.true_neg > 0 {
            llik += self.true_neg as f64 * (1.0 - eps_pos).ln();
        }
        llik
    }

    fn add(&mut self, other: &CallCounts) {
        self.true_pos += other.true_pos;
        self.false_neg += other.false_neg;
        self.false_pos += other.false_pos;
        self.true_neg += other.true_neg;
    }

    fn sub(&mut self, other: &CallCounts) {
        self.true_pos -= other.true_pos;
        self.false_neg -= other.false_neg;
        self.false_pos -= other.false_pos;
        self.true_neg -= other.true_neg;
    }
}

/// `ln P(G | coi, p)`: the probability that `coi` categorical draws from
/// `allele_frequencies` hit exactly the alleles in `genotype`.
///
/// Uses `P = coi! * prod(p_a) * [x^(coi - k)] prod_a g_a(x)` with
/// `g_a(x) = sum_j p_a^j x^j / (j + 1)!`, which is
/// `coi! [x^coi] prod_a (e^(p_a x) - 1)` with the leading `p_a x` factored out
/// so every term stays positive. Coefficients are kept as logarithms because
/// `p^j / (j + 1)!` underflows for COI in the hundreds.
pub fn latent_genotype_log_prob(
    genotype: &[usize],
    coi: usize,
    allele_frequencies: &[f64],
    lookup: &Lookup,
) -> f64 {
    let k = genotype.len();
    if k == 0 || k > coi {
        return f64::NEG_INFINITY;
    }
    let extra = coi - k;

    let mut log_coeffs = vec![f64::NEG_INFINITY; extra + 1];
    log_coeffs[0] = 0.0;
    let mut log_factor = vec![0.0; extra + 1];
    let mut log_prod_p = 0.0;
    let mut terms = Vec::with_capacity(extra + 1);

    for &allele in genotype {
        let ln_p = allele_frequencies[allele].ln();
        log_prod_p += ln_p;

        // log_factor[j] = j ln p - ln (j + 1)!
        for (j, f) in log_factor.iter_mut().enumerate() {
            *f = j as f64 * ln_p - lookup.ln_factorial(j + 1);
        }

        for d in (0..=extra).rev() {
            terms.clear();
            terms.extend((0..=d).map(|j| log_coeffs[d - j] + log_factor[j]));
            log_coeffs[d] = log_sum_exp(&terms);
        }
    }

    lookup.ln_factorial(coi) + log_prod_p + log_coeffs[extra]
}

fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcceptanceCounter {
    pub proposed: u64,
    pub accepted: u64,
}

impl AcceptanceCounter {
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

enum Candidate {
    LatentGenotype {
        locus: usize,
        sample: usize,
        genotype: Vec<usize>,
        counts: CallCounts,
        latent_llik: f64,
    },
    Coi {
        sample: usize,
        coi: usize,
        latent_lliks: Vec<f64>,
    },
    MeanCoi {
        mean_coi: f64,
    },
    AlleleFrequencies {
        locus: usize,
        frequencies: Vec<f64>,
        log_hastings: f64,
        latent_lliks: Vec<f64>,
    },
    EpsilonPos {
        eps_pos: f64,
    },
    EpsilonNeg {
        eps_neg: f64,
    },
}

pub struct Chain {
    id: usize,
    data: Arc<GenotypingData>,
    lookup: Arc<Lookup>,
    params: Parameters,

    coi: Vec<usize>,
    mean_coi: f64,
    allele_frequencies: Vec<Vec<f64>>,
    eps_pos: f64,
    eps_neg: f64,
    /// `[locus][sample]` sorted allele indices.
    latent_genotypes: Vec<Vec<Vec<usize>>>,

    call_counts: Array2<CallCounts>,
    total_counts: CallCounts,
    latent_llik: Array2<f64>,
    latent_llik_total: f64,
    llik: f64,

    acceptance: [AcceptanceCounter; 6],
}

impl Chain {
    /// Builds a chain at its starting values: COI at the observed lower bound,
    /// frequencies from observed counts plus one, latent genotypes equal to the
    /// observed calls where that set is usable and drawn from the prior
    /// elsewhere.
    pub fn new<S: VariateSource>(
        id: usize,
        data: Arc<GenotypingData>,
        lookup: Arc<Lookup>,
        params: &Parameters,
        sampler: &mut S,
    ) -> Result<Self, McmcError> {
        let num_loci = data.num_loci();
        let num_samples = data.num_samples();
        let max_coi = lookup.max_coi();

        let coi: Vec<usize> = (0..num_samples)
            .map(|sample| {
                let observed = data.observed_coi(sample).max(1);
                if observed > max_coi {
                    warn!(
                        "Chain {}: sample {} calls {} alleles at one locus, above max COI {}; starting at {}.",
                        id, sample, observed, max_coi, max_coi
                    );
                }
                observed.min(max_coi)
            })
            .collect();

        let allele_frequencies: Vec<Vec<f64>> = (0..num_loci)
            .map(|locus| {
                let counts = data.allele_counts(locus);
                let total: usize = counts.iter().map(|c| c + 1).sum();
                floor_simplex(
                    counts
                        .iter()
                        .map(|&c| (c + 1) as f64 / total as f64)
                        .collect(),
                )
            })
            .collect();

        let mean_coi = sampler.sample_mean_coi(params.mean_coi_shape, params.mean_coi_rate);

        let latent_genotypes: Vec<Vec<Vec<usize>>> = (0..num_loci)
            .map(|locus| {
                (0..num_samples)
                    .map(|sample| {
                        let observed = data.observed_allele_indices(locus, sample);
                        if !data.is_missing(locus, sample)
                            && !observed.is_empty()
                            && observed.len() <= coi[sample]
                        {
                            observed
                        } else {
                            sampler.sample_latent_genotype(coi[sample], &allele_frequencies[locus])
                        }
                    })
                    .collect()
            })
            .collect();

        let mut chain = Self {
            id,
            data,
            lookup,
            params: params.clone(),
            coi,
            mean_coi,
            allele_frequencies,
            eps_pos: params.eps_pos_0,
            eps_neg: params.eps_neg_0,
            latent_genotypes,
            call_counts: Array2::default((num_loci, num_samples)),
            total_counts: CallCounts::default(),
            latent_llik: Array2::zeros((num_loci, num_samples)),
            latent_llik_total: 0.0,
            llik: 0.0,
            acceptance: [AcceptanceCounter::default(); 6],
        };
        chain.rebuild_caches();

        if !chain.llik.is_finite() {
            return Err(McmcError::NonFiniteLikelihood { chain: id });
        }
        debug!(
            "Chain {} initialized: llik={:.4}, mean_coi={:.3}",
            id, chain.llik, chain.mean_coi
        );
        Ok(chain)
    }

    fn cell_counts(&self, locus: usize, sample: usize, genotype: &[usize]) -> CallCounts {
        if self.data.is_missing(locus, sample) {
            CallCounts::default()
        } else {
            CallCounts::tally(self.data.get_observed_alleles(locus, sample), genotype)
        }
    }

    fn rebuild_caches(&mut self) {
        self.total_counts = CallCounts::default();
        self.latent_llik_total = 0.0;
        for locus in 0..self.data.num_loci() {
            for sample in 0..self.data.num_samples() {
                let genotype = &self.latent_genotypes[locus][sample];
                let counts = self.cell_counts(locus, sample, genotype);
                let latent = latent_genotype_log_prob(
                    genotype,
                    self.coi[sample],
                    &self.allele_frequencies[locus],
                    &self.lookup,
                );
                self.total_counts.add(&counts);
                self.call_counts[[locus, sample]] = counts;
                self.latent_llik[[locus, sample]] = latent;
                self.latent_llik_total += latent;
            }
        }
        self.llik = self.total_llik();
    }

    fn total_llik(&self) -> f64 {
        self.total_counts.log_likelihood(self.eps_pos, self.eps_neg) + self.latent_llik_total
    }

    /// Log-likelihood recomputed from scratch, ignoring every cache.
    pub fn recompute_llik(&self) -> f64 {
        let mut llik = 0.0;
        for locus in 0..self.data.num_loci() {
            for sample in 0..self.data.num_samples() {
                let genotype = &self.latent_genotypes[locus][sample];
                llik += self
                    .cell_counts(locus, sample, genotype)
                    .log_likelihood(self.eps_pos, self.eps_neg);
                llik += latent_genotype_log_prob(
                    genotype,
                    self.coi[sample],
                    &self.allele_frequencies[locus],
                    &self.lookup,
                );
            }
        }
        llik
    }

    /// Number of independent targets a move kind sweeps over.
    pub fn num_targets(&self, kind: MoveKind) -> usize {
        match kind {
            MoveKind::LatentGenotype => self.data.num_loci() * self.data.num_samples(),
            MoveKind::Coi => self.data.num_samples(),
            MoveKind::AlleleFrequencies => self.data.num_loci(),
            MoveKind::MeanCoi | MoveKind::EpsilonPos | MoveKind::EpsilonNeg => 1,
        }
    }

    /// One full iteration: every move kind over every target.
    pub fn sweep<S: VariateSource>(&mut self, sampler: &mut S) {
        for kind in MoveKind::ALL {
            self.update(kind, sampler);
        }
    }

    pub fn update<S: VariateSource>(&mut self, kind: MoveKind, sampler: &mut S) {
        for target in 0..self.num_targets(kind) {
            self.metropolis_step(kind, target, sampler);
        }
    }

    /// Propose, score, accept or reject. Returns whether the proposal was accepted.
    ///
    /// `target` is a sample for COI moves, a locus for allele-frequency moves,
    /// `locus * num_samples + sample` for latent genotype moves, and ignored
    /// for the scalar moves.
    pub fn metropolis_step<S: VariateSource>(&mut self, kind: MoveKind, target: usize, sampler: &mut S) -> bool {
        self.acceptance[kind.index()].proposed += 1;

        let Some(mut candidate) = self.propose(kind, target, sampler) else {
            return false;
        };
        let log_ratio = self.score(&mut candidate, sampler);

        if sampler.sample_log_mh_acceptance() < log_ratio {
            self.commit(candidate);
            self.acceptance[kind.index()].accepted += 1;
            true
        } else {
            false
        }
    }

    fn propose<S: VariateSource>(&self, kind: MoveKind, target: usize, sampler: &mut S) -> Option<Candidate> {
        match kind {
            MoveKind::LatentGenotype => {
                let num_samples = self.data.num_samples();
                let (locus, sample) = (target / num_samples, target % num_samples);
                let genotype =
                    sampler.sample_latent_genotype(self.coi[sample], &self.allele_frequencies[locus]);
                Some(Candidate::LatentGenotype {
                    locus,
                    sample,
                    genotype,
                    counts: CallCounts::default(),
                    latent_llik: 0.0,
                })
            }
            MoveKind::Coi => {
                let delta = match self.params.coi_delta_kernel {
                    CoiDeltaKernel::Unit => sampler.sample_coi_delta(),
                    CoiDeltaKernel::Geometric => {
                        sampler.sample_coi_delta_geometric(self.params.coi_prop_mean)
                    }
                };
                let proposed = self.coi[target] as i64 + delta;
                if proposed < 1 || proposed > self.lookup.max_coi() as i64 {
                    return None;
                }
                Some(Candidate::Coi {
                    sample: target,
                    coi: proposed as usize,
                    latent_lliks: Vec::new(),
                })
            }
            MoveKind::MeanCoi => {
                let mean_coi = sampler.normal(self.mean_coi, self.params.mean_coi_var.sqrt());
                (mean_coi > 0.0).then_some(Candidate::MeanCoi { mean_coi })
            }
            MoveKind::AlleleFrequencies => {
                let current = &self.allele_frequencies[target];
                let (frequencies, log_hastings) = match self.params.allele_freq_kernel {
                    AlleleFreqKernel::Dirichlet => {
                        let alpha = self.params.allele_freq_alpha;
                        let proposed = sampler.sample_allele_frequencies(current, alpha);
                        let forward_shape: Vec<f64> = current.iter().map(|&p| p * alpha).collect();
                        let reverse_shape: Vec<f64> = proposed.iter().map(|&p| p * alpha).collect();
                        let log_hastings = sampler.ddirichlet(current, &reverse_shape)
                            - sampler.ddirichlet(&proposed, &forward_shape);
                        (proposed, log_hastings)
                    }
                    AlleleFreqKernel::LogitNormal => {
                        let proposed =
                            sampler.sample_allele_frequencies_logit(current, self.params.allele_freq_var);
                        // Jacobian of the additive log-ratio transform.
                        let log_hastings = proposed.iter().map(|p| p.ln()).sum::<f64>()
                            - current.iter().map(|p| p.ln()).sum::<f64>();
                        (proposed, log_hastings)
                    }
                };
                Some(Candidate::AlleleFrequencies {
                    locus: target,
                    frequencies,
                    log_hastings,
                    latent_lliks: Vec::new(),
                })
            }
            MoveKind::EpsilonPos => {
                let eps_pos = sampler.sample_epsilon(self.eps_pos, self.params.eps_pos_var);
                (eps_pos > 0.0 && eps_pos < self.params.max_eps_pos)
                    .then_some(Candidate::EpsilonPos { eps_pos })
            }
            MoveKind::EpsilonNeg => {
                let eps_neg = sampler.sample_epsilon(self.eps_neg, self.params.eps_neg_var);
                (eps_neg > 0.0 && eps_neg < self.params.max_eps_neg)
                    .then_some(Candidate::EpsilonNeg { eps_neg })
            }
        }
    }

    /// Log acceptance ratio of a candidate. Fills in the likelihood pieces the
    /// commit needs.
    fn score<S: VariateSource>(&self, candidate: &mut Candidate, sampler: &S) -> f64 {
        match candidate {
            Candidate::LatentGenotype {
                locus,
                sample,
                genotype,
                counts,
                latent_llik,
            } => {
                // Proposed from P(G | coi, p), so only the observation term remains.
                *counts = self.cell_counts(*locus, *sample, genotype);
                *latent_llik = latent_genotype_log_prob(
                    genotype,
                    self.coi[*sample],
                    &self.allele_frequencies[*locus],
                    &self.lookup,
                );
                let old_counts = &self.call_counts[[*locus, *sample]];
                counts.log_likelihood(self.eps_pos, self.eps_neg)
                    - old_counts.log_likelihood(self.eps_pos, self.eps_neg)
            }
            Candidate::Coi {
                sample,
                coi,
                latent_lliks,
            } => {
                let mut log_ratio = sampler.get_coi_log_prob(*coi, self.mean_coi)
                    - sampler.get_coi_log_prob(self.coi[*sample], self.mean_coi);
                latent_lliks.reserve(self.data.num_loci());
                for locus in 0..self.data.num_loci() {
                    let new_llik = latent_genotype_log_prob(
                        &self.latent_genotypes[locus][*sample],
                        *coi,
                        &self.allele_frequencies[locus],
                        &self.lookup,
                    );
                    log_ratio += new_llik - self.latent_llik[[locus, *sample]];
                    latent_lliks.push(new_llik);
                }
                log_ratio
            }
            Candidate::MeanCoi { mean_coi } => {
                let mut log_ratio = sampler.get_coi_mean_log_prior(
                    *mean_coi,
                    self.params.mean_coi_shape,
                    self.params.mean_coi_rate,
                ) - sampler.get_coi_mean_log_prior(
                    self.mean_coi,
                    self.params.mean_coi_shape,
                    self.params.mean_coi_rate,
                );
                for &coi in &self.coi {
                    log_ratio += sampler.get_coi_log_prob(coi, *mean_coi)
                        - sampler.get_coi_log_prob(coi, self.mean_coi);
                }
                log_ratio
            }
            Candidate::AlleleFrequencies {
                locus,
                frequencies,
                log_hastings,
                latent_lliks,
            } => {
                let current = &self.allele_frequencies[*locus];
                let concentration = vec![self.params.allele_freq_concentration; current.len()];
                let mut log_ratio = *log_hastings + sampler.ddirichlet(frequencies, &concentration)
                    - sampler.ddirichlet(current, &concentration);
                latent_lliks.reserve(self.data.num_samples());
                for sample in 0..self.data.num_samples() {
                    let new_llik = latent_genotype_log_prob(
                        &self.latent_genotypes[*locus][sample],
                        self.coi[sample],
                        frequencies,
                        &self.lookup,
                    );
                    log_ratio += new_llik - self.latent_llik[[*locus, sample]];
                    latent_lliks.push(new_llik);
                }
                log_ratio
            }
            Candidate::EpsilonPos { eps_pos } => {
                let (alpha, beta) = (self.params.eps_pos_alpha, self.params.eps_pos_beta);
                self.total_counts.log_likelihood(*eps_pos, self.eps_neg)
                    - self.total_counts.log_likelihood(self.eps_pos, self.eps_neg)
                    + sampler.get_epsilon_log_prior(*eps_pos, alpha, beta)
                    - sampler.get_epsilon_log_prior(self.eps_pos, alpha, beta)
            }
            Candidate::EpsilonNeg { eps_neg } => {
                let (alpha, beta) = (self.params.eps_neg_alpha, self.params.eps_neg_beta);
                self.total_counts.log_likelihood(self.eps_pos, *eps_neg)
                    - self.total_counts.log_likelihood(self.eps_pos, self.eps_neg)
                    + sampler.get_epsilon_log_prior(*eps_neg, alpha, beta)
                    - sampler.get_epsilon_log_prior(self.eps_neg, alpha, beta)
            }
        }
    }

    fn commit(&mut self, candidate: Candidate) {
        match candidate {
            Candidate::LatentGenotype {
                locus,
                sample,
                genotype,
                counts,
                latent_llik,
            } => {
                self.total_counts.sub(&self.call_counts[[locus, sample]]);
                self.total_counts.add(&counts);
                self.call_counts[[locus, sample]] = counts;
                self.latent_llik_total += latent_llik - self.latent_llik[[locus, sample]];
                self.latent_llik[[locus, sample]] = latent_llik;
                self.latent_genotypes[locus][sample] = genotype;
            }
            Candidate::Coi {
                sample,
                coi,
                latent_lliks,
            } => {
                for (locus, new_llik) in latent_lliks.into_iter().enumerate() {
                    self.latent_llik_total += new_llik - self.latent_llik[[locus, sample]];
                    self.latent_llik[[locus, sample]] = new_llik;
                }
                self.coi[sample] = coi;
            }
            Candidate::MeanCoi { mean_coi } => self.mean_coi = mean_coi,
            Candidate::AlleleFrequencies {
                locus,
                frequencies,
                latent_lliks,
                ..
            } => {
                for (sample, new_llik) in latent_lliks.into_iter().enumerate() {
                    self.latent_llik_total += new_llik - self.latent_llik[[locus, sample]];
                    self.latent_llik[[locus, sample]] = new_llik;
                }
                self.allele_frequencies[locus] = frequencies;
            }
            Candidate::EpsilonPos { eps_pos } => self.eps_pos = eps_pos,
            Candidate::EpsilonNeg { eps_neg } => self.eps_neg = eps_neg,
        }
        self.llik = self.total_llik();
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Cached total log-likelihood.
    pub fn llik(&self) -> f64 {
        self.llik
    }

    pub fn coi(&self) -> &[usize] {
        &self.coi
    }

    pub fn mean_coi(&self) -> f64 {
        self.mean_coi
    }

    pub fn allele_frequencies(&self) -> &[Vec<f64>] {
        &self.allele_frequencies
    }

    pub fn eps_pos(&self) -> f64 {
        self.eps_pos
    }

    pub fn eps_neg(&self) -> f64 {
        self.eps_neg
    }

    pub fn latent_genotype(&self, locus: usize, sample: usize) -> &[usize] {
        &self.latent_genotypes[locus][sample]
    }

    pub fn acceptance(&self, kind: MoveKind) -> AcceptanceCounter {
        self.acceptance[kind.index()]
    }
}
