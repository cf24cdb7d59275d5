//! Chain management: builds one chain and one random stream per requested
//! chain, drives them through burn-in and sampling, and records traces.
//!
//! Chains never share mutable state. The dataset and lookup table are shared
//! through `Arc`, and each chain owns its `Sampler` and `ChainTrace`, so the
//! phases run the chains in parallel on the rayon pool without changing the
//! result for a given seed.

use crate::chain::{AcceptanceCounter, Chain, MoveKind};
use crate::error::McmcError;
use crate::genotyping_data::GenotypingData;
use crate::lookup::Lookup;
use crate::parameters::Parameters;
use crate::sampler::Sampler;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::Rng;
use rayon::prelude::*;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChainPhase {
    Uninitialized,
    BurningIn,
    Sampling,
    Complete,
}

impl ChainPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ChainPhase::Uninitialized => "uninitialized",
            ChainPhase::BurningIn => "burning in",
            ChainPhase::Sampling => "sampling",
            ChainPhase::Complete => "complete",
        }
    }
}

/// Everything recorded for one chain. Append-only while the engine runs.
#[derive(Clone, Debug, Default)]
pub struct ChainTrace {
    pub llik_burnin: Vec<f64>,
    pub llik_sample: Vec<f64>,
    /// `[record][sample]`
    pub coi: Vec<Vec<usize>>,
    /// `[record][locus][allele]`
    pub allele_frequencies: Vec<Vec<Vec<f64>>>,
    pub eps_pos: Vec<f64>,
    pub eps_neg: Vec<f64>,
    pub mean_coi: Vec<f64>,
}

impl ChainTrace {
    fn record_sample(&mut self, chain: &Chain) {
        self.llik_sample.push(chain.llik());
        self.coi.push(chain.coi().to_vec());
        self.allele_frequencies.push(chain.allele_frequencies().to_vec());
        self.eps_pos.push(chain.eps_pos());
        self.eps_neg.push(chain.eps_neg());
        self.mean_coi.push(chain.mean_coi());
    }

    /// Number of recorded sampling snapshots.
    pub fn num_records(&self) -> usize {
        self.coi.len()
    }

    pub fn posterior_mean_coi(&self) -> Vec<f64> {
        let Some(first) = self.coi.first() else {
            return Vec::new();
        };
        let mut means = vec![0.0; first.len()];
        for record in &self.coi {
            for (mean, &coi) in means.iter_mut().zip(record) {
                *mean += coi as f64;
            }
        }
        let n = self.coi.len() as f64;
        means.iter_mut().for_each(|m| *m /= n);
        means
    }

    pub fn posterior_mean_allele_frequencies(&self) -> Vec<Vec<f64>> {
        let Some(first) = self.allele_frequencies.first() else {
            return Vec::new();
        };
        let mut means: Vec<Vec<f64>> = first.iter().map(|p| vec![0.0; p.len()]).collect();
        for record in &self.allele_frequencies {
            for (locus_mean, locus_freqs) in means.iter_mut().zip(record) {
                for (mean, &p) in locus_mean.iter_mut().zip(locus_freqs) {
                    *mean += p;
                }
            }
        }
        let n = self.allele_frequencies.len() as f64;
        for locus_mean in means.iter_mut() {
            locus_mean.iter_mut().for_each(|m| *m /= n);
        }
        means
    }
}

struct ChainRunner {
    chain: Chain,
    sampler: Sampler,
}

pub struct Mcmc {
    params: Parameters,
    seed: u64,
    phase: ChainPhase,
    runners: Vec<ChainRunner>,
    traces: Vec<ChainTrace>,
}

impl Mcmc {
    pub fn new(
        data: Arc<GenotypingData>,
        lookup: Arc<Lookup>,
        params: &Parameters,
    ) -> Result<Self, McmcError> {
        params.validate()?;
        if lookup.max_coi() != params.max_coi {
            return Err(McmcError::InvalidParameter {
                name: "max_coi",
                reason: format!(
                    "lookup table was built for max COI {}, parameters request {}",
                    lookup.max_coi(),
                    params.max_coi
                ),
            });
        }

        let seed = params.seed.unwrap_or_else(|| rand::rng().random());
        info!(
            "Initializing {} chain(s) with seed {} (burn-in {}, samples {}, thin {}).",
            params.chains, seed, params.burnin, params.samples, params.thin
        );

        let mut engine = Self {
            params: params.clone(),
            seed,
            phase: ChainPhase::Uninitialized,
            runners: Vec::with_capacity(params.chains),
            traces: vec![ChainTrace::default(); params.chains],
        };

        for id in 0..params.chains {
            let mut sampler = Sampler::new(lookup.clone(), seed, id as u64);
            let chain = Chain::new(id, data.clone(), lookup.clone(), params, &mut sampler)?;
            engine.runners.push(ChainRunner { chain, sampler });
        }
        engine.transition(ChainPhase::BurningIn);
        Ok(engine)
    }

    fn transition(&mut self, next: ChainPhase) {
        debug!("Chains: {} -> {}", self.phase.as_str(), next.as_str());
        self.phase = next;
    }

    /// Runs the burn-in phase (a no-op when `burnin == 0`).
    pub fn burnin(&mut self) -> Result<(), McmcError> {
        match self.phase {
            ChainPhase::BurningIn => {}
            ChainPhase::Complete => return Err(McmcError::ChainComplete),
            other => {
                return Err(McmcError::PhaseOrder {
                    requested: "burn-in",
                    current: other.as_str(),
                })
            }
        }
        self.run_phase(ChainPhase::BurningIn, self.params.burnin)?;
        self.transition(ChainPhase::Sampling);
        Ok(())
    }

    /// Runs the sampling phase (a no-op when `samples == 0`). Skips burn-in
    /// if it has not been run.
    pub fn sample(&mut self) -> Result<(), McmcError> {
        match self.phase {
            ChainPhase::BurningIn => self.transition(ChainPhase::Sampling),
            ChainPhase::Sampling => {}
            ChainPhase::Complete => return Err(McmcError::ChainComplete),
            ChainPhase::Uninitialized => {
                return Err(McmcError::PhaseOrder {
                    requested: "sampling",
                    current: ChainPhase::Uninitialized.as_str(),
                })
            }
        }
        self.run_phase(ChainPhase::Sampling, self.params.samples)?;
        self.transition(ChainPhase::Complete);
        Ok(())
    }

    /// Burn-in followed by sampling.
    pub fn run(&mut self) -> Result<(), McmcError> {
        self.burnin()?;
        self.sample()
    }

    fn progress_bar(&self, total: u64, label: &str) -> ProgressBar {
        if !self.params.verbose || total == 0 {
            return ProgressBar::hidden();
        }
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg} ({percent}%) ETA: {eta}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> ");
        let pb = ProgressBar::new(total).with_style(style);
        pb.set_message(label.to_string());
        pb
    }

    fn run_phase(&mut self, phase: ChainPhase, iterations: usize) -> Result<(), McmcError> {
        if iterations == 0 {
            debug!("Skipping {} phase: 0 iterations requested.", phase.as_str());
            return Ok(());
        }
        info!(
            "Running {} iterations ({}) on {} chain(s)...",
            iterations,
            phase.as_str(),
            self.runners.len()
        );

        let total = (iterations * self.runners.len()) as u64;
        let progress = self.progress_bar(total, phase.as_str());
        let thin = self.params.thin;

        self.runners
            .par_iter_mut()
            .zip(self.traces.par_iter_mut())
            .try_for_each(|(runner, trace)| {
                for iteration in 0..iterations {
                    runner.chain.sweep(&mut runner.sampler);
                    match phase {
                        ChainPhase::BurningIn => trace.llik_burnin.push(runner.chain.llik()),
                        _ => {
                            if (iteration + 1) % thin == 0 {
                                trace.record_sample(&runner.chain);
                            }
                        }
                    }
                    progress.inc(1);
                }

                let llik = runner.chain.llik();
                if !llik.is_finite() {
                    return Err(McmcError::NonFiniteLikelihood {
                        chain: runner.chain.id(),
                    });
                }
                debug_assert!(
                    (llik - runner.chain.recompute_llik()).abs() <= 1e-6 * llik.abs().max(1.0),
                    "chain {} cached log-likelihood drifted",
                    runner.chain.id()
                );
                Ok(())
            })?;

        progress.finish_with_message(format!("{} complete", phase.as_str()));
        self.log_acceptance();
        Ok(())
    }

    fn log_acceptance(&self) {
        for runner in &self.runners {
            let rates: Vec<String> = MoveKind::ALL
                .iter()
                .map(|&kind| format!("{}={:.3}", kind.name(), runner.chain.acceptance(kind).rate()))
                .collect();
            info!(
                "Chain {}: llik={:.4}, acceptance [{}]",
                runner.chain.id(),
                runner.chain.llik(),
                rates.join(", ")
            );
        }
    }

    pub fn phase(&self) -> ChainPhase {
        self.phase
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn num_chains(&self) -> usize {
        self.runners.len()
    }

    pub fn chain(&self, id: usize) -> &Chain {
        &self.runners[id].chain
    }

    pub fn acceptance(&self, id: usize, kind: MoveKind) -> AcceptanceCounter {
        self.runners[id].chain.acceptance(kind)
    }

    pub fn traces(&self) -> &[ChainTrace] {
        &self.traces
    }

    pub fn trace(&self, id: usize) -> &ChainTrace {
        &self.traces[id]
    }

    pub fn into_traces(self) -> Vec<ChainTrace> {
        self.traces
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(params: &Parameters) -> Mcmc {
        let observed = vec![
            vec![vec![1, 0, 0], vec![0, 1, 1], vec![1, 0, 0]],
            vec![vec![0, 1], vec![1, 1], vec![0, 1]],
        ];
        let missing = vec![vec![false, false, false], vec![false, false, true]];
        let data = Arc::new(GenotypingData::new(observed, missing).unwrap());
        let lookup = Arc::new(Lookup::new(params.max_coi).unwrap());
        Mcmc::new(data, lookup, params).unwrap()
    }

    #[test]
    fn phases_advance_and_terminate() {
        let params = Parameters {
            chains: 2,
            burnin: 5,
            samples: 7,
            seed: Some(1),
            ..Parameters::default()
        };
        let mut mcmc = engine(&params);
        assert_eq!(mcmc.phase(), ChainPhase::BurningIn);
        mcmc.burnin().unwrap();
        assert_eq!(mcmc.phase(), ChainPhase::Sampling);
        assert!(matches!(mcmc.burnin(), Err(McmcError::PhaseOrder { .. })));
        mcmc.sample().unwrap();
        assert_eq!(mcmc.phase(), ChainPhase::Complete);
        assert_eq!(mcmc.burnin(), Err(McmcError::ChainComplete));
        assert_eq!(mcmc.sample(), Err(McmcError::ChainComplete));

        for id in 0..2 {
            let trace = mcmc.trace(id);
            assert_eq!(trace.llik_burnin.len(), 5);
            assert_eq!(trace.llik_sample.len(), 7);
            assert_eq!(trace.num_records(), 7);
            assert_eq!(trace.eps_pos.len(), 7);
            assert_eq!(trace.allele_frequencies[0].len(), 2);
            assert_eq!(trace.coi[0].len(), 3);
        }
    }

    #[test]
    fn thinning_reduces_records() {
        let params = Parameters {
            burnin: 0,
            samples: 10,
            thin: 3,
            seed: Some(2),
            ..Parameters::default()
        };
        let mut mcmc = engine(&params);
        mcmc.run().unwrap();
        let trace = mcmc.trace(0);
        assert!(trace.llik_burnin.is_empty());
        assert_eq!(trace.num_records(), 3);
        assert_eq!(trace.llik_sample.len(), 3);
    }

    #[test]
    fn lookup_must_match_parameters() {
        let params = Parameters::default();
        let data = Arc::new(GenotypingData::new(vec![vec![vec![1, 0]]], vec![vec![false]]).unwrap());
        let lookup = Arc::new(Lookup::new(params.max_coi + 1).unwrap());
        assert!(matches!(
            Mcmc::new(data, lookup, &params),
            Err(McmcError::InvalidParameter { name: "max_coi", .. })
        ));
    }

    #[test]
    fn posterior_means_of_empty_trace_are_empty() {
        let trace = ChainTrace::default();
        assert!(trace.posterior_mean_coi().is_empty());
        assert!(trace.posterior_mean_allele_frequencies().is_empty());
    }
}
