use approx::assert_abs_diff_eq;
use coi_mcmc::{
    AlleleFreqKernel, ChainPhase, CoiDeltaKernel, GenotypingData, Lookup, Mcmc, McmcError, MoveKind,
    Parameters,
};
use std::sync::Arc;

fn build(observed: Vec<Vec<Vec<u8>>>, missing: Vec<Vec<bool>>, params: &Parameters) -> Mcmc {
    let data = Arc::new(GenotypingData::new(observed, missing).unwrap());
    let lookup = Arc::new(Lookup::new(params.max_coi).unwrap());
    Mcmc::new(data, lookup, params).unwrap()
}

/// Three loci, six samples, a mix of monoclonal and polyclonal calls.
fn mixed_panel(params: &Parameters) -> Mcmc {
    let observed = vec![
        vec![
            vec![1, 0, 0],
            vec![1, 1, 0],
            vec![0, 0, 1],
            vec![1, 1, 1],
            vec![0, 1, 0],
            vec![1, 0, 0],
        ],
        vec![
            vec![0, 1],
            vec![1, 1],
            vec![1, 0],
            vec![1, 1],
            vec![0, 1],
            vec![0, 0],
        ],
        vec![
            vec![1, 0, 0, 0],
            vec![0, 0, 1, 1],
            vec![0, 1, 0, 0],
            vec![1, 0, 1, 0],
            vec![0, 0, 0, 1],
            vec![1, 0, 0, 0],
        ],
    ];
    let missing = vec![
        vec![false; 6],
        vec![false, false, false, false, false, true],
        vec![false; 6],
    ];
    build(observed, missing, params)
}

fn sample_variance(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var)
}

#[test]
fn zero_iterations_complete_with_empty_traces() {
    let params = Parameters {
        chains: 2,
        burnin: 0,
        samples: 0,
        seed: Some(3),
        ..Parameters::default()
    };
    let mut mcmc = mixed_panel(&params);
    mcmc.run().unwrap();
    assert_eq!(mcmc.phase(), ChainPhase::Complete);
    for trace in mcmc.into_traces() {
        assert!(trace.llik_burnin.is_empty());
        assert!(trace.llik_sample.is_empty());
        assert_eq!(trace.num_records(), 0);
    }
}

#[test]
fn sampled_states_stay_in_support() {
    let params = Parameters {
        chains: 2,
        burnin: 50,
        samples: 200,
        max_coi: 6,
        seed: Some(17),
        coi_delta_kernel: CoiDeltaKernel::Geometric,
        coi_prop_mean: 2.0,
        ..Parameters::default()
    };
    let mut mcmc = mixed_panel(&params);
    mcmc.run().unwrap();

    for id in 0..mcmc.num_chains() {
        let trace = mcmc.trace(id);
        assert_eq!(trace.llik_burnin.len(), 50);
        assert_eq!(trace.num_records(), 200);
        assert!(trace.llik_sample.iter().all(|l| l.is_finite()));
        for record in &trace.coi {
            assert!(record.iter().all(|&c| (1..=6).contains(&c)));
        }
        for record in &trace.allele_frequencies {
            for freqs in record {
                assert_abs_diff_eq!(freqs.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
                assert!(freqs.iter().all(|&p| p > 0.0 && p <= 1.0));
            }
        }
        assert!(trace.eps_pos.iter().all(|&e| e > 0.0 && e < params.max_eps_pos));
        assert!(trace.eps_neg.iter().all(|&e| e > 0.0 && e < params.max_eps_neg));
        assert!(trace.mean_coi.iter().all(|&m| m > 0.0));

        let chain = mcmc.chain(id);
        for kind in MoveKind::ALL {
            assert!(mcmc.acceptance(id, kind).proposed > 0, "{} never proposed", kind.name());
        }
        assert_abs_diff_eq!(
            chain.llik(),
            chain.recompute_llik(),
            epsilon = 1e-6 * chain.llik().abs().max(1.0)
        );
    }
}

#[test]
fn allele_frequencies_recover_population_proportion() {
    // 200 monoclonal samples, 70% carrying allele 0.
    let num_samples = 200;
    let observed = vec![(0..num_samples)
        .map(|s| if s < 140 { vec![1, 0] } else { vec![0, 1] })
        .collect()];
    let missing = vec![vec![false; num_samples]];
    let params = Parameters {
        burnin: 500,
        samples: 1000,
        max_coi: 1,
        seed: Some(42),
        ..Parameters::default()
    };
    let mut mcmc = build(observed, missing, &params);
    mcmc.run().unwrap();

    let means = mcmc.trace(0).posterior_mean_allele_frequencies();
    assert_abs_diff_eq!(means[0][0], 0.7, epsilon = 0.05);
    assert_abs_diff_eq!(means[0][1], 0.3, epsilon = 0.05);
    assert!(mcmc.trace(0).coi.iter().all(|record| record.iter().all(|&c| c == 1)));
}

fn prior_recovery(kernel: AlleleFreqKernel) {
    // A single fully missing sample: the frequency posterior is the flat
    // Dirichlet prior, whose first component has variance 1/12.
    let params = Parameters {
        burnin: 1000,
        samples: 40_000,
        max_coi: 5,
        seed: Some(2024),
        allele_freq_kernel: kernel,
        allele_freq_alpha: 10.0,
        allele_freq_var: 1.0,
        ..Parameters::default()
    };
    let mut mcmc = build(vec![vec![vec![0, 0]]], vec![vec![true]], &params);
    mcmc.run().unwrap();

    let p0: Vec<f64> = mcmc
        .trace(0)
        .allele_frequencies
        .iter()
        .map(|record| record[0][0])
        .collect();
    let (mean, var) = sample_variance(&p0);
    assert_abs_diff_eq!(mean, 0.5, epsilon = 0.05);
    assert_abs_diff_eq!(var, 1.0 / 12.0, epsilon = 0.02);
}

#[test]
fn dirichlet_kernel_samples_the_prior() {
    prior_recovery(AlleleFreqKernel::Dirichlet);
}

#[test]
fn logit_normal_kernel_samples_the_prior() {
    prior_recovery(AlleleFreqKernel::LogitNormal);
}

#[test]
fn seeded_runs_are_reproducible_and_chains_differ() {
    let params = Parameters {
        chains: 2,
        burnin: 20,
        samples: 50,
        seed: Some(99),
        ..Parameters::default()
    };
    let mut first = mixed_panel(&params);
    let mut second = mixed_panel(&params);
    first.run().unwrap();
    second.run().unwrap();
    assert_eq!(first.seed(), 99);

    for id in 0..2 {
        let (a, b) = (first.trace(id), second.trace(id));
        assert_eq!(a.llik_burnin, b.llik_burnin);
        assert_eq!(a.llik_sample, b.llik_sample);
        assert_eq!(a.coi, b.coi);
        assert_eq!(a.allele_frequencies, b.allele_frequencies);
        assert_eq!(a.eps_pos, b.eps_pos);
        assert_eq!(a.eps_neg, b.eps_neg);
    }
    assert_ne!(first.trace(0).llik_sample, first.trace(1).llik_sample);
}

#[test]
fn completed_engine_refuses_to_run() {
    let params = Parameters {
        burnin: 3,
        samples: 3,
        seed: Some(5),
        ..Parameters::default()
    };
    let mut mcmc = mixed_panel(&params);
    mcmc.run().unwrap();
    assert_eq!(mcmc.run(), Err(McmcError::ChainComplete));
    assert_eq!(mcmc.sample(), Err(McmcError::ChainComplete));
    assert_eq!(mcmc.trace(0).num_records(), 3);
}

#[test]
fn invalid_parameters_fail_before_sampling() {
    let params = Parameters {
        thin: 0,
        ..Parameters::default()
    };
    let data = Arc::new(GenotypingData::new(vec![vec![vec![1, 0]]], vec![vec![false]]).unwrap());
    let lookup = Arc::new(Lookup::new(params.max_coi).unwrap());
    assert!(matches!(
        Mcmc::new(data, lookup, &params),
        Err(McmcError::InvalidParameter { name: "thin", .. })
    ));
}
