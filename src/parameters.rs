use crate::error::McmcError;

/// How the COI move draws its step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoiDeltaKernel {
    /// `+1` or `-1` with equal probability.
    Unit,
    /// `±Geometric(1 / (1 + coi_prop_mean))`.
    Geometric,
}

/// How the allele-frequency move proposes a new simplex.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlleleFreqKernel {
    /// Dirichlet centred on the current frequencies with concentration `allele_freq_alpha`.
    Dirichlet,
    /// Gaussian random walk on additive log-ratios with variance `allele_freq_var`.
    LogitNormal,
}

/// Run configuration: chain layout, proposal tuning and prior hyperparameters.
#[derive(Clone, Debug)]
pub struct Parameters {
    pub chains: usize,
    pub burnin: usize,
    pub samples: usize,
    /// Record a parameter snapshot every `thin` sampling iterations.
    pub thin: usize,
    pub max_coi: usize,
    /// Base seed. Chains use distinct streams of the same seed.
    pub seed: Option<u64>,
    pub verbose: bool,

    pub coi_delta_kernel: CoiDeltaKernel,
    pub coi_prop_mean: f64,

    pub allele_freq_kernel: AlleleFreqKernel,
    pub allele_freq_alpha: f64,
    pub allele_freq_var: f64,
    /// Symmetric Dirichlet prior concentration on every locus.
    pub allele_freq_concentration: f64,

    pub eps_pos_0: f64,
    pub eps_neg_0: f64,
    pub eps_pos_var: f64,
    pub eps_neg_var: f64,
    pub max_eps_pos: f64,
    pub max_eps_neg: f64,
    pub eps_pos_alpha: f64,
    pub eps_pos_beta: f64,
    pub eps_neg_alpha: f64,
    pub eps_neg_beta: f64,

    pub mean_coi_shape: f64,
    pub mean_coi_rate: f64,
    pub mean_coi_var: f64,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            chains: 1,
            burnin: 1000,
            samples: 1000,
            thin: 1,
            max_coi: 25,
            seed: None,
            verbose: false,
            coi_delta_kernel: CoiDeltaKernel::Unit,
            coi_prop_mean: 1.0,
            allele_freq_kernel: AlleleFreqKernel::Dirichlet,
            allele_freq_alpha: 1000.0,
            allele_freq_var: 0.1,
            allele_freq_concentration: 1.0,
            eps_pos_0: 0.01,
            eps_neg_0: 0.1,
            eps_pos_var: 0.01,
            eps_neg_var: 0.01,
            max_eps_pos: 0.2,
            max_eps_neg: 0.2,
            eps_pos_alpha: 1.0,
            eps_pos_beta: 1.0,
            eps_neg_alpha: 1.0,
            eps_neg_beta: 1.0,
            mean_coi_shape: 0.25,
            mean_coi_rate: 0.25,
            mean_coi_var: 0.5,
        }
    }
}

fn positive(name: &'static str, value: f64) -> Result<(), McmcError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(McmcError::InvalidParameter {
            name,
            reason: format!("must be a finite positive number, got {}", value),
        })
    }
}

impl Parameters {
    pub fn validate(&self) -> Result<(), McmcError> {
        if self.chains == 0 {
            return Err(McmcError::InvalidParameter {
                name: "chains",
                reason: "at least one chain is required".to_string(),
            });
        }
        if self.thin == 0 {
            return Err(McmcError::InvalidParameter {
                name: "thin",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_coi == 0 {
            return Err(McmcError::InvalidMaxCoi(self.max_coi));
        }

        positive("coi_prop_mean", self.coi_prop_mean)?;
        positive("allele_freq_alpha", self.allele_freq_alpha)?;
        positive("allele_freq_var", self.allele_freq_var)?;
        positive("allele_freq_concentration", self.allele_freq_concentration)?;
        positive("eps_pos_var", self.eps_pos_var)?;
        positive("eps_neg_var", self.eps_neg_var)?;
        positive("eps_pos_alpha", self.eps_pos_alpha)?;
        positive("eps_pos_beta", self.eps_pos_beta)?;
        positive("eps_neg_alpha", self.eps_neg_alpha)?;
        positive("eps_neg_beta", self.eps_neg_beta)?;
        positive("mean_coi_shape", self.mean_coi_shape)?;
        positive("mean_coi_rate", self.mean_coi_rate)?;
        positive("mean_coi_var", self.mean_coi_var)?;

        for (name, max) in [("max_eps_pos", self.max_eps_pos), ("max_eps_neg", self.max_eps_neg)] {
            if !(max > 0.0 && max <= 1.0) {
                return Err(McmcError::InvalidParameter {
                    name,
                    reason: format!("must lie in (0, 1], got {}", max),
                });
            }
        }
        for (name, start, max) in [
            ("eps_pos_0", self.eps_pos_0, self.max_eps_pos),
            ("eps_neg_0", self.eps_neg_0, self.max_eps_neg),
        ] {
            if !(start > 0.0 && start < max) {
                return Err(McmcError::InvalidParameter {
                    name,
                    reason: format!("must lie in (0, {}), got {}", max, start),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(Parameters::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        let params = Parameters {
            chains: 0,
            ..Parameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(McmcError::InvalidParameter { name: "chains", .. })
        ));

        let params = Parameters {
            max_coi: 0,
            ..Parameters::default()
        };
        assert_eq!(params.validate(), Err(McmcError::InvalidMaxCoi(0)));

        let params = Parameters {
            eps_neg_0: 0.5,
            max_eps_neg: 0.2,
            ..Parameters::default()
        };
        assert!(matches!(
            params.validate(),
            Err(McmcError::InvalidParameter { name: "eps_neg_0", .. })
        ));

        let params = Parameters {
            allele_freq_var: f64::NAN,
            ..Parameters::default()
        };
        assert!(params.validate().is_err());
    }
}
