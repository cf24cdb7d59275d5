use thiserror::Error;

/// Setup-time failures. Anything that goes wrong inside a Metropolis-Hastings
/// step is a rejection, not an error, so nothing here is raised mid-chain
/// except `NonFiniteLikelihood`, which indicates a programming error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum McmcError {
    #[error("Genotyping data is empty: at least one locus and one sample are required.")]
    EmptyDataset,

    #[error("Locus {locus} has no alleles.")]
    NoAlleles { locus: usize },

    #[error(
        "Inconsistent allele count at locus {locus}, sample {sample}: expected {expected}, found {found}."
    )]
    InconsistentAlleleCount {
        locus: usize,
        sample: usize,
        expected: usize,
        found: usize,
    },

    #[error("Locus {locus} has {found} samples, but locus 0 has {expected}.")]
    InconsistentSampleCount {
        locus: usize,
        expected: usize,
        found: usize,
    },

    #[error(
        "Missingness mask has shape {found_loci}x{found_samples}, expected {expected_loci}x{expected_samples}."
    )]
    MissingnessShape {
        expected_loci: usize,
        expected_samples: usize,
        found_loci: usize,
        found_samples: usize,
    },

    #[error(
        "Invalid presence flag {value} at locus {locus}, sample {sample}, allele {allele}: must be 0 or 1."
    )]
    InvalidValue {
        locus: usize,
        sample: usize,
        allele: usize,
        value: u8,
    },

    #[error("Maximum COI must be at least 1, but was {0}.")]
    InvalidMaxCoi(usize),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("The chains have already completed; construct a new engine to rerun.")]
    ChainComplete,

    #[error("Cannot run {requested} while the chains are {current}.")]
    PhaseOrder {
        requested: &'static str,
        current: &'static str,
    },

    #[error("Chain {chain} reached a non-finite log-likelihood.")]
    NonFiniteLikelihood { chain: usize },
}
