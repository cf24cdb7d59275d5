//! Bayesian MCMC estimation of complexity of infection (COI), population
//! allele frequencies and genotyping error rates from multi-allelic
//! presence/absence calls.

pub mod chain;
pub mod error;
pub mod genotyping_data;
pub mod lookup;
pub mod mcmc;
pub mod parameters;
pub mod sampler;

pub use chain::{Chain, MoveKind};
pub use error::McmcError;
pub use genotyping_data::GenotypingData;
pub use lookup::Lookup;
pub use mcmc::{ChainPhase, ChainTrace, Mcmc};
pub use parameters::{AlleleFreqKernel, CoiDeltaKernel, Parameters};
pub use sampler::{Sampler, VariateSource};
