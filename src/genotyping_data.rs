use crate::error::McmcError;
use log::{debug, info};
use ndarray::{Array2, ArrayView1};

/// Observed allele presence/absence calls for every (locus, sample, allele).
///
/// Built once from the nested input tensor and then shared read-only (behind
/// an `Arc`) by the engine and every chain.
#[derive(Debug, Clone)]
pub struct GenotypingData {
    /// One `num_samples x num_alleles[locus]` matrix of 0/1 flags per locus.
    observed_alleles: Vec<Array2<u8>>,
    /// `num_loci x num_samples`.
    is_missing: Array2<bool>,
    num_alleles: Vec<usize>,
    /// Largest number of alleles called at any locus, per sample.
    observed_coi: Vec<usize>,
    max_alleles: usize,
    num_samples: usize,
}

impl GenotypingData {
    /// Validates and packs `observed[locus][sample][allele]` and
    /// `is_missing[locus][sample]`.
    pub fn new(observed: Vec<Vec<Vec<u8>>>, is_missing: Vec<Vec<bool>>) -> Result<Self, McmcError> {
        let num_loci = observed.len();
        if num_loci == 0 || observed[0].is_empty() {
            return Err(McmcError::EmptyDataset);
        }
        let num_samples = observed[0].len();

        if is_missing.len() != num_loci || is_missing.iter().any(|row| row.len() != num_samples) {
            return Err(McmcError::MissingnessShape {
                expected_loci: num_loci,
                expected_samples: num_samples,
                found_loci: is_missing.len(),
                found_samples: is_missing.first().map_or(0, |row| row.len()),
            });
        }

        let mut observed_alleles = Vec::with_capacity(num_loci);
        let mut num_alleles = Vec::with_capacity(num_loci);
        let mut observed_coi = vec![0usize; num_samples];

        for (locus, locus_calls) in observed.iter().enumerate() {
            if locus_calls.len() != num_samples {
                return Err(McmcError::InconsistentSampleCount {
                    locus,
                    expected: num_samples,
                    found: locus_calls.len(),
                });
            }
            let allele_count = locus_calls[0].len();
            if allele_count == 0 {
                return Err(McmcError::NoAlleles { locus });
            }

            let mut matrix = Array2::<u8>::zeros((num_samples, allele_count));
            for (sample, calls) in locus_calls.iter().enumerate() {
                if calls.len() != allele_count {
                    return Err(McmcError::InconsistentAlleleCount {
                        locus,
                        sample,
                        expected: allele_count,
                        found: calls.len(),
                    });
                }
                let mut total_alleles = 0usize;
                for (allele, &value) in calls.iter().enumerate() {
                    if value > 1 {
                        return Err(McmcError::InvalidValue {
                            locus,
                            sample,
                            allele,
                            value,
                        });
                    }
                    matrix[[sample, allele]] = value;
                    total_alleles += value as usize;
                }
                if total_alleles > observed_coi[sample] {
                    observed_coi[sample] = total_alleles;
                }
            }

            observed_alleles.push(matrix);
            num_alleles.push(allele_count);
        }

        let max_alleles = num_alleles.iter().copied().max().unwrap_or(0);
        let mut missing_mask = Array2::from_elem((num_loci, num_samples), false);
        for (locus, row) in is_missing.iter().enumerate() {
            for (sample, &missing) in row.iter().enumerate() {
                missing_mask[[locus, sample]] = missing;
            }
        }

        info!(
            "Loaded genotyping data: {} loci, {} samples, up to {} alleles per locus.",
            num_loci, num_samples, max_alleles
        );
        debug!(
            "Observed COI lower bounds (first 10 samples): {:?}",
            observed_coi.iter().take(10).collect::<Vec<_>>()
        );

        Ok(Self {
            observed_alleles,
            is_missing: missing_mask,
            num_alleles,
            observed_coi,
            max_alleles,
            num_samples,
        })
    }

    pub fn get_observed_alleles(&self, locus: usize, sample: usize) -> ArrayView1<'_, u8> {
        self.observed_alleles[locus].row(sample)
    }

    #[inline]
    pub fn is_missing(&self, locus: usize, sample: usize) -> bool {
        self.is_missing[[locus, sample]]
    }

    pub fn num_loci(&self) -> usize {
        self.observed_alleles.len()
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn num_alleles(&self, locus: usize) -> usize {
        self.num_alleles[locus]
    }

    pub fn observed_coi(&self, sample: usize) -> usize {
        self.observed_coi[sample]
    }

    pub fn max_alleles(&self) -> usize {
        self.max_alleles
    }

    /// Indices of alleles called present at a locus for one sample.
    pub fn observed_allele_indices(&self, locus: usize, sample: usize) -> Vec<usize> {
        self.get_observed_alleles(locus, sample)
            .iter()
            .enumerate()
            .filter_map(|(allele, &flag)| (flag == 1).then_some(allele))
            .collect()
    }

    /// Per-allele count of non-missing samples calling that allele present.
    pub fn allele_counts(&self, locus: usize) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_alleles[locus]];
        for sample in 0..self.num_samples {
            if self.is_missing(locus, sample) {
                continue;
            }
            for (allele, &flag) in self.get_observed_alleles(locus, sample).iter().enumerate() {
                counts[allele] += flag as usize;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_tensor() -> (Vec<Vec<Vec<u8>>>, Vec<Vec<bool>>) {
        let observed = vec![
            vec![vec![1, 0, 1], vec![0, 1, 0], vec![0, 0, 0]],
            vec![vec![1, 1], vec![1, 0], vec![0, 1]],
        ];
        let missing = vec![vec![false, false, true], vec![false, false, false]];
        (observed, missing)
    }

    #[test]
    fn round_trip_returns_input_vectors() {
        let (observed, missing) = toy_tensor();
        let data = GenotypingData::new(observed.clone(), missing.clone()).unwrap();
        for (locus, locus_calls) in observed.iter().enumerate() {
            for (sample, calls) in locus_calls.iter().enumerate() {
                assert_eq!(&data.get_observed_alleles(locus, sample).to_vec(), calls);
                assert_eq!(data.is_missing(locus, sample), missing[locus][sample]);
            }
        }
    }

    #[test]
    fn derived_quantities() {
        let (observed, missing) = toy_tensor();
        let data = GenotypingData::new(observed, missing).unwrap();
        assert_eq!(data.num_loci(), 2);
        assert_eq!(data.num_samples(), 3);
        assert_eq!(data.num_alleles(0), 3);
        assert_eq!(data.num_alleles(1), 2);
        assert_eq!(data.max_alleles(), 3);
        assert_eq!(data.observed_coi(0), 2);
        assert_eq!(data.observed_coi(1), 1);
        assert_eq!(data.observed_coi(2), 1);
        assert_eq!(data.observed_allele_indices(0, 0), vec![0, 2]);
        assert_eq!(data.allele_counts(0), vec![1, 1, 1]);
        assert_eq!(data.allele_counts(1), vec![2, 2]);
    }

    #[test]
    fn observed_coi_is_positive_whenever_a_call_exists() {
        let (observed, missing) = toy_tensor();
        let data = GenotypingData::new(observed.clone(), missing).unwrap();
        for sample in 0..data.num_samples() {
            if observed.iter().any(|locus_calls| locus_calls[sample].contains(&1)) {
                assert!(data.observed_coi(sample) >= 1);
            }
        }
    }

    #[test]
    fn observed_coi_counts_calls_in_missing_cells() {
        let data = GenotypingData::new(vec![vec![vec![1, 1]]], vec![vec![true]]).unwrap();
        assert_eq!(data.observed_coi(0), 2);

        let observed = vec![vec![vec![1, 1, 1]], vec![vec![1, 0]]];
        let missing = vec![vec![true], vec![false]];
        let data = GenotypingData::new(observed, missing).unwrap();
        assert_eq!(data.observed_coi(0), 3);
    }

    #[test]
    fn rejects_ragged_allele_counts() {
        let observed = vec![vec![vec![1, 0], vec![1, 0, 0]]];
        let missing = vec![vec![false, false]];
        assert_eq!(
            GenotypingData::new(observed, missing).unwrap_err(),
            McmcError::InconsistentAlleleCount {
                locus: 0,
                sample: 1,
                expected: 2,
                found: 3
            }
        );
    }

    #[test]
    fn rejects_empty_and_malformed_input() {
        assert_eq!(
            GenotypingData::new(Vec::new(), Vec::new()).unwrap_err(),
            McmcError::EmptyDataset
        );
        let bad_flag = GenotypingData::new(vec![vec![vec![2, 0]]], vec![vec![false]]);
        assert!(matches!(bad_flag, Err(McmcError::InvalidValue { value: 2, .. })));
        let bad_mask = GenotypingData::new(vec![vec![vec![1, 0]]], vec![vec![false, true]]);
        assert!(matches!(bad_mask, Err(McmcError::MissingnessShape { .. })));
        let no_alleles = GenotypingData::new(vec![vec![vec![]]], vec![vec![false]]);
        assert_eq!(no_alleles.unwrap_err(), McmcError::NoAlleles { locus: 0 });
    }
}
