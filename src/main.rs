// main.rs

// --- External Crate Imports ---
use anyhow::{anyhow, Error, Result};
use clap::Parser;
use coi_mcmc::{ChainTrace, GenotypingData, Lookup, Mcmc};
use log::{error, info, warn};
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::Arc,
    time::Instant,
};

// --- Main Function ---
fn main() -> Result<(), Error> {
    let total_time_start = Instant::now();
    let cli_args = cli::CliArgs::parse();

    // Initialize logger
    let log_level = cli_args
        .log_level
        .parse::<log::LevelFilter>()
        .unwrap_or_else(|_| {
            eprintln!(
                "Warning: Invalid log level '{}' provided. Defaulting to Info.",
                cli_args.log_level
            );
            log::LevelFilter::Info
        });
    env_logger::Builder::new()
        .filter_level(log_level)
        .format_timestamp_micros()
        .init();

    info!(
        "Starting coi_mcmc ({} build) with args: {:?}",
        env!("COI_MCMC_BUILD_PROFILE"),
        cli_args
    );
    if env!("COI_MCMC_BUILD_PROFILE") != "release" {
        warn!("Unoptimized build: sampling will be considerably slower than a release build.");
    }

    // Configure Rayon thread pool
    let num_threads = cli_args.threads.unwrap_or_else(num_cpus::get);
    info!("Using {} threads for parallel chains.", num_threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build_global()?;

    // --- 1. Read calls ---
    info!("Reading allele calls from {}", cli_args.input.display());
    let mut table = input_reader::read_calls(&cli_args.input)?;
    info!(
        "Read {} loci and {} samples ({} missing locus/sample cells).",
        table.locus_names.len(),
        table.sample_names.len(),
        table
            .is_missing
            .iter()
            .map(|row| row.iter().filter(|&&m| m).count())
            .sum::<usize>()
    );

    let data = Arc::new(GenotypingData::new(
        std::mem::take(&mut table.observed),
        std::mem::take(&mut table.is_missing),
    )?);

    // --- 2. Run chains ---
    let params = cli_args.to_parameters();
    let lookup = Arc::new(Lookup::new(params.max_coi)?);
    let mut mcmc = Mcmc::new(data, lookup, &params)?;
    info!("Chains seeded with {}.", mcmc.seed());

    let mcmc_start = Instant::now();
    if let Err(e) = mcmc.run() {
        error!("MCMC run failed: {}", e);
        return Err(anyhow!("MCMC run failed: {}", e));
    }
    info!("MCMC finished in {:.2?}.", mcmc_start.elapsed());
    let traces = mcmc.into_traces();

    // --- 3. Write Outputs ---
    let output_prefix_path = PathBuf::from(&cli_args.output_prefix);
    if let Some(parent) = output_prefix_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                anyhow!("Failed to create output directory {}: {}", parent.display(), e)
            })?;
            info!("Created output directory: {}", parent.display());
        }
    }
    info!(
        "Writing results to files with prefix '{}'...",
        cli_args.output_prefix
    );

    output_writer::write_llik(&cli_args.output_prefix, &traces, params.thin)?;
    output_writer::write_coi(
        &cli_args.output_prefix,
        &table.sample_names,
        &traces,
        params.thin,
    )?;
    output_writer::write_allele_frequencies(
        &cli_args.output_prefix,
        &table.locus_names,
        &table.allele_labels,
        &traces,
        params.thin,
    )?;
    output_writer::write_error_rates(&cli_args.output_prefix, &traces, params.thin)?;
    output_writer::write_summary(&cli_args.output_prefix, &table.sample_names, &traces)?;

    info!(
        "coi_mcmc finished successfully in {:.2?}.",
        total_time_start.elapsed()
    );
    Ok(())
}

// --- Module Implementations ---

mod cli {
    use clap::{Parser, ValueEnum};
    use coi_mcmc::{AlleleFreqKernel, CoiDeltaKernel, Parameters};
    use std::path::PathBuf;

    #[derive(ValueEnum, Clone, Copy, Debug)]
    pub(crate) enum CoiKernelArg {
        Unit,
        Geometric,
    }

    impl From<CoiKernelArg> for CoiDeltaKernel {
        fn from(arg: CoiKernelArg) -> Self {
            match arg {
                CoiKernelArg::Unit => CoiDeltaKernel::Unit,
                CoiKernelArg::Geometric => CoiDeltaKernel::Geometric,
            }
        }
    }

    #[derive(ValueEnum, Clone, Copy, Debug)]
    pub(crate) enum AlleleFreqKernelArg {
        Dirichlet,
        LogitNormal,
    }

    impl From<AlleleFreqKernelArg> for AlleleFreqKernel {
        fn from(arg: AlleleFreqKernelArg) -> Self {
            match arg {
                AlleleFreqKernelArg::Dirichlet => AlleleFreqKernel::Dirichlet,
                AlleleFreqKernelArg::LogitNormal => AlleleFreqKernel::LogitNormal,
            }
        }
    }

    #[derive(Parser, Debug)]
    #[command(author, version, about = "Bayesian estimation of complexity of infection from multi-allelic calls.", long_about = None, propagate_version = true)]
    pub(crate) struct CliArgs {
        /// Long-format TSV with a `sample_id  locus  allele` header.
        #[arg(short, long, required = true)]
        pub(crate) input: PathBuf,

        #[arg(short, long = "out", required = true)]
        pub(crate) output_prefix: String,

        #[arg(long, default_value_t = 1)]
        pub(crate) chains: usize,

        #[arg(long, default_value_t = 1000)]
        pub(crate) burnin: usize,

        #[arg(long, default_value_t = 1000)]
        pub(crate) samples: usize,

        #[arg(long, default_value_t = 1)]
        pub(crate) thin: usize,

        #[arg(long, default_value_t = 25)]
        pub(crate) max_coi: usize,

        #[arg(long)]
        pub(crate) seed: Option<u64>,

        #[arg(short = 't', long)]
        pub(crate) threads: Option<usize>,

        #[arg(long, default_value = "Info")]
        pub(crate) log_level: String,

        /// Hide progress bars.
        #[arg(short, long)]
        pub(crate) quiet: bool,

        #[arg(long = "coi-kernel", value_enum, default_value_t = CoiKernelArg::Unit)]
        pub(crate) coi_kernel: CoiKernelArg,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) coi_prop_mean: f64,

        #[arg(long, value_enum, default_value_t = AlleleFreqKernelArg::Dirichlet)]
        pub(crate) allele_freq_kernel: AlleleFreqKernelArg,

        #[arg(long, default_value_t = 1000.0)]
        pub(crate) allele_freq_alpha: f64,

        #[arg(long, default_value_t = 0.1)]
        pub(crate) allele_freq_var: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) allele_freq_concentration: f64,

        #[arg(long, default_value_t = 0.01)]
        pub(crate) eps_pos_0: f64,

        #[arg(long, default_value_t = 0.1)]
        pub(crate) eps_neg_0: f64,

        #[arg(long, default_value_t = 0.01)]
        pub(crate) eps_pos_var: f64,

        #[arg(long, default_value_t = 0.01)]
        pub(crate) eps_neg_var: f64,

        #[arg(long, default_value_t = 0.2)]
        pub(crate) max_eps_pos: f64,

        #[arg(long, default_value_t = 0.2)]
        pub(crate) max_eps_neg: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) eps_pos_alpha: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) eps_pos_beta: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) eps_neg_alpha: f64,

        #[arg(long, default_value_t = 1.0)]
        pub(crate) eps_neg_beta: f64,

        #[arg(long, default_value_t = 0.25)]
        pub(crate) mean_coi_shape: f64,

        #[arg(long, default_value_t = 0.25)]
        pub(crate) mean_coi_rate: f64,

        #[arg(long, default_value_t = 0.5)]
        pub(crate) mean_coi_var: f64,
    }

    impl CliArgs {
        pub(crate) fn to_parameters(&self) -> Parameters {
            Parameters {
                chains: self.chains,
                burnin: self.burnin,
                samples: self.samples,
                thin: self.thin,
                max_coi: self.max_coi,
                seed: self.seed,
                verbose: !self.quiet,
                coi_delta_kernel: self.coi_kernel.into(),
                coi_prop_mean: self.coi_prop_mean,
                allele_freq_kernel: self.allele_freq_kernel.into(),
                allele_freq_alpha: self.allele_freq_alpha,
                allele_freq_var: self.allele_freq_var,
                allele_freq_concentration: self.allele_freq_concentration,
                eps_pos_0: self.eps_pos_0,
                eps_neg_0: self.eps_neg_0,
                eps_pos_var: self.eps_pos_var,
                eps_neg_var: self.eps_neg_var,
                max_eps_pos: self.max_eps_pos,
                max_eps_neg: self.max_eps_neg,
                eps_pos_alpha: self.eps_pos_alpha,
                eps_pos_beta: self.eps_pos_beta,
                eps_neg_alpha: self.eps_neg_alpha,
                eps_neg_beta: self.eps_neg_beta,
                mean_coi_shape: self.mean_coi_shape,
                mean_coi_rate: self.mean_coi_rate,
                mean_coi_var: self.mean_coi_var,
            }
        }
    }
}

mod input_reader {
    use super::{anyhow, File, Result};
    use log::trace;
    use serde::Deserialize;
    use std::collections::{BTreeSet, HashMap};
    use std::io::Read;
    use std::path::Path;

    /// One observed allele.
    #[derive(Debug, Deserialize)]
    struct CallRow {
        sample_id: String,
        locus: String,
        allele: String,
    }

    /// Dense presence/absence tensor plus the labels needed to write results.
    #[derive(Debug)]
    pub(crate) struct CallTable {
        pub(crate) sample_names: Vec<String>,
        pub(crate) locus_names: Vec<String>,
        /// Sorted allele labels per locus.
        pub(crate) allele_labels: Vec<Vec<String>>,
        /// `[locus][sample][allele]`
        pub(crate) observed: Vec<Vec<Vec<u8>>>,
        /// `[locus][sample]`, set where a sample has no calls at a locus.
        pub(crate) is_missing: Vec<Vec<bool>>,
    }

    pub(crate) fn read_calls(path: &Path) -> Result<CallTable> {
        let file = File::open(path)
            .map_err(|e| anyhow!("Failed to open input file {}: {}", path.display(), e))?;
        parse_calls(file, &path.display().to_string())
    }

    fn index_of(names: &mut Vec<String>, index: &mut HashMap<String, usize>, name: &str) -> usize {
        if let Some(&i) = index.get(name) {
            return i;
        }
        let i = names.len();
        names.push(name.to_string());
        index.insert(name.to_string(), i);
        i
    }

    pub(crate) fn parse_calls<R: Read>(reader: R, source: &str) -> Result<CallTable> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut sample_names = Vec::new();
        let mut sample_index = HashMap::new();
        let mut locus_names = Vec::new();
        let mut locus_index = HashMap::new();
        // (locus, sample, allele label) triples in file order.
        let mut calls: Vec<(usize, usize, String)> = Vec::new();

        for result in csv_reader.deserialize::<CallRow>() {
            let row = result.map_err(|e| anyhow!("{}: {}", source, e))?;
            if row.sample_id.is_empty() || row.locus.is_empty() || row.allele.is_empty() {
                return Err(anyhow!("{}: empty field in row {:?}.", source, row));
            }
            trace!("{:?}", row);
            let sample = index_of(&mut sample_names, &mut sample_index, &row.sample_id);
            let locus = index_of(&mut locus_names, &mut locus_index, &row.locus);
            calls.push((locus, sample, row.allele));
        }

        if calls.is_empty() {
            return Err(anyhow!("{}: no allele calls found.", source));
        }

        let mut label_sets: Vec<BTreeSet<String>> = vec![BTreeSet::new(); locus_names.len()];
        for (locus, _, label) in &calls {
            label_sets[*locus].insert(label.clone());
        }
        let allele_labels: Vec<Vec<String>> = label_sets
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();

        let num_samples = sample_names.len();
        let mut observed: Vec<Vec<Vec<u8>>> = allele_labels
            .iter()
            .map(|labels| vec![vec![0u8; labels.len()]; num_samples])
            .collect();
        let mut is_missing = vec![vec![true; num_samples]; locus_names.len()];

        for (locus, sample, label) in &calls {
            // Labels are sorted and were built from these same calls.
            if let Ok(allele) = allele_labels[*locus].binary_search(label) {
                observed[*locus][*sample][allele] = 1;
                is_missing[*locus][*sample] = false;
            }
        }

        Ok(CallTable {
            sample_names,
            locus_names,
            allele_labels,
            observed,
            is_missing,
        })
    }

}

mod output_writer {
    use super::{anyhow, info, BufWriter, ChainTrace, File, Result, Write};

    fn create_output_file(prefix: &str, suffix: &str) -> Result<BufWriter<File>> {
        let filename = format!("{}.{}", prefix, suffix);
        File::create(&filename)
            .map(BufWriter::new)
            .map_err(|e| anyhow!("Failed to create output file {}: {}", filename, e))
    }

    /// Sampling iteration (1-based) at which record `k` was taken.
    fn sample_iteration(record: usize, thin: usize) -> usize {
        (record + 1) * thin
    }

    pub(crate) fn write_llik(output_prefix: &str, traces: &[ChainTrace], thin: usize) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "llik.tsv")?;
        info!("Writing log-likelihood traces to {}.llik.tsv", output_prefix);

        writeln!(writer, "chain\tphase\titeration\tllik")?;
        for (chain, trace) in traces.iter().enumerate() {
            for (i, llik) in trace.llik_burnin.iter().enumerate() {
                writeln!(writer, "{}\tburnin\t{}\t{:.6}", chain, i + 1, llik)?;
            }
            for (k, llik) in trace.llik_sample.iter().enumerate() {
                writeln!(writer, "{}\tsampling\t{}\t{:.6}", chain, sample_iteration(k, thin), llik)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_coi(
        output_prefix: &str,
        sample_names: &[String],
        traces: &[ChainTrace],
        thin: usize,
    ) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "coi.tsv")?;
        info!("Writing COI traces to {}.coi.tsv", output_prefix);

        write!(writer, "chain\titeration")?;
        for name in sample_names {
            write!(writer, "\t{}", name)?;
        }
        writeln!(writer)?;

        for (chain, trace) in traces.iter().enumerate() {
            for (k, record) in trace.coi.iter().enumerate() {
                write!(writer, "{}\t{}", chain, sample_iteration(k, thin))?;
                for coi in record {
                    write!(writer, "\t{}", coi)?;
                }
                writeln!(writer)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_allele_frequencies(
        output_prefix: &str,
        locus_names: &[String],
        allele_labels: &[Vec<String>],
        traces: &[ChainTrace],
        thin: usize,
    ) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "allele_freqs.tsv")?;
        info!("Writing allele frequency traces to {}.allele_freqs.tsv", output_prefix);

        writeln!(writer, "chain\titeration\tlocus\tallele\tfrequency")?;
        for (chain, trace) in traces.iter().enumerate() {
            for (k, record) in trace.allele_frequencies.iter().enumerate() {
                let iteration = sample_iteration(k, thin);
                for ((locus, labels), freqs) in locus_names.iter().zip(allele_labels).zip(record) {
                    for (label, p) in labels.iter().zip(freqs) {
                        writeln!(writer, "{}\t{}\t{}\t{}\t{:.6e}", chain, iteration, locus, label, p)?;
                    }
                }
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub(crate) fn write_error_rates(output_prefix: &str, traces: &[ChainTrace], thin: usize) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "eps.tsv")?;
        info!("Writing error rate and mean COI traces to {}.eps.tsv", output_prefix);

        writeln!(writer, "chain\titeration\teps_pos\teps_neg\tmean_coi")?;
        for (chain, trace) in traces.iter().enumerate() {
            for k in 0..trace.num_records() {
                writeln!(
                    writer,
                    "{}\t{}\t{:.6}\t{:.6}\t{:.6}",
                    chain,
                    sample_iteration(k, thin),
                    trace.eps_pos[k],
                    trace.eps_neg[k],
                    trace.mean_coi[k]
                )?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// Posterior mean COI per sample, pooled over every chain's records.
    pub(crate) fn write_summary(
        output_prefix: &str,
        sample_names: &[String],
        traces: &[ChainTrace],
    ) -> Result<()> {
        let mut writer = create_output_file(output_prefix, "summary.tsv")?;
        info!("Writing posterior summary to {}.summary.tsv", output_prefix);

        let total_records: usize = traces.iter().map(ChainTrace::num_records).sum();
        let mut pooled = vec![0.0; sample_names.len()];
        for trace in traces {
            let weight = trace.num_records() as f64;
            for (acc, mean) in pooled.iter_mut().zip(trace.posterior_mean_coi()) {
                *acc += mean * weight;
            }
        }

        writeln!(writer, "sample_id\tposterior_mean_coi")?;
        for (name, acc) in sample_names.iter().zip(&pooled) {
            if total_records == 0 {
                writeln!(writer, "{}\tNA", name)?;
            } else {
                writeln!(writer, "{}\t{:.4}", name, acc / total_records as f64)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
