use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use crate::{input::LogLevel, output::AnalysisOptions};

#[derive(Debug, Parser)]
#[clap(version, about = "Runs and analyses consensus protocol benchmark suites")]
pub struct Options {
    /// Filter logs using this string, rather than the `RUST_LOG` environment variable.
    #[clap(long, global = true)]
    pub log_filter: Option<String>,

    /// Disable colour in log output.
    #[clap(long, global = true)]
    pub no_colour: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the Unanimous BPaxos scale suite against locally spawned processes.
    Run(RunOptions),
    /// Recompute the outputs of a finished suite.
    Reanalyse(ReanalyseOptions),
    /// Export the latency and throughput series of one trial.
    Series(SeriesOptions),
    /// Mean and standard deviation of every metric in a results table, per group.
    Bands(BandsOptions),
}

#[derive(Debug, Args)]
pub struct RunOptions {
    /// Directory the suite directory is created in.
    #[clap(long, default_value = "/tmp")]
    pub suite_directory: PathBuf,

    /// JSON file describing the protocol binaries and ports.
    #[clap(long)]
    pub cluster: PathBuf,

    /// Run every role under the configured profiler.
    #[clap(long)]
    pub profile: bool,

    /// Scrape the roles' Prometheus metrics during each trial.
    #[clap(long)]
    pub monitor: bool,

    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Times the whole grid of inputs is run.
    #[clap(long, default_value = "3")]
    pub repeats: u32,

    /// Trials to run at once.
    #[clap(long, default_value = "1")]
    pub parallelism: usize,

    /// Extra attempts for a failed trial.
    #[clap(long, default_value = "0")]
    pub retries: u32,

    #[clap(flatten)]
    pub analysis: AnalysisArgs,
}

#[derive(Debug, Args)]
pub struct ReanalyseOptions {
    /// A suite directory written by `run`.
    pub suite: PathBuf,

    #[clap(flatten)]
    pub analysis: AnalysisArgs,
}

#[derive(Debug, Args)]
pub struct SeriesOptions {
    /// A trial's `data.csv`.
    pub data: PathBuf,

    /// The trial's `prometheus_data.csv`.
    #[clap(long)]
    pub prometheus_data: Option<PathBuf>,

    #[clap(flatten)]
    pub analysis: AnalysisArgs,

    #[clap(long, short, default_value = ".")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct BandsOptions {
    /// A `results.csv` written by `run` or `reanalyse`.
    pub results: PathBuf,

    /// Column to group rows by. `num_clients` is derived when missing.
    #[clap(long, default_value = "num_clients")]
    pub group_by: String,

    #[clap(long, short, default_value = "bands.csv")]
    pub output: PathBuf,
}

#[derive(Debug, Args)]
pub struct AnalysisArgs {
    /// Ignore samples in the first this many seconds of a trial.
    #[clap(long, short, default_value = "0")]
    pub drop: f64,

    /// Ignore latencies more than this many standard deviations from the mean.
    #[clap(long, short = 's', default_value = "1e20")]
    pub stds: f64,

    /// Scraped counter of completed requests.
    #[clap(long, default_value = "requests_total")]
    pub request_counter: String,
}

impl AnalysisArgs {
    pub fn to_options(&self) -> anyhow::Result<AnalysisOptions> {
        Ok(AnalysisOptions {
            drop: Duration::try_from_secs_f64(self.drop)
                .with_context(|| format!("Invalid drop of {} seconds", self.drop))?,
            outlier_stds: self.stds,
            request_counter: self.request_counter.clone(),
        })
    }
}
