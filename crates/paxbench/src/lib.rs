mod address;
pub mod analyse;
pub mod directory;
pub mod error;
pub mod input;
pub mod local;
mod options;
pub mod output;
pub mod provision;
pub mod scrape;
pub mod suite;
pub mod suites;
pub mod trial;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

pub use address::{Address, Error as AddressError, Scheme};
pub use options::{
    AnalysisArgs, BandsOptions, Command, Options, ReanalyseOptions, RunOptions, SeriesOptions,
};

use crate::{
    directory::SuiteDirectory,
    local::{read_cluster_config, LocalProvisioner},
    suite::{Suite, SuiteOptions},
    suites::{scale_columns, scale_summary, unanimous_bpaxos_scale, ScaleArgs},
};

pub async fn run(options: Options) -> anyhow::Result<()> {
    match options.command {
        Command::Run(run) => run_scale(run).await,
        Command::Reanalyse(reanalyse) => {
            let analysis = reanalyse.analysis.to_options()?;
            let rows = analyse::reanalyse(
                &reanalyse.suite,
                &analysis,
                &scale_columns(),
                scale_summary,
            )?;
            info!(trials = rows.len(), suite = ?reanalyse.suite, "Reanalysed suite");
            Ok(())
        }
        Command::Series(series) => {
            let analysis = series.analysis.to_options()?;
            let (latency, throughput) = analyse::series(
                &series.data,
                series.prometheus_data.as_deref(),
                &analysis,
                &series.output,
            )?;
            info!(?latency, ?throughput, "Wrote series");
            Ok(())
        }
        Command::Bands(bands) => {
            analyse::bands(&bands.results, &bands.group_by, &bands.output)?;
            Ok(())
        }
    }
}

async fn run_scale(options: RunOptions) -> anyhow::Result<()> {
    let config = read_cluster_config(&options.cluster).context("Failed to load cluster config")?;
    let provisioner = LocalProvisioner::new(config);

    let definition = unanimous_bpaxos_scale(ScaleArgs {
        profile: options.profile,
        monitor: options.monitor,
        log_level: options.log_level,
        repeats: options.repeats,
    });
    let suite = Suite::new(
        definition,
        SuiteOptions {
            parallelism: options.parallelism,
            retries: options.retries,
        },
    )
    .with_analysis(options.analysis.to_options()?);

    let directory = SuiteDirectory::create(&options.suite_directory, suite.name())
        .context("Failed to create suite directory")?;
    info!(path = ?directory.path(), "Created suite directory");

    let (abort, aborted) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received interrupt, stopping suite");
            let _ = abort.send(true);
        }
    });

    let report = suite.run_suite(&provisioner, &directory, aborted).await?;
    for failure in &report.failures {
        warn!(
            trial = %failure.trial,
            kind = ?failure.kind,
            reason = %failure.reason,
            "Failed trial"
        );
    }
    info!(
        succeeded = report.rows.len(),
        failed = report.failures.len(),
        skipped = report.skipped,
        path = ?directory.path(),
        "Suite done"
    );
    Ok(())
}
