use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use paxbench_stats::SampleRecorder;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::watch,
    time::{sleep, timeout, timeout_at, Instant},
};
use tracing::{info, instrument, warn};

use crate::{
    directory::{Artifact, SuiteDirectory, TrialId, TrialSlot},
    error::TrialError,
    input::Input,
    output::{AnalysisOptions, Output},
    provision::{Cluster, Provisioner},
    scrape::{MetricsTable, Scraper, ScraperHandle},
};

/// How long a failed trial gets to hand over whatever samples it has.
const SALVAGE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    Provisioning,
    Warming,
    Running,
    Collecting,
    Finalized,
    TimedOut,
    Failed,
    Cancelled,
}

impl TrialState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finalized | Self::TimedOut | Self::Failed | Self::Cancelled
        )
    }

    fn of_error(error: &TrialError) -> Self {
        match error {
            TrialError::Timeout { .. } => Self::TimedOut,
            TrialError::Cancelled => Self::Cancelled,
            _ => Self::Failed,
        }
    }
}

/// Final state of a trial, persisted as `status.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialStatus {
    pub state: TrialState,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub num_samples: usize,
}

fn enter(state: TrialState) {
    info!(?state, "Trial state changed");
}

enum Guarded<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Runs `future` until it finishes, the deadline passes or an abort is raised.
async fn guarded<F: Future>(
    deadline: Instant,
    abort: &mut watch::Receiver<bool>,
    future: F,
) -> Guarded<F::Output> {
    tokio::select! {
        biased;
        _ = aborted(abort) => Guarded::Cancelled,
        result = timeout_at(deadline, future) => match result {
            Ok(output) => Guarded::Done(output),
            Err(_) => Guarded::TimedOut,
        },
    }
}

async fn aborted(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            // nobody can abort any more
            std::future::pending::<()>().await;
        }
    }
}

/// Runs single trials against clusters from a [`Provisioner`], recording
/// everything into a [`SuiteDirectory`].
pub struct TrialRunner<'a, P> {
    provisioner: &'a P,
    directory: &'a SuiteDirectory,
    analysis: AnalysisOptions,
    abort: watch::Receiver<bool>,
}

impl<'a, P: Provisioner> TrialRunner<'a, P> {
    pub fn new(provisioner: &'a P, directory: &'a SuiteDirectory, analysis: AnalysisOptions) -> Self {
        Self {
            provisioner,
            directory,
            analysis,
            abort: watch::channel(false).1,
        }
    }

    /// Trials cancel as soon as `abort` reads true.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = abort;
        self
    }

    #[instrument(skip_all, fields(trial = %slot.id(), f = input.f, clients = input.num_clients()))]
    pub async fn run(&self, slot: &TrialSlot, input: &Input) -> Result<Output, TrialError> {
        let trial = slot.id();
        let started_at = Utc::now();
        self.directory.persist(trial, Artifact::Input(input))?;

        if let Err(error) = input.validate() {
            let error = TrialError::from(error);
            self.finish(trial, &Err(&error), started_at, 0)?;
            return Err(error);
        }

        let recorder = SampleRecorder::new();
        let (result, metrics) = self.execute(slot, input, &recorder).await;

        let log = recorder.finish().sorted();
        self.directory.persist(trial, Artifact::Log(&log))?;
        if let Some(metrics) = &metrics {
            self.directory.persist(trial, Artifact::Metrics(metrics))?;
        }

        match result {
            Ok(()) => {
                let output = Output::compute(trial, &log, metrics.as_ref(), &self.analysis);
                self.directory.persist(trial, Artifact::Output(&output))?;
                self.finish(trial, &Ok(()), started_at, log.len())?;
                enter(TrialState::Finalized);
                info!(
                    samples = output.num_samples,
                    median_latency_ms = output.median_latency_ms(),
                    median_throughput = output.median_1_second_throughput(),
                    "Finished trial"
                );
                Ok(output)
            }
            Err(error) => {
                self.finish(trial, &Err(&error), started_at, log.len())?;
                enter(TrialState::of_error(&error));
                warn!(%error, samples = log.len(), "Trial failed");
                Err(error)
            }
        }
    }

    fn finish(
        &self,
        trial: TrialId,
        result: &Result<(), &TrialError>,
        started_at: DateTime<Utc>,
        num_samples: usize,
    ) -> Result<(), TrialError> {
        let status = TrialStatus {
            state: match result {
                Ok(()) => TrialState::Finalized,
                Err(error) => TrialState::of_error(error),
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            started_at,
            finished_at: Utc::now(),
            num_samples,
        };
        self.directory.persist(trial, Artifact::Status(&status))?;
        Ok(())
    }

    /// Everything between provisioning and teardown. The cluster is torn down and
    /// the scraper stopped before this returns, and a failed trial's samples are
    /// salvaged once nothing is running any more.
    async fn execute(
        &self,
        slot: &TrialSlot,
        input: &Input,
        recorder: &SampleRecorder,
    ) -> (Result<(), TrialError>, Option<MetricsTable>) {
        let start = Instant::now();
        let deadline = start + input.timeout;
        let timed_out = || TrialError::Timeout {
            timeout: input.timeout,
            elapsed: start.elapsed(),
        };
        let mut abort = self.abort.clone();

        let topology = input.topology();
        enter(TrialState::Provisioning);
        info!(processes = topology.total_processes(), "Provisioning cluster");
        let provisioned = guarded(
            deadline,
            &mut abort,
            self.provisioner.provision(&topology, slot),
        )
        .await;
        let mut cluster = match provisioned {
            Guarded::Done(Ok(cluster)) => cluster,
            Guarded::Done(Err(error)) => return (Err(error.into()), None),
            Guarded::TimedOut => return (Err(timed_out()), None),
            Guarded::Cancelled => return (Err(TrialError::Cancelled), None),
        };

        let mut scraper = None;
        let driven = guarded(
            deadline,
            &mut abort,
            drive(&mut cluster, input, recorder, &mut scraper),
        )
        .await;
        let result = match driven {
            Guarded::Done(result) => result,
            Guarded::TimedOut => Err(timed_out()),
            Guarded::Cancelled => Err(TrialError::Cancelled),
        };

        cluster.teardown().await;
        if result.is_err() && recorder.is_empty() {
            match timeout(SALVAGE_GRACE, cluster.collect(recorder)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => warn!(%error, "Failed to salvage samples"),
                Err(_) => warn!("Gave up salvaging samples"),
            }
            info!(samples = recorder.len(), "Salvaged samples");
        }
        let metrics = match scraper {
            Some(scraper) => Some(scraper.stop().await),
            None => None,
        };
        (result, metrics)
    }
}

async fn drive<C: Cluster>(
    cluster: &mut C,
    input: &Input,
    recorder: &SampleRecorder,
    scraper: &mut Option<ScraperHandle>,
) -> Result<(), TrialError> {
    enter(TrialState::Warming);
    sleep(input.client_lag).await;

    enter(TrialState::Running);
    if input.monitored {
        *scraper = Some(
            Scraper::new(cluster.metrics_endpoints(), input.prometheus_scrape_interval).spawn(),
        );
    }
    cluster.start_clients().await?;
    sleep(input.duration).await;

    enter(TrialState::Collecting);
    cluster.stop_clients().await?;
    cluster.collect(recorder).await?;
    info!(samples = recorder.len(), "Collected samples");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!TrialState::Running.is_terminal());
        assert!(TrialState::TimedOut.is_terminal());
        assert_eq!(
            TrialState::of_error(&TrialError::Cancelled),
            TrialState::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn guard_times_out() {
        let (_tx, mut abort) = watch::channel(false);
        let deadline = Instant::now() + Duration::from_secs(1);
        let guarded = guarded(deadline, &mut abort, sleep(Duration::from_secs(2))).await;
        assert!(matches!(guarded, Guarded::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn guard_cancels() {
        let (tx, mut abort) = watch::channel(false);
        let deadline = Instant::now() + Duration::from_secs(10);
        let cancel = async move {
            sleep(Duration::from_secs(1)).await;
            tx.send(true).ok();
            sleep(Duration::from_secs(100)).await;
        };
        let guarded = guarded(deadline, &mut abort, async {
            tokio::join!(cancel, sleep(Duration::from_secs(5)));
        })
        .await;
        assert!(matches!(guarded, Guarded::Cancelled));
    }
}
